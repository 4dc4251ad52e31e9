use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use super::{require_collection, ApiError, ApiJson, AppState};
use crate::models::{CollectionCreate, CollectionList, CollectionResponse, CollectionUpdate};
use crate::store::{validate_collection_name, CollectionInfo};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/collections", get(list_collections).post(create_collection))
        .route(
            "/collections/:name",
            get(get_collection)
                .put(update_collection)
                .delete(delete_collection),
        )
}

fn to_response(info: CollectionInfo) -> CollectionResponse {
    CollectionResponse {
        name: info.name,
        description: info.description,
    }
}

async fn create_collection(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CollectionCreate>,
) -> Result<(StatusCode, ApiJson<CollectionResponse>), ApiError> {
    let name = request.name.trim();
    validate_collection_name(name).map_err(|err| ApiError::bad_request(err.to_string()))?;

    let exists = state
        .store
        .collection_exists(name)
        .await
        .map_err(ApiError::failed("create collection"))?;
    if exists {
        return Err(ApiError::bad_request(format!(
            "Collection {name} already exists"
        )));
    }

    let info = state
        .store
        .create_collection(name, request.description.as_deref())
        .await
        .map_err(ApiError::failed("create collection"))?;
    tracing::info!("created collection {}", info.name);
    Ok((StatusCode::CREATED, ApiJson(to_response(info))))
}

async fn list_collections(
    State(state): State<AppState>,
) -> Result<ApiJson<CollectionList>, ApiError> {
    let collections = state
        .store
        .list_collections()
        .await
        .map_err(ApiError::failed("list collections"))?;
    Ok(ApiJson(CollectionList {
        collections: collections.into_iter().map(|info| info.name).collect(),
    }))
}

async fn get_collection(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<ApiJson<CollectionResponse>, ApiError> {
    let info = state
        .store
        .get_collection(&name)
        .await
        .map_err(ApiError::failed("get collection"))?
        .ok_or_else(|| ApiError::not_found(format!("Collection {name} not found")))?;
    Ok(ApiJson(to_response(info)))
}

async fn update_collection(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ApiJson(request): ApiJson<CollectionUpdate>,
) -> Result<ApiJson<CollectionResponse>, ApiError> {
    require_collection(&state, &name).await?;
    let info = state
        .store
        .update_collection(&name, request.description.as_deref())
        .await
        .map_err(ApiError::failed("update collection"))?;
    Ok(ApiJson(to_response(info)))
}

async fn delete_collection(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_collection(&state, &name).await?;
    state
        .store
        .delete_collection(&name)
        .await
        .map_err(ApiError::failed("delete collection"))?;
    tracing::info!("deleted collection {}", name);
    Ok(StatusCode::NO_CONTENT)
}
