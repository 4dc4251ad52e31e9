use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiError, ApiJson, ApiQuery, AppState};
use crate::models::{
    Conversation, ConversationCreate, ConversationList, ConversationUpdate, TitleGenerationRequest,
    TitleGenerationResponse,
};

const MAX_PAGE_SIZE: i64 = 1000;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/conversations/generate-title", post(generate_title))
        .route(
            "/conversations/:id",
            get(get_conversation)
                .put(update_conversation)
                .delete(delete_conversation),
        )
}

#[derive(Debug, Deserialize)]
struct PageParams {
    #[serde(default)]
    skip: i64,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

fn not_found(id: &str) -> ApiError {
    ApiError::not_found(format!("Conversation {id} not found"))
}

async fn create_conversation(
    State(state): State<AppState>,
    ApiJson(mut request): ApiJson<ConversationCreate>,
) -> Result<ApiJson<Conversation>, ApiError> {
    let untitled = request
        .title
        .as_deref()
        .map_or(true, |title| title.trim().is_empty());
    if untitled && request.messages.iter().any(|message| message.role == "user") {
        let title = state
            .rag
            .generate_title(&request.messages, request.model.as_deref())
            .await;
        request.title = Some(title);
    }

    let conversation = state
        .db
        .create_conversation(&request)
        .await
        .map_err(ApiError::failed("create conversation"))?;
    tracing::info!("created conversation {}", conversation.id);
    Ok(ApiJson(conversation))
}

async fn list_conversations(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<PageParams>,
) -> Result<ApiJson<ConversationList>, ApiError> {
    if params.skip < 0 {
        return Err(ApiError::bad_request("skip must be at least 0"));
    }
    if !(1..=MAX_PAGE_SIZE).contains(&params.limit) {
        return Err(ApiError::bad_request(format!(
            "limit must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }

    let (conversations, total) = state
        .db
        .list_conversations(params.skip, params.limit)
        .await
        .map_err(ApiError::failed("list conversations"))?;
    Ok(ApiJson(ConversationList {
        conversations,
        total,
    }))
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ApiJson<Conversation>, ApiError> {
    state
        .db
        .get_conversation(&id)
        .await
        .map_err(ApiError::failed("get conversation"))?
        .map(ApiJson)
        .ok_or_else(|| not_found(&id))
}

async fn update_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(update): ApiJson<ConversationUpdate>,
) -> Result<ApiJson<Conversation>, ApiError> {
    state
        .db
        .update_conversation(&id, &update)
        .await
        .map_err(ApiError::failed("update conversation"))?
        .map(ApiJson)
        .ok_or_else(|| not_found(&id))
}

async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ApiJson<Value>, ApiError> {
    let deleted = state
        .db
        .delete_conversation(&id)
        .await
        .map_err(ApiError::failed("delete conversation"))?;
    if !deleted {
        return Err(not_found(&id));
    }
    Ok(ApiJson(json!({
        "message": format!("Conversation {id} deleted successfully")
    })))
}

async fn generate_title(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<TitleGenerationRequest>,
) -> ApiJson<TitleGenerationResponse> {
    let title = state
        .rag
        .generate_title(&request.messages, request.model.as_deref())
        .await;
    ApiJson(TitleGenerationResponse { title })
}
