use std::path::Path as FsPath;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::Value;

use super::{require_collection, ApiError, ApiJson, ApiQuery, AppState};
use crate::filter::Filter;
use crate::models::{
    DeleteBySourceResponse, DocumentList, DocumentMetadata, DocumentResponse, Metadata, QueryRequest,
    QueryResponse, QueryResult, TextInput, UploadResponse,
};
use crate::rag::{similarity, RetrievalScope};
use crate::store::{validate_collection_name, GetRequest, StoredRecord};
use crate::tags;

const RESERVED_KEYS: [&str; 5] = ["source", "chunk", "total_chunks", "page", tags::TAGS_KEY];

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/documents/upload", post(upload_document))
        .route("/documents/text", post(add_text))
        .route("/documents/query", post(query_documents))
        .route(
            "/documents/:collection",
            get(list_documents).delete(delete_by_source),
        )
        .route(
            "/documents/:collection/:id",
            get(get_document).delete(delete_document),
        )
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    source: Option<String>,
}

fn default_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
struct SourceParams {
    #[serde(default)]
    source: Option<String>,
}

/// Splits stored metadata into the well-known fields and everything else.
pub(super) fn document_response(record: StoredRecord) -> DocumentResponse {
    let metadata = &record.metadata;
    let tag_list = tags::tags_from_metadata(metadata);
    let additional_metadata: Metadata = metadata
        .iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()) && !tags::is_internal_key(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    DocumentResponse {
        metadata: DocumentMetadata {
            source: metadata
                .get("source")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            chunk: metadata.get("chunk").and_then(Value::as_i64),
            total_chunks: metadata.get("total_chunks").and_then(Value::as_i64),
            page: metadata.get("page").and_then(Value::as_i64),
            tags: (!tag_list.is_empty()).then_some(tag_list),
            additional_metadata,
        },
        id: record.id,
        text: record.text,
    }
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::new(err.status(), format!("Invalid upload: {}", err.body_text()))
}

async fn upload_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, ApiJson<UploadResponse>), ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut collection_name: Option<String> = None;
    let mut tags_raw: Option<String> = None;
    let mut metadata_raw: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field
                    .file_name()
                    .and_then(|raw| FsPath::new(raw).file_name())
                    .and_then(|base| base.to_str())
                    .unwrap_or("upload.txt")
                    .to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                file = Some((file_name, bytes.to_vec()));
            }
            "collection_name" => collection_name = Some(field.text().await.map_err(multipart_error)?),
            "tags" => tags_raw = Some(field.text().await.map_err(multipart_error)?),
            "additional_metadata" => {
                metadata_raw = Some(field.text().await.map_err(multipart_error)?)
            }
            other => tracing::debug!("ignoring multipart field {}", other),
        }
    }

    let (file_name, bytes) = file.ok_or_else(|| ApiError::bad_request("Missing file field"))?;
    let collection_name = collection_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing collection_name field"))?;
    validate_collection_name(&collection_name)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    let metadata = match metadata_raw.as_deref().map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(ApiError::bad_request("additional_metadata must be a JSON object")),
            Err(_) => return Err(ApiError::bad_request("Invalid JSON in additional_metadata")),
        },
        None => Metadata::new(),
    };
    let tag_list = tags_raw.as_deref().map(tags::parse_tag_list).unwrap_or_default();

    let chunks = state
        .ingestor
        .ingest_file(&collection_name, &file_name, bytes, metadata, &tag_list)
        .await
        .map_err(ApiError::failed("upload document"))?;

    Ok((
        StatusCode::CREATED,
        ApiJson(UploadResponse {
            status: "success".to_string(),
            message: format!("Document '{file_name}' uploaded and processed successfully"),
            chunks,
            collection: collection_name,
        }),
    ))
}

async fn add_text(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<TextInput>,
) -> Result<(StatusCode, ApiJson<UploadResponse>), ApiError> {
    if input.text.trim().is_empty() {
        return Err(ApiError::bad_request("Text must not be empty"));
    }
    let collection_name = input.collection_name.trim().to_string();
    validate_collection_name(&collection_name)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    let metadata = input.metadata.unwrap_or_default();
    let source = metadata
        .get("source")
        .and_then(Value::as_str)
        .map(str::to_string);
    let tag_list = input.tags.unwrap_or_default();

    let prepared = state
        .ingestor
        .process_text(&input.text, source.as_deref(), metadata, &tag_list)
        .map_err(ApiError::failed("add text"))?;
    let chunks = state
        .ingestor
        .index(&collection_name, prepared)
        .await
        .map_err(ApiError::failed("add text"))?;

    Ok((
        StatusCode::CREATED,
        ApiJson(UploadResponse {
            status: "success".to_string(),
            message: "Text added successfully".to_string(),
            chunks,
            collection: collection_name,
        }),
    ))
}

async fn list_documents(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    ApiQuery(params): ApiQuery<ListParams>,
) -> Result<ApiJson<DocumentList>, ApiError> {
    require_collection(&state, &collection).await?;

    let source = params
        .source
        .as_deref()
        .map(str::trim)
        .filter(|source| !source.is_empty());

    let (documents, total) = match source {
        Some(source) => {
            let records = state
                .store
                .get(&collection, GetRequest::filtered(Some(Filter::eq("source", source))))
                .await
                .map_err(ApiError::failed("list documents"))?;
            let total = records.len();
            let page = records
                .into_iter()
                .skip(params.offset)
                .take(params.limit)
                .collect::<Vec<_>>();
            (page, total)
        }
        None => {
            let total = state
                .store
                .count(&collection)
                .await
                .map_err(ApiError::failed("list documents"))?;
            let request = GetRequest {
                limit: Some(params.limit),
                offset: Some(params.offset),
                ..GetRequest::default()
            };
            let page = state
                .store
                .get(&collection, request)
                .await
                .map_err(ApiError::failed("list documents"))?;
            (page, total)
        }
    };

    Ok(ApiJson(DocumentList {
        documents: documents.into_iter().map(document_response).collect(),
        total,
    }))
}

async fn delete_by_source(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    ApiQuery(params): ApiQuery<SourceParams>,
) -> Result<ApiJson<DeleteBySourceResponse>, ApiError> {
    let source = params
        .source
        .map(|source| source.trim().to_string())
        .filter(|source| !source.is_empty())
        .ok_or_else(|| ApiError::bad_request("The source query parameter is required"))?;
    require_collection(&state, &collection).await?;

    let ids: Vec<String> = state
        .store
        .get(&collection, GetRequest::filtered(Some(Filter::eq("source", source.as_str()))))
        .await
        .map_err(ApiError::failed("delete documents"))?
        .into_iter()
        .map(|record| record.id)
        .collect();

    if !ids.is_empty() {
        state
            .store
            .delete(&collection, &ids)
            .await
            .map_err(ApiError::failed("delete documents"))?;
    }
    tracing::info!("deleted {} chunks of {} from {}", ids.len(), source, collection);

    Ok(ApiJson(DeleteBySourceResponse {
        deleted: ids.len(),
        source,
    }))
}

async fn fetch_document(
    state: &AppState,
    collection: &str,
    id: &str,
) -> Result<StoredRecord, ApiError> {
    require_collection(state, collection).await?;
    state
        .store
        .get(collection, GetRequest::ids(vec![id.to_string()]))
        .await
        .map_err(ApiError::failed("get document"))?
        .into_iter()
        .next()
        .ok_or_else(|| {
            ApiError::not_found(format!("Document {id} not found in collection {collection}"))
        })
}

async fn get_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<ApiJson<DocumentResponse>, ApiError> {
    let record = fetch_document(&state, &collection, &id).await?;
    Ok(ApiJson(document_response(record)))
}

async fn delete_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let record = fetch_document(&state, &collection, &id).await?;
    state
        .store
        .delete(&collection, &[record.id])
        .await
        .map_err(ApiError::failed("delete document"))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn query_documents(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<QueryRequest>,
) -> Result<ApiJson<QueryResponse>, ApiError> {
    if request.query_text.trim().is_empty() {
        return Err(ApiError::bad_request("query_text must not be empty"));
    }
    let filter = request
        .filter
        .as_ref()
        .map(Filter::from_json)
        .transpose()
        .map_err(|err| ApiError::bad_request(format!("Invalid where filter: {err}")))?;
    require_collection(&state, &request.collection_name).await?;

    let scope = RetrievalScope::Collection(request.collection_name.clone());
    let passages = state
        .rag
        .retrieve(&request.query_text, &scope, request.n_results, filter.as_ref())
        .await
        .map_err(ApiError::failed("query documents"))?;

    Ok(ApiJson(QueryResponse {
        results: passages
            .into_iter()
            .map(|passage| QueryResult {
                id: passage.id,
                text: passage.text,
                metadata: passage.metadata,
                score: similarity(passage.distance),
            })
            .collect(),
        query: request.query_text,
    }))
}
