use std::collections::{BTreeMap, HashMap, HashSet};

use axum::extract::State;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::Value;

use super::{require_collection, ApiError, ApiJson, ApiQuery, AppState};
use crate::filter::Filter;
use crate::models::{
    Metadata, QueryResponse, QueryResult, TagListResponse, TagQueryRequest, TagSuggestRequest,
    TagSuggestResponse, TaggedDocument, TaggedDocumentList,
};
use crate::rag::{similarity, RetrievalScope};
use crate::store::GetRequest;
use crate::tags::{self, HAS_TAGS_KEY};

// Chunk-level keys that would be misleading on a per-source summary.
const CHUNK_KEYS: [&str; 4] = ["chunk", "page", "row", tags::TAGS_KEY];

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/tags", get(list_tags))
        .route("/tags/query", post(query_by_tags))
        .route("/tags/documents", get(documents_by_tags))
        .route("/tags/suggest", post(suggest_tags))
}

#[derive(Debug, Deserialize)]
struct TagListParams {
    #[serde(default)]
    collection_name: Option<String>,
}

/// `tags` may be a comma list, repeated (`?tags=a&tags=b`), or both.
#[derive(Debug, Default)]
struct TaggedDocumentParams {
    tags: Vec<String>,
    include_untagged: bool,
    limit: Option<usize>,
    collection_name: Option<String>,
}

impl TaggedDocumentParams {
    fn from_pairs(pairs: Vec<(String, String)>) -> Result<Self, ApiError> {
        let mut params = Self {
            include_untagged: true,
            ..Self::default()
        };
        let mut raw_tags = Vec::new();

        for (key, value) in pairs {
            match key.as_str() {
                "tags" => raw_tags.extend(tags::parse_tag_list(&value)),
                "include_untagged" => {
                    params.include_untagged = value.trim().parse().map_err(|_| {
                        ApiError::bad_request(format!("include_untagged must be true or false, got {value:?}"))
                    })?
                }
                "limit" => {
                    params.limit = Some(value.trim().parse().map_err(|_| {
                        ApiError::bad_request(format!("limit must be a non-negative integer, got {value:?}"))
                    })?)
                }
                "collection_name" => params.collection_name = Some(value),
                _ => {}
            }
        }

        params.tags = tags::dedup_tags(raw_tags);
        Ok(params)
    }
}

async fn collections_in_scope(state: &AppState, name: Option<&str>) -> Result<Vec<String>, ApiError> {
    match name.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => {
            require_collection(state, name).await?;
            Ok(vec![name.to_string()])
        }
        None => Ok(state
            .store
            .list_collections()
            .await
            .map_err(ApiError::failed("list collections"))?
            .into_iter()
            .map(|info| info.name)
            .collect()),
    }
}

/// Number of distinct documents (collection + source) carrying each tag.
pub(super) async fn tag_counts(
    state: &AppState,
    collection: Option<&str>,
) -> Result<BTreeMap<String, usize>, ApiError> {
    let mut seen: HashSet<(String, String, String)> = HashSet::new();
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();

    for name in collections_in_scope(state, collection).await? {
        let records = state
            .store
            .get(&name, GetRequest::filtered(Some(Filter::eq(HAS_TAGS_KEY, true))))
            .await
            .map_err(ApiError::failed("retrieve tags"))?;

        for record in records {
            let source = record
                .metadata
                .get("source")
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string();
            for tag in tags::tags_from_metadata(&record.metadata) {
                if seen.insert((name.clone(), source.clone(), tag.clone())) {
                    *counts.entry(tag).or_default() += 1;
                }
            }
        }
    }

    Ok(counts)
}

async fn list_tags(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<TagListParams>,
) -> Result<ApiJson<TagListResponse>, ApiError> {
    let tag_counts = tag_counts(&state, params.collection_name.as_deref()).await?;
    Ok(ApiJson(TagListResponse {
        tags: tag_counts.keys().cloned().collect(),
        tag_counts,
    }))
}

async fn query_by_tags(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<TagQueryRequest>,
) -> Result<ApiJson<QueryResponse>, ApiError> {
    if request.query_text.trim().is_empty() {
        return Err(ApiError::bad_request("query_text must not be empty"));
    }
    let scope = RetrievalScope::from_request(request.collection_name.as_deref());
    if let RetrievalScope::Collection(name) = &scope {
        require_collection(&state, name).await?;
    }

    let filter = Filter::for_tags(
        request.tags.as_deref().unwrap_or_default(),
        request.include_untagged,
    );
    let passages = state
        .rag
        .retrieve(&request.query_text, &scope, request.n_results, filter.as_ref())
        .await
        .map_err(ApiError::failed("query by tags"))?;

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

async fn documents_by_tags(
    State(state): State<AppState>,
    ApiQuery(pairs): ApiQuery<Vec<(String, String)>>,
) -> Result<ApiJson<TaggedDocumentList>, ApiError> {
    let params = TaggedDocumentParams::from_pairs(pairs)?;
    let filter = Filter::for_tags(&params.tags, params.include_untagged);

    let mut documents: Vec<TaggedDocument> = Vec::new();
    let mut positions: HashMap<(String, String), usize> = HashMap::new();

    for name in collections_in_scope(&state, params.collection_name.as_deref()).await? {
        let records = state
            .store
            .get(&name, GetRequest::filtered(filter.clone()))
            .await
            .map_err(ApiError::failed("get documents by tags"))?;

        for record in records {
            let source = record
                .metadata
                .get("source")
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string();
            let key = (name.clone(), source.clone());
            if let Some(&index) = positions.get(&key) {
                documents[index].total_chunks += 1;
                continue;
            }

            let metadata: Metadata = record
                .metadata
                .iter()
                .filter(|(key, _)| {
                    !CHUNK_KEYS.contains(&key.as_str()) && !tags::is_internal_key(key)
                })
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            positions.insert(key, documents.len());
            documents.push(TaggedDocument {
                source,
                collection: name.clone(),
                total_chunks: 1,
                tags: tags::tags_from_metadata(&record.metadata),
                metadata,
            });
        }
    }

    if let Some(limit) = params.limit {
        documents.truncate(limit);
    }
    let total = documents.len();
    Ok(ApiJson(TaggedDocumentList { documents, total }))
}

async fn suggest_tags(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<TagSuggestRequest>,
) -> Result<ApiJson<TagSuggestResponse>, ApiError> {
    if request.texts.iter().all(|text| text.trim().is_empty()) {
        return Err(ApiError::bad_request("texts must contain at least one non-empty entry"));
    }
    if request.max_tags == 0 {
        return Err(ApiError::bad_request("max_tags must be at least 1"));
    }

    let existing = match request.existing_tags {
        Some(existing) => existing,
        None => {
            // Most used first, so the prompt's shortlist favours established tags.
            let mut known: Vec<(String, usize)> = tag_counts(&state, None).await?.into_iter().collect();
            known.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            known.into_iter().map(|(tag, _)| tag).collect()
        }
    };

    let tags = state
        .rag
        .suggest_tags(&request.texts, &existing, request.model.as_deref(), request.max_tags)
        .await
        .map_err(ApiError::failed("suggest tags"))?;
    Ok(ApiJson(TagSuggestResponse { tags }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn tag_params_accept_repeated_and_comma_separated_tags() {
        let params = TaggedDocumentParams::from_pairs(pairs(&[
            ("tags", "Pool, rules"),
            ("tags", "pets"),
            ("tags", "rules"),
            ("limit", "10"),
        ]))
        .unwrap();
        assert_eq!(params.tags, vec!["pool", "rules", "pets"]);
        assert!(params.include_untagged);
        assert_eq!(params.limit, Some(10));
        assert_eq!(params.collection_name, None);
    }

    #[test]
    fn tag_params_reject_malformed_values() {
        let err = TaggedDocumentParams::from_pairs(pairs(&[("include_untagged", "maybe")])).unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        assert!(TaggedDocumentParams::from_pairs(pairs(&[("limit", "-1")])).is_err());

        let params = TaggedDocumentParams::from_pairs(pairs(&[("include_untagged", "false")])).unwrap();
        assert!(!params.include_untagged);
    }
}
