use std::collections::BTreeMap;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use serde_json::Value;

use super::{ApiError, ApiJson, AppState};
use crate::models::MigrationStats;
use crate::store::{GetRequest, VectorRecord, VectorStore};

pub const MAIN_COLLECTION: &str = "documents";
const PAGE_SIZE: usize = 500;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/migration/migrate-documents", post(migrate_documents))
        .route("/migration/collections-status", get(collections_status))
}

#[derive(Debug, Serialize)]
struct MigrationResponse {
    status: String,
    message: String,
    stats: MigrationStats,
}

#[derive(Debug, Serialize)]
struct CollectionStatus {
    document_count: usize,
    is_main_collection: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct CollectionsStatusResponse {
    collections: BTreeMap<String, CollectionStatus>,
    main_collection_exists: bool,
    migration_needed: bool,
    total_collections: usize,
}

/// Copies every record of `source` into the main collection, embeddings included.
async fn migrate_collection(store: &dyn VectorStore, source: &str) -> Result<usize> {
    let mut migrated = 0;
    let mut offset = 0;

    loop {
        let request = GetRequest {
            limit: Some(PAGE_SIZE),
            offset: Some(offset),
            include_embeddings: true,
            ..GetRequest::default()
        };
        let page = store.get(source, request).await?;
        let fetched = page.len();

        let records = page
            .into_iter()
            .map(|record| {
                let embedding = record
                    .embedding
                    .with_context(|| format!("record {} has no stored embedding", record.id))?;
                let mut metadata = record.metadata;
                metadata.insert(
                    "original_collection".to_string(),
                    Value::String(source.to_string()),
                );
                Ok(VectorRecord {
                    id: record.id,
                    embedding,
                    text: record.text,
                    metadata,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if !records.is_empty() {
            migrated += records.len();
            store.upsert(MAIN_COLLECTION, records).await?;
        }
        if fetched < PAGE_SIZE {
            break;
        }
        offset += fetched;
    }

    Ok(migrated)
}

async fn migrate_documents(
    State(state): State<AppState>,
) -> Result<ApiJson<MigrationResponse>, ApiError> {
    let store = state.store.as_ref();
    let collections = store
        .list_collections()
        .await
        .map_err(ApiError::failed("migrate documents"))?;

    if !collections.iter().any(|info| info.name == MAIN_COLLECTION) {
        store
            .create_collection(MAIN_COLLECTION, Some("Main document collection"))
            .await
            .map_err(ApiError::failed("migrate documents"))?;
    }

    let mut stats = MigrationStats::default();
    for info in collections.iter().filter(|info| info.name != MAIN_COLLECTION) {
        match migrate_collection(store, &info.name).await {
            Ok(count) => {
                stats.collections_processed += 1;
                stats.documents_migrated += count;
                tracing::info!("migrated {} documents from {}", count, info.name);
            }
            Err(err) => {
                stats.errors += 1;
                tracing::warn!("migration of collection {} failed: {:#}", info.name, err);
            }
        }
    }

    Ok(ApiJson(MigrationResponse {
        status: "success".to_string(),
        message: format!(
            "Migration completed. Processed {} collections, migrated {} documents with {} errors.",
            stats.collections_processed, stats.documents_migrated, stats.errors
        ),
        stats,
    }))
}

async fn collections_status(
    State(state): State<AppState>,
) -> Result<ApiJson<CollectionsStatusResponse>, ApiError> {
    let collections = state
        .store
        .list_collections()
        .await
        .map_err(ApiError::failed("get collection status"))?;

    let mut statuses = BTreeMap::new();
    for info in &collections {
        let is_main_collection = info.name == MAIN_COLLECTION;
        let status = match state.store.count(&info.name).await {
            Ok(document_count) => CollectionStatus {
                document_count,
                is_main_collection,
                error: None,
            },
            Err(err) => CollectionStatus {
                document_count: 0,
                is_main_collection,
                error: Some(format!("{err:#}")),
            },
        };
        statuses.insert(info.name.clone(), status);
    }

    Ok(ApiJson(CollectionsStatusResponse {
        main_collection_exists: statuses.contains_key(MAIN_COLLECTION),
        migration_needed: collections.iter().any(|info| info.name != MAIN_COLLECTION),
        total_collections: collections.len(),
        collections: statuses,
    }))
}
