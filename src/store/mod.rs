mod chroma;
mod memory;

use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::{AppConfig, VectorStoreKind};
use crate::filter::Filter;
use crate::models::Metadata;

pub use chroma::ChromaStore;
pub use memory::MemoryStore;

#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub text: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default)]
pub struct GetRequest {
    pub ids: Option<Vec<String>>,
    pub filter: Option<Filter>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub include_embeddings: bool,
}

impl GetRequest {
    pub fn ids(ids: Vec<String>) -> Self {
        Self {
            ids: Some(ids),
            ..Self::default()
        }
    }

    pub fn filtered(filter: Option<Filter>) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct QueryHit {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    pub distance: f32,
}

/// Backend holding embedded chunks grouped into named collections.
///
/// Operations on a collection that does not exist fail, except `get_collection`,
/// which reports absence as `None`.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn heartbeat(&self) -> Result<()>;

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>>;

    async fn get_collection(&self, name: &str) -> Result<Option<CollectionInfo>>;

    async fn create_collection(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<CollectionInfo>;

    async fn update_collection(&self, name: &str, description: Option<&str>)
        -> Result<CollectionInfo>;

    async fn delete_collection(&self, name: &str) -> Result<()>;

    async fn count(&self, name: &str) -> Result<usize>;

    async fn upsert(&self, name: &str, records: Vec<VectorRecord>) -> Result<()>;

    async fn get(&self, name: &str, request: GetRequest) -> Result<Vec<StoredRecord>>;

    /// Nearest neighbours, ascending by distance.
    async fn query(
        &self,
        name: &str,
        embedding: &[f32],
        n_results: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<QueryHit>>;

    async fn delete(&self, name: &str, ids: &[String]) -> Result<()>;

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.get_collection(name).await?.is_some())
    }

    fn name(&self) -> &str;
}

pub fn from_config(config: &AppConfig) -> Arc<dyn VectorStore> {
    match config.vector_store {
        VectorStoreKind::Chroma => Arc::new(ChromaStore::new(config.chroma_base_url.clone())),
        VectorStoreKind::Memory => {
            tracing::warn!("using the in-memory vector store, documents are lost on restart");
            Arc::new(MemoryStore::new())
        }
    }
}

pub fn validate_collection_name(name: &str) -> Result<()> {
    let length = name.chars().count();
    if !(3..=63).contains(&length) {
        bail!("collection name must be between 3 and 63 characters long");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        bail!("collection name may only contain letters, digits, '.', '_' and '-'");
    }

    let starts = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    let ends = name.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
    if !starts || !ends {
        bail!("collection name must start and end with a letter or digit");
    }
    if name.contains("..") {
        bail!("collection name must not contain two consecutive periods");
    }
    if name.parse::<Ipv4Addr>().is_ok() {
        bail!("collection name must not be a valid IPv4 address");
    }

    Ok(())
}

pub(crate) fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_chroma_style_names() {
        for name in ["documents", "my-docs_2", "a.b.c", "abc"] {
            assert!(validate_collection_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_invalid_names() {
        for name in ["ab", "-docs", "docs-", "my..docs", "has space", "10.0.0.1", ""] {
            assert!(validate_collection_name(name).is_err(), "{name}");
        }
        assert!(validate_collection_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn cosine_distance_bounds() {
        assert!(cosine_distance(&[1.0, 0.0], &[1.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&[1.0], &[1.0, 2.0]), 1.0);
    }
}
