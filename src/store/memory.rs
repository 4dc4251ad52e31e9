use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    cosine_distance, CollectionInfo, GetRequest, QueryHit, StoredRecord, VectorRecord,
    VectorStore,
};
use crate::filter::Filter;

#[derive(Default)]
struct MemoryCollection {
    description: Option<String>,
    // Insertion order keeps paging stable.
    order: Vec<String>,
    records: HashMap<String, VectorRecord>,
}

/// In-process store used for local development and tests. Queries scan every record.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<BTreeMap<String, MemoryCollection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(name: &str) -> anyhow::Error {
    anyhow!("collection {name} does not exist")
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn heartbeat(&self) -> Result<()> {
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        Ok(self
            .collections
            .read()
            .iter()
            .map(|(name, collection)| CollectionInfo {
                name: name.clone(),
                description: collection.description.clone(),
            })
            .collect())
    }

    async fn get_collection(&self, name: &str) -> Result<Option<CollectionInfo>> {
        Ok(self
            .collections
            .read()
            .get(name)
            .map(|collection| CollectionInfo {
                name: name.to_string(),
                description: collection.description.clone(),
            }))
    }

    async fn create_collection(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<CollectionInfo> {
        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            bail!("collection {name} already exists");
        }
        collections.insert(
            name.to_string(),
            MemoryCollection {
                description: description.map(str::to_string),
                ..MemoryCollection::default()
            },
        );
        Ok(CollectionInfo {
            name: name.to_string(),
            description: description.map(str::to_string),
        })
    }

    async fn update_collection(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<CollectionInfo> {
        let mut collections = self.collections.write();
        let collection = collections.get_mut(name).ok_or_else(|| missing(name))?;
        collection.description = description.map(str::to_string);
        Ok(CollectionInfo {
            name: name.to_string(),
            description: collection.description.clone(),
        })
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.collections
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| missing(name))
    }

    async fn count(&self, name: &str) -> Result<usize> {
        self.collections
            .read()
            .get(name)
            .map(|collection| collection.records.len())
            .ok_or_else(|| missing(name))
    }

    async fn upsert(&self, name: &str, records: Vec<VectorRecord>) -> Result<()> {
        let mut collections = self.collections.write();
        let collection = collections.get_mut(name).ok_or_else(|| missing(name))?;
        for record in records {
            if !collection.records.contains_key(&record.id) {
                collection.order.push(record.id.clone());
            }
            collection.records.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn get(&self, name: &str, request: GetRequest) -> Result<Vec<StoredRecord>> {
        let collections = self.collections.read();
        let collection = collections.get(name).ok_or_else(|| missing(name))?;

        let candidates: Vec<&VectorRecord> = match &request.ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| collection.records.get(id))
                .collect(),
            None => collection
                .order
                .iter()
                .filter_map(|id| collection.records.get(id))
                .collect(),
        };

        Ok(candidates
            .into_iter()
            .filter(|record| {
                request
                    .filter
                    .as_ref()
                    .map_or(true, |filter| filter.matches(&record.metadata))
            })
            .skip(request.offset.unwrap_or(0))
            .take(request.limit.unwrap_or(usize::MAX))
            .map(|record| StoredRecord {
                id: record.id.clone(),
                text: record.text.clone(),
                metadata: record.metadata.clone(),
                embedding: request
                    .include_embeddings
                    .then(|| record.embedding.clone()),
            })
            .collect())
    }

    async fn query(
        &self,
        name: &str,
        embedding: &[f32],
        n_results: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<QueryHit>> {
        let collections = self.collections.read();
        let collection = collections.get(name).ok_or_else(|| missing(name))?;

        let mut hits: Vec<QueryHit> = collection
            .order
            .iter()
            .filter_map(|id| collection.records.get(id))
            .filter(|record| filter.map_or(true, |filter| filter.matches(&record.metadata)))
            .map(|record| QueryHit {
                id: record.id.clone(),
                text: record.text.clone(),
                metadata: record.metadata.clone(),
                distance: cosine_distance(embedding, &record.embedding),
            })
            .collect();

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(n_results);
        Ok(hits)
    }

    async fn delete(&self, name: &str, ids: &[String]) -> Result<()> {
        let mut collections = self.collections.write();
        let MemoryCollection { order, records, .. } =
            collections.get_mut(name).ok_or_else(|| missing(name))?;
        for id in ids {
            records.remove(id);
        }
        order.retain(|id| records.contains_key(id));
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::Metadata;

    fn record(id: &str, embedding: Vec<f32>, metadata: serde_json::Value) -> VectorRecord {
        let metadata: Metadata = serde_json::from_value(metadata).unwrap();
        VectorRecord {
            id: id.to_string(),
            embedding,
            text: format!("text of {id}"),
            metadata,
        }
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.create_collection("docs", Some("test")).await.unwrap();
        store
            .upsert(
                "docs",
                vec![
                    record("a", vec![1.0, 0.0], json!({ "source": "a.txt", "page": 1 })),
                    record("b", vec![0.7, 0.7], json!({ "source": "b.txt", "page": 2 })),
                    record("c", vec![0.0, 1.0], json!({ "source": "a.txt", "page": 3 })),
                ],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn query_orders_by_distance_and_applies_filter() {
        let store = seeded().await;

        let hits = store.query("docs", &[1.0, 0.0], 2, None).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|hit| hit.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(hits[0].distance <= hits[1].distance);

        let filter = Filter::eq("source", "a.txt");
        let hits = store
            .query("docs", &[0.7, 0.7], 5, Some(&filter))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|hit| hit.metadata["source"] == "a.txt"));
    }

    #[tokio::test]
    async fn get_pages_in_insertion_order() {
        let store = seeded().await;
        let page = store
            .get(
                "docs",
                GetRequest {
                    offset: Some(1),
                    limit: Some(1),
                    ..GetRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "b");
        assert!(page[0].embedding.is_none());
    }

    #[tokio::test]
    async fn create_twice_fails_and_missing_collection_errors() {
        let store = seeded().await;
        assert!(store.create_collection("docs", None).await.is_err());
        assert!(store.count("nope").await.is_err());
        assert!(store.get_collection("nope").await.unwrap().is_none());

        store.delete("docs", &["a".to_string()]).await.unwrap();
        assert_eq!(store.count("docs").await.unwrap(), 2);

        store.delete_collection("docs").await.unwrap();
        assert!(store.list_collections().await.unwrap().is_empty());
    }
}
