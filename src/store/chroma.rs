use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;

use super::{CollectionInfo, GetRequest, QueryHit, StoredRecord, VectorRecord, VectorStore};
use crate::filter::Filter;
use crate::models::Metadata;

const DESCRIPTION_KEY: &str = "description";

#[derive(Clone)]
pub struct ChromaStore {
    client: Client,
    base_url: String,
    collection_ids: Arc<RwLock<HashMap<String, String>>>,
}

impl ChromaStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            collection_ids: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    async fn fetch_collection(&self, name: &str) -> Result<Option<ChromaCollection>> {
        let response = self
            .client
            .get(self.url(&format!("/collections/{name}")))
            .send()
            .await
            .context("failed to contact chroma while reading collection")?;

        let status = response.status();
        if status.is_success() {
            let collection = response
                .json::<ChromaCollection>()
                .await
                .context("failed to decode chroma collection")?;
            self.collection_ids
                .write()
                .await
                .insert(collection.name.clone(), collection.id.clone());
            return Ok(Some(collection));
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND || body.contains("does not exist") {
            self.collection_ids.write().await.remove(name);
            return Ok(None);
        }
        bail!(
            "chroma returned {status} while reading collection {name}: {}",
            normalize_err_body(&body)
        )
    }

    async fn collection_id(&self, name: &str) -> Result<String> {
        {
            let known = self.collection_ids.read().await;
            if let Some(id) = known.get(name) {
                return Ok(id.clone());
            }
        }

        match self.fetch_collection(name).await? {
            Some(collection) => Ok(collection.id),
            None => Err(anyhow!("collection {name} does not exist")),
        }
    }

    async fn post_collection_op(&self, name: &str, op: &str, body: Value) -> Result<Response> {
        let id = self.collection_id(name).await?;
        let response = self
            .client
            .post(self.url(&format!("/collections/{id}/{op}")))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to contact chroma during {op}"))?;
        check_status(response, op).await
    }
}

#[async_trait]
impl VectorStore for ChromaStore {
    async fn heartbeat(&self) -> Result<()> {
        let response = self
            .client
            .get(self.url("/heartbeat"))
            .send()
            .await
            .context("failed to contact chroma heartbeat")?;
        check_status(response, "heartbeat").await?;
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        let response = self
            .client
            .get(self.url("/collections"))
            .send()
            .await
            .context("failed to contact chroma while listing collections")?;
        let collections = check_status(response, "list collections")
            .await?
            .json::<Vec<ChromaCollection>>()
            .await
            .context("failed to decode chroma collection list")?;

        let mut known = self.collection_ids.write().await;
        Ok(collections
            .into_iter()
            .map(|collection| {
                known.insert(collection.name.clone(), collection.id.clone());
                collection.into_info()
            })
            .collect())
    }

    async fn get_collection(&self, name: &str) -> Result<Option<CollectionInfo>> {
        Ok(self
            .fetch_collection(name)
            .await?
            .map(ChromaCollection::into_info))
    }

    async fn create_collection(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<CollectionInfo> {
        if self.fetch_collection(name).await?.is_some() {
            bail!("collection {name} already exists");
        }

        let mut metadata = Map::new();
        metadata.insert("hnsw:space".to_string(), json!("cosine"));
        if let Some(description) = description {
            metadata.insert(DESCRIPTION_KEY.to_string(), json!(description));
        }

        let response = self
            .client
            .post(self.url("/collections"))
            .json(&json!({
                "name": name,
                "metadata": metadata,
                "get_or_create": false,
            }))
            .send()
            .await
            .context("failed to contact chroma while creating collection")?;
        let collection = check_status(response, "create collection")
            .await?
            .json::<ChromaCollection>()
            .await
            .context("failed to decode created chroma collection")?;

        self.collection_ids
            .write()
            .await
            .insert(collection.name.clone(), collection.id.clone());
        tracing::info!("created chroma collection {}", collection.name);
        Ok(collection.into_info())
    }

    async fn update_collection(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<CollectionInfo> {
        let Some(existing) = self.fetch_collection(name).await? else {
            bail!("collection {name} does not exist");
        };

        // Chroma refuses to modify the distance function of an existing collection.
        let mut metadata: Map<String, Value> = existing
            .metadata
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|(key, _)| !key.starts_with("hnsw:"))
            .collect();
        match description {
            Some(description) => {
                metadata.insert(DESCRIPTION_KEY.to_string(), json!(description));
            }
            None => {
                metadata.remove(DESCRIPTION_KEY);
            }
        }

        let response = self
            .client
            .put(self.url(&format!("/collections/{}", existing.id)))
            .json(&json!({ "new_metadata": metadata }))
            .send()
            .await
            .context("failed to contact chroma while updating collection")?;
        check_status(response, "update collection").await?;

        Ok(CollectionInfo {
            name: existing.name,
            description: description.map(str::to_string),
        })
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/collections/{name}")))
            .send()
            .await
            .context("failed to contact chroma while deleting collection")?;
        check_status(response, "delete collection").await?;
        self.collection_ids.write().await.remove(name);
        Ok(())
    }

    async fn count(&self, name: &str) -> Result<usize> {
        let id = self.collection_id(name).await?;
        let response = self
            .client
            .get(self.url(&format!("/collections/{id}/count")))
            .send()
            .await
            .context("failed to contact chroma during count")?;
        check_status(response, "count")
            .await?
            .json::<usize>()
            .await
            .context("failed to decode chroma count")
    }

    async fn upsert(&self, name: &str, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(records.len());
        let mut embeddings = Vec::with_capacity(records.len());
        let mut documents = Vec::with_capacity(records.len());
        let mut metadatas = Vec::with_capacity(records.len());
        for record in records {
            ids.push(record.id);
            embeddings.push(record.embedding);
            documents.push(record.text);
            metadatas.push(if record.metadata.is_empty() {
                Value::Null
            } else {
                Value::Object(record.metadata)
            });
        }

        let body = json!({
            "ids": ids,
            "embeddings": embeddings,
            "documents": documents,
            "metadatas": metadatas,
        });
        self.post_collection_op(name, "upsert", body).await?;
        Ok(())
    }

    async fn get(&self, name: &str, request: GetRequest) -> Result<Vec<StoredRecord>> {
        let mut include = vec!["documents", "metadatas"];
        if request.include_embeddings {
            include.push("embeddings");
        }

        let mut body = Map::new();
        body.insert("include".to_string(), json!(include));
        if let Some(ids) = &request.ids {
            if ids.is_empty() {
                return Ok(vec![]);
            }
            body.insert("ids".to_string(), json!(ids));
        }
        if let Some(filter) = &request.filter {
            body.insert("where".to_string(), filter.to_chroma());
        }
        if let Some(limit) = request.limit {
            body.insert("limit".to_string(), json!(limit));
        }
        if let Some(offset) = request.offset {
            body.insert("offset".to_string(), json!(offset));
        }

        let response = self
            .post_collection_op(name, "get", Value::Object(body))
            .await?
            .json::<ChromaGetResponse>()
            .await
            .context("failed to decode chroma get response")?;

        let mut documents = response.documents.unwrap_or_default().into_iter();
        let mut metadatas = response.metadatas.unwrap_or_default().into_iter();
        let mut embeddings = response.embeddings.unwrap_or_default().into_iter();
        Ok(response
            .ids
            .into_iter()
            .map(|id| StoredRecord {
                id,
                text: documents.next().flatten().unwrap_or_default(),
                metadata: metadatas.next().flatten().unwrap_or_default(),
                embedding: embeddings.next().flatten(),
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
        if embedding.is_empty() || n_results == 0 {
            return Ok(vec![]);
        }

        let mut body = json!({
            "query_embeddings": [embedding],
            "n_results": n_results,
            "include": ["documents", "metadatas", "distances"],
        });
        if let Some(filter) = filter {
            body["where"] = filter.to_chroma();
        }

        let response = self
            .post_collection_op(name, "query", body)
            .await?
            .json::<ChromaQueryResponse>()
            .await
            .context("failed to decode chroma query response")?;

        let ids = response.ids.into_iter().next().unwrap_or_default();
        let mut documents = first_row(response.documents).into_iter();
        let mut metadatas = first_row(response.metadatas).into_iter();
        let mut distances = first_row(response.distances).into_iter();

        Ok(ids
            .into_iter()
            .map(|id| QueryHit {
                id,
                text: documents.next().flatten().unwrap_or_default(),
                metadata: metadatas.next().flatten().unwrap_or_default(),
                distance: distances.next().flatten().unwrap_or(1.0),
            })
            .collect())
    }

    async fn delete(&self, name: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.post_collection_op(name, "delete", json!({ "ids": ids }))
            .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "chroma"
    }
}

async fn check_status(response: Response, action: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    bail!(
        "chroma {action} returned {status}: {}",
        normalize_err_body(&body)
    )
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        for key in ["error", "detail", "message"] {
            if let Some(err) = json.get(key).and_then(|v| v.as_str()) {
                return err.to_string();
            }
        }
    }

    trimmed.to_string()
}

fn first_row<T>(rows: Option<Vec<Vec<Option<T>>>>) -> Vec<Option<T>> {
    rows.and_then(|rows| rows.into_iter().next())
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct ChromaCollection {
    id: String,
    name: String,
    #[serde(default)]
    metadata: Option<Metadata>,
}

impl ChromaCollection {
    fn into_info(self) -> CollectionInfo {
        let description = self
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.get(DESCRIPTION_KEY))
            .and_then(|value| value.as_str())
            .map(str::to_string);
        CollectionInfo {
            name: self.name,
            description,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChromaGetResponse {
    ids: Vec<String>,
    #[serde(default)]
    documents: Option<Vec<Option<String>>>,
    #[serde(default)]
    metadatas: Option<Vec<Option<Metadata>>>,
    #[serde(default)]
    embeddings: Option<Vec<Option<Vec<f32>>>>,
}

#[derive(Debug, Deserialize)]
struct ChromaQueryResponse {
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<Metadata>>>>,
    #[serde(default)]
    distances: Option<Vec<Vec<Option<f32>>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_query_response_rows() {
        let raw = json!({
            "ids": [["a", "b"]],
            "documents": [["first", null]],
            "metadatas": [[{ "source": "x.txt" }, null]],
            "distances": [[0.1, 0.4]],
            "embeddings": null
        });
        let decoded: ChromaQueryResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(decoded.ids[0], vec!["a", "b"]);
        let distances = first_row(decoded.distances);
        assert_eq!(distances, vec![Some(0.1), Some(0.4)]);
        let documents = first_row(decoded.documents);
        assert_eq!(documents[1], None);
    }

    #[test]
    fn description_is_read_from_collection_metadata() {
        let raw = json!({
            "id": "0b6f",
            "name": "documents",
            "metadata": { "hnsw:space": "cosine", "description": "Main" }
        });
        let collection: ChromaCollection = serde_json::from_value(raw).unwrap();
        let info = collection.into_info();
        assert_eq!(info.name, "documents");
        assert_eq!(info.description.as_deref(), Some("Main"));
    }

    #[test]
    fn error_bodies_prefer_json_messages() {
        assert_eq!(
            normalize_err_body(r#"{"error":"ValueError","detail":"x"}"#),
            "ValueError"
        );
        assert_eq!(normalize_err_body("  "), "<empty body>");
        assert_eq!(normalize_err_body("plain"), "plain");
    }
}
