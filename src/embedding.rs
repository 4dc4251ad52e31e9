use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::{AppConfig, EmbeddingProvider};
use crate::llm::{OllamaClient, OpenAiClient};

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn model(&self) -> &str;
}

pub struct OllamaEmbedder {
    client: OllamaClient,
    model: String,
}

impl OllamaEmbedder {
    pub fn new(client: OllamaClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.client.embed(&self.model, text).await
    }

    fn model(&self) -> &str {
        &self.model
    }
}

pub struct OpenAiEmbedder {
    client: OpenAiClient,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(client: OpenAiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.client.embed(&self.model, text).await
    }

    fn model(&self) -> &str {
        &self.model
    }
}

pub fn build_embedder(config: &AppConfig) -> Result<Arc<dyn Embedder>> {
    match config.embedding.provider {
        EmbeddingProvider::Ollama => Ok(Arc::new(OllamaEmbedder::new(
            OllamaClient::new(config.llm.ollama_base_url.clone()),
            config.embedding.ollama_model.clone(),
        ))),
        EmbeddingProvider::OpenAi => {
            if config.llm.openai_api_key.trim().is_empty() {
                bail!("EMBEDDING_PROVIDER=openai requires OPENAI_API_KEY");
            }
            Ok(Arc::new(OpenAiEmbedder::new(
                OpenAiClient::new(
                    config.llm.openai_base_url.clone(),
                    config.llm.openai_api_key.clone(),
                ),
                config.embedding.openai_model.clone(),
            )))
        }
    }
}
