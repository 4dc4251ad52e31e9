use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::llm::ProviderKind;

pub const API_PREFIX: &str = "/api/v1";
pub const PROJECT_NAME: &str = "RAG Management System";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorStoreKind {
    Chroma,
    Memory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddingProvider {
    Ollama,
    OpenAi,
}

#[derive(Clone, Debug)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub ollama_model: String,
    pub openai_model: String,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub default_provider: ProviderKind,
    pub ollama_base_url: String,
    pub ollama_default_model: String,
    pub anthropic_api_key: String,
    pub anthropic_base_url: String,
    pub anthropic_default_model: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_default_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub generation_concurrency: usize,
}

#[derive(Clone, Debug)]
pub struct DocumentConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub max_file_size_mb: usize,
    pub processing_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub static_dir: PathBuf,
    pub cors_origins: Vec<String>,
    pub vector_store: VectorStoreKind,
    pub chroma_base_url: String,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub documents: DocumentConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = env::var("RAGU_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let cors_origins = env::var("BACKEND_CORS_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        let vector_store = match env::var("VECTOR_STORE")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" => VectorStoreKind::Memory,
            "" | "chroma" => VectorStoreKind::Chroma,
            other => {
                tracing::warn!("unknown VECTOR_STORE {:?}, using chroma", other);
                VectorStoreKind::Chroma
            }
        };

        let embedding_provider = match env::var("EMBEDDING_PROVIDER")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "openai" => EmbeddingProvider::OpenAi,
            "" | "ollama" => EmbeddingProvider::Ollama,
            other => {
                tracing::warn!("unknown EMBEDDING_PROVIDER {:?}, using ollama", other);
                EmbeddingProvider::Ollama
            }
        };

        let default_provider = env::var("DEFAULT_LLM_PROVIDER")
            .ok()
            .map(|raw| {
                ProviderKind::from_str(&raw).unwrap_or_else(|_| {
                    tracing::warn!("unknown DEFAULT_LLM_PROVIDER {:?}, using ollama", raw);
                    ProviderKind::Ollama
                })
            })
            .unwrap_or(ProviderKind::Ollama);

        Self {
            bind_addr: env::var("RAGU_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            data_dir,
            static_dir: env::var("RAGU_STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("static")),
            cors_origins,
            vector_store,
            chroma_base_url: env::var("CHROMA_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8000".to_string()),
            embedding: EmbeddingConfig {
                provider: embedding_provider,
                ollama_model: env::var("OLLAMA_EMBED_MODEL")
                    .unwrap_or_else(|_| "nomic-embed-text".to_string()),
                openai_model: env::var("OPENAI_EMBED_MODEL")
                    .unwrap_or_else(|_| "text-embedding-ada-002".to_string()),
            },
            llm: LlmConfig {
                default_provider,
                ollama_base_url: env::var("OLLAMA_BASE_URL")
                    .unwrap_or_else(|_| "http://localhost:11434".to_string()),
                ollama_default_model: env::var("OLLAMA_DEFAULT_MODEL")
                    .unwrap_or_else(|_| "llama2".to_string()),
                anthropic_api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
                anthropic_base_url: env::var("ANTHROPIC_BASE_URL")
                    .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
                anthropic_default_model: env::var("ANTHROPIC_DEFAULT_MODEL")
                    .unwrap_or_else(|_| "claude-3-haiku-20240307".to_string()),
                openai_api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
                openai_base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
                openai_default_model: env::var("OPENAI_DEFAULT_MODEL")
                    .unwrap_or_else(|_| "gpt-4o".to_string()),
                temperature: env::var("LLM_TEMPERATURE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.7),
                max_tokens: env::var("LLM_MAX_TOKENS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1024),
                generation_concurrency: env::var("GENERATION_CONCURRENCY")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .filter(|v: &usize| *v > 0)
                    .unwrap_or(4),
            },
            documents: DocumentConfig {
                chunk_size: env::var("CHUNK_SIZE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1_000),
                chunk_overlap: env::var("CHUNK_OVERLAP")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(200),
                max_file_size_mb: env::var("MAX_FILE_SIZE_MB")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
                processing_timeout_secs: env::var("PROCESSING_TIMEOUT_SECONDS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            },
        }
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.documents.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn sqlite_dsn(&self) -> String {
        format!("sqlite://{}", self.data_dir.join("ragu.sqlite3").display())
    }
}
