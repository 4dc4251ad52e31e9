use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

use ragu::db::Database;
use ragu::embedding::build_embedder;
use ragu::ingest::Ingestor;
use ragu::llm::LlmService;
use ragu::rag::RagService;
use ragu::{run_server, store, AppConfig, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    let db = Database::new(&config).await?;

    let store = store::from_config(&config);
    if let Err(err) = store.heartbeat().await {
        tracing::warn!("vector store {} is not reachable yet: {:#}", store.name(), err);
    }

    let embedder = build_embedder(&config)?;
    let llm = LlmService::new(&config.llm);
    tracing::info!(
        "llm providers available: {:?} (default {})",
        llm.available(),
        llm.default_provider()
    );

    let generation_limit = Arc::new(Semaphore::new(config.llm.generation_concurrency.max(1)));
    let rag = RagService::new(store.clone(), embedder.clone(), llm, generation_limit);
    let ingestor = Ingestor::new(config.documents.clone(), store.clone(), embedder);

    let state = AppState {
        config: Arc::new(config),
        store,
        db,
        ingestor,
        rag,
    };
    run_server(state).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
