pub mod config;
pub mod db;
pub mod embedding;
pub mod filter;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod rag;
pub mod server;
pub mod store;
pub mod tags;

pub use config::AppConfig;
pub use server::{build_router, run_server, AppState};
