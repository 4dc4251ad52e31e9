use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use ragu::config::AppConfig;
use ragu::embedding::build_embedder;
use ragu::ingest::Ingestor;
use ragu::models::Metadata;
use ragu::store::{self, validate_collection_name};
use ragu::tags::parse_tag_list;

#[derive(Parser, Debug)]
#[command(name = "ragu-ingest")]
#[command(about = "Index local documents (PDF, DOCX, CSV, text) into a vector collection")]
struct Cli {
    /// Target collection, created when missing.
    #[arg(long)]
    collection: String,
    /// Comma separated tags applied to every chunk.
    #[arg(long)]
    tags: Option<String>,
    /// JSON object merged into every chunk's metadata.
    #[arg(long)]
    metadata: Option<String>,
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    validate_collection_name(&cli.collection)?;
    let metadata = parse_metadata(cli.metadata.as_deref())?;
    let tag_list = cli.tags.as_deref().map(parse_tag_list).unwrap_or_default();

    let config = AppConfig::from_env();
    let store = store::from_config(&config);
    store
        .heartbeat()
        .await
        .with_context(|| format!("vector store {} is not reachable", store.name()))?;
    let embedder = build_embedder(&config)?;
    let ingestor = Ingestor::new(config.documents.clone(), store, embedder);

    let mut total = 0;
    let mut failures = 0;
    for path in &cli.files {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("invalid file name: {}", path.display()))?
            .to_string();

        let result = match tokio::fs::read(path).await {
            Ok(bytes) => {
                ingestor
                    .ingest_file(&cli.collection, &file_name, bytes, metadata.clone(), &tag_list)
                    .await
            }
            Err(err) => Err(err.into()),
        };

        match result {
            Ok(chunks) => {
                total += chunks;
                println!("{}: {} chunks", path.display(), chunks);
            }
            Err(err) => {
                failures += 1;
                eprintln!("{}: failed: {:#}", path.display(), err);
            }
        }
    }

    println!(
        "Indexed {} chunks from {} files into {} ({} failed)",
        total,
        cli.files.len() - failures,
        cli.collection,
        failures
    );
    if failures > 0 {
        bail!("{failures} of {} files failed", cli.files.len());
    }
    Ok(())
}

fn parse_metadata(raw: Option<&str>) -> Result<Metadata> {
    let Some(raw) = raw else {
        return Ok(Metadata::new());
    };
    match serde_json::from_str::<Value>(raw).context("--metadata is not valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => bail!("--metadata must be a JSON object"),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
