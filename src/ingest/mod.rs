pub mod csv;
pub mod docx;
pub mod pdf;
pub mod splitter;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use uuid::Uuid;

use crate::config::DocumentConfig;
use crate::embedding::Embedder;
use crate::models::Metadata;
use crate::store::{validate_collection_name, VectorRecord, VectorStore};
use crate::tags;

pub use splitter::TextSplitter;

pub const DIRECT_INPUT_SOURCE: &str = "direct_input";
const UPSERT_BATCH_SIZE: usize = 64;

/// A contiguous piece of extracted text with its location inside the source file.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub text: String,
    pub page: Option<i64>,
    pub row: Option<i64>,
}

impl Section {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            page: None,
            row: None,
        }
    }

    pub fn page(text: impl Into<String>, page: i64) -> Self {
        Self {
            page: Some(page),
            ..Self::text(text)
        }
    }

    pub fn row(text: impl Into<String>, row: i64) -> Self {
        Self {
            row: Some(row),
            ..Self::text(text)
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreparedChunk {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
}

/// Upload failures that map onto specific client-facing statuses.
#[derive(Debug)]
pub enum IngestError {
    TooLarge { size: usize, limit: usize },
    Timeout { seconds: u64 },
    NoText { source: String },
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::TooLarge { size, limit } => write!(
                f,
                "file is {size} bytes, which exceeds the {limit} byte upload limit"
            ),
            IngestError::Timeout { seconds } => {
                write!(f, "document processing exceeded {seconds} seconds")
            }
            IngestError::NoText { source } => {
                write!(f, "no extractable text found in {source}")
            }
        }
    }
}

impl std::error::Error for IngestError {}

pub fn parse_document(file_name: &str, bytes: &[u8]) -> Result<Vec<Section>> {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "pdf" => pdf::extract_pdf_sections(bytes),
        "docx" | "doc" => Ok(vec![Section::text(docx::extract_docx_text(bytes)?)]),
        "csv" => csv::extract_csv_sections(bytes),
        _ => Ok(vec![Section::text(String::from_utf8_lossy(bytes).into_owned())]),
    }
}

/// Flattens user metadata into values the vector store accepts. Tag bookkeeping keys are
/// owned by the ingest path and dropped here.
pub fn sanitize_metadata(metadata: Metadata) -> Metadata {
    metadata
        .into_iter()
        .filter(|(key, _)| key != tags::TAGS_KEY && !tags::is_internal_key(key))
        .filter_map(|(key, value)| match value {
            Value::Null => None,
            Value::Array(_) | Value::Object(_) => Some((key, Value::String(value.to_string()))),
            scalar => Some((key, scalar)),
        })
        .collect()
}

#[derive(Clone)]
pub struct Ingestor {
    config: DocumentConfig,
    splitter: TextSplitter,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
}

impl Ingestor {
    pub fn new(
        config: DocumentConfig,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            splitter: TextSplitter::new(config.chunk_size, config.chunk_overlap),
            config,
            store,
            embedder,
        }
    }

    pub fn max_file_bytes(&self) -> usize {
        self.config.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    pub async fn process_file(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        extra_metadata: Metadata,
        tag_list: &[String],
    ) -> Result<Vec<PreparedChunk>> {
        let limit = self.max_file_bytes();
        if bytes.len() > limit {
            return Err(IngestError::TooLarge {
                size: bytes.len(),
                limit,
            }
            .into());
        }

        let seconds = self.config.processing_timeout_secs;
        let splitter = self.splitter;
        let name = file_name.to_string();
        let task = tokio::task::spawn_blocking(move || -> Result<Vec<(String, Section)>> {
            let sections = parse_document(&name, &bytes)?;
            Ok(split_sections(&splitter, sections))
        });

        let pieces = match tokio::time::timeout(Duration::from_secs(seconds), task).await {
            Ok(joined) => joined
                .context("document parsing task panicked")?
                .with_context(|| format!("failed to parse {file_name}"))?,
            Err(_) => return Err(IngestError::Timeout { seconds }.into()),
        };

        let chunks = prepare_chunks(file_name, pieces, extra_metadata, tag_list);
        if chunks.is_empty() {
            return Err(IngestError::NoText {
                source: file_name.to_string(),
            }
            .into());
        }

        tracing::info!("prepared {} chunks from {}", chunks.len(), file_name);
        Ok(chunks)
    }

    pub fn process_text(
        &self,
        text: &str,
        source: Option<&str>,
        extra_metadata: Metadata,
        tag_list: &[String],
    ) -> Result<Vec<PreparedChunk>> {
        let source = source
            .map(str::trim)
            .filter(|source| !source.is_empty())
            .unwrap_or(DIRECT_INPUT_SOURCE);
        let pieces = split_sections(&self.splitter, vec![Section::text(text)]);
        let chunks = prepare_chunks(source, pieces, extra_metadata, tag_list);
        if chunks.is_empty() {
            return Err(IngestError::NoText {
                source: source.to_string(),
            }
            .into());
        }
        Ok(chunks)
    }

    /// Embeds and stores prepared chunks, creating the collection when it does not exist.
    pub async fn index(&self, collection: &str, chunks: Vec<PreparedChunk>) -> Result<usize> {
        if !self.store.collection_exists(collection).await? {
            validate_collection_name(collection)?;
            self.store.create_collection(collection, None).await?;
        }

        let total = chunks.len();
        let mut batch = Vec::with_capacity(UPSERT_BATCH_SIZE.min(total));
        for chunk in chunks {
            let embedding = self
                .embedder
                .embed(&chunk.text)
                .await
                .with_context(|| format!("failed embedding for chunk {}", chunk.id))?;

            batch.push(VectorRecord {
                id: chunk.id,
                embedding,
                text: chunk.text,
                metadata: chunk.metadata,
            });
            if batch.len() == UPSERT_BATCH_SIZE {
                self.store
                    .upsert(collection, std::mem::take(&mut batch))
                    .await?;
            }
        }
        if !batch.is_empty() {
            self.store.upsert(collection, batch).await?;
        }

        tracing::info!("indexed {} chunks into {}", total, collection);
        Ok(total)
    }

    pub async fn ingest_file(
        &self,
        collection: &str,
        file_name: &str,
        bytes: Vec<u8>,
        extra_metadata: Metadata,
        tag_list: &[String],
    ) -> Result<usize> {
        let chunks = self
            .process_file(file_name, bytes, extra_metadata, tag_list)
            .await?;
        self.index(collection, chunks).await
    }
}

fn split_sections(splitter: &TextSplitter, sections: Vec<Section>) -> Vec<(String, Section)> {
    sections
        .into_iter()
        .flat_map(|section| {
            splitter
                .split_text(&section.text)
                .into_iter()
                .map(move |text| (text, Section { text: String::new(), ..section.clone() }))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn prepare_chunks(
    source: &str,
    pieces: Vec<(String, Section)>,
    extra_metadata: Metadata,
    tag_list: &[String],
) -> Vec<PreparedChunk> {
    let mut all_tags = tags::tags_from_metadata(&extra_metadata);
    all_tags.extend(tag_list.iter().cloned());
    let all_tags = tags::dedup_tags(all_tags);
    let base = sanitize_metadata(extra_metadata);

    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, (text, section))| {
            let mut metadata = base.clone();
            metadata.insert("source".to_string(), Value::from(source));
            metadata.insert("chunk".to_string(), Value::from(index as i64));
            metadata.insert("total_chunks".to_string(), Value::from(total as i64));
            if let Some(page) = section.page {
                metadata.insert("page".to_string(), Value::from(page));
            }
            if let Some(row) = section.row {
                metadata.insert("row".to_string(), Value::from(row));
            }
            tags::apply_tags(&mut metadata, &all_tags);

            PreparedChunk {
                id: Uuid::new_v4().to_string(),
                text,
                metadata,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::store::{GetRequest, MemoryStore};

    struct LengthEmbedder;

    #[async_trait]
    impl Embedder for LengthEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0])
        }

        fn model(&self) -> &str {
            "length"
        }
    }

    fn build_ingestor(chunk_size: usize, max_mb: usize) -> (Ingestor, Arc<MemoryStore>) {
        build_ingestor_with_timeout(chunk_size, max_mb, 30)
    }

    fn build_ingestor_with_timeout(
        chunk_size: usize,
        max_mb: usize,
        timeout_secs: u64,
    ) -> (Ingestor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = DocumentConfig {
            chunk_size,
            chunk_overlap: 0,
            max_file_size_mb: max_mb,
            processing_timeout_secs: timeout_secs,
        };
        (
            Ingestor::new(config, store.clone(), Arc::new(LengthEmbedder)),
            store,
        )
    }

    fn meta(value: Value) -> Metadata {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn dispatches_on_extension() {
        let sections = parse_document("notes.TXT", "plain words".as_bytes()).unwrap();
        assert_eq!(sections, vec![Section::text("plain words")]);

        let sections = parse_document("table.csv", b"a,b\n1,2\n").unwrap();
        assert_eq!(sections, vec![Section::row("a: 1\nb: 2", 0)]);

        let bytes = docx::build_test_docx(&["Heading", "Body text"]);
        let sections = parse_document("rules.docx", &bytes).unwrap();
        assert_eq!(sections[0].text, "Heading\n\nBody text");
    }

    #[test]
    fn sanitize_flattens_nested_values_and_drops_nulls() {
        let cleaned = sanitize_metadata(meta(json!({
            "author": "Ann",
            "year": 2024,
            "draft": false,
            "extra": { "k": 1 },
            "list": [1, 2],
            "gone": null,
            "has_tags": true,
            "tag:x": true
        })));
        assert_eq!(cleaned.get("author"), Some(&json!("Ann")));
        assert_eq!(cleaned.get("year"), Some(&json!(2024)));
        assert_eq!(cleaned.get("extra"), Some(&json!("{\"k\":1}")));
        assert_eq!(cleaned.get("list"), Some(&json!("[1,2]")));
        assert!(!cleaned.contains_key("gone"));
        assert!(!cleaned.contains_key("has_tags"));
        assert!(!cleaned.contains_key("tag:x"));
    }

    #[tokio::test]
    async fn process_file_builds_chunk_metadata() {
        let (ingestor, _) = build_ingestor(25, 1);
        let chunks = ingestor
            .process_file(
                "hoa.txt",
                b"Pool opens at nine.\n\nQuiet hours after ten.".to_vec(),
                meta(json!({ "author": "board" })),
                &["House".to_string(), "rules".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(chunks.len(), 2);
        let first = &chunks[0].metadata;
        assert_eq!(first.get("source"), Some(&json!("hoa.txt")));
        assert_eq!(first.get("chunk"), Some(&json!(0)));
        assert_eq!(first.get("total_chunks"), Some(&json!(2)));
        assert_eq!(first.get("author"), Some(&json!("board")));
        assert_eq!(first.get("tags"), Some(&json!("house,rules")));
        assert_eq!(first.get("tag:rules"), Some(&json!(true)));
        assert_eq!(chunks[1].metadata.get("chunk"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn upload_guards_report_typed_errors() {
        let (ingestor, _) = build_ingestor(100, 0);
        let err = ingestor
            .process_file("big.txt", b"x".to_vec(), Metadata::new(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<IngestError>(), Some(IngestError::TooLarge { .. })));

        let (ingestor, _) = build_ingestor(100, 1);
        let err = ingestor
            .process_file("blank.txt", b"  \n\n ".to_vec(), Metadata::new(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<IngestError>(), Some(IngestError::NoText { .. })));
    }

    #[tokio::test]
    async fn pdf_chunks_carry_their_page() {
        let (ingestor, _) = build_ingestor(1000, 1);
        let bytes = pdf::build_test_pdf(&["Pool opens at nine.", "Quiet hours after ten."]);
        let chunks = ingestor
            .process_file("x.pdf", bytes, Metadata::new(), &[])
            .await
            .unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].metadata.get("page"), Some(&json!(1)));
        assert_eq!(chunks[1].metadata.get("page"), Some(&json!(2)));
        assert_eq!(crate::rag::display_name(&chunks[0].metadata, 0), "x.pdf, page 1");
        assert_eq!(crate::rag::display_name(&chunks[1].metadata, 1), "x.pdf, page 2");
    }

    #[tokio::test]
    async fn slow_parsing_reports_a_timeout() {
        let (ingestor, store) = build_ingestor_with_timeout(100, 8, 0);
        let bytes = "pool rules apply to every resident ".repeat(120_000).into_bytes();
        let err = ingestor
            .ingest_file("hoa", "long.txt", bytes, Metadata::new(), &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IngestError>(),
            Some(IngestError::Timeout { seconds: 0 })
        ));
        assert_eq!(err.to_string(), "document processing exceeded 0 seconds");
        assert!(!store.collection_exists("hoa").await.unwrap());
    }

    #[tokio::test]
    async fn index_creates_collection_and_stores_every_chunk() {
        let (ingestor, store) = build_ingestor(10, 1);
        let text = (0..150).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let chunks = ingestor
            .process_text(&text, None, Metadata::new(), &[])
            .unwrap();
        let expected = chunks.len();
        assert!(expected > UPSERT_BATCH_SIZE);

        let stored = ingestor.index("notes", chunks).await.unwrap();
        assert_eq!(stored, expected);
        assert_eq!(store.count("notes").await.unwrap(), expected);

        let records = store.get("notes", GetRequest::default()).await.unwrap();
        assert!(records
            .iter()
            .all(|record| record.metadata.get("source") == Some(&json!("direct_input"))));
        assert!(records
            .iter()
            .all(|record| record.metadata.get("has_tags") == Some(&json!(false))));
    }
}
