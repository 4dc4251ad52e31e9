use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::embedding::Embedder;
use crate::filter::Filter;
use crate::llm::LlmService;
use crate::models::{ChatMessage, ChatRequest, ChatResponse, Metadata, SourceRef};
use crate::store::VectorStore;
use crate::tags;

pub const NO_CONTEXT_MESSAGE: &str = "No relevant information found.";
pub const UNTITLED_CONVERSATION: &str = "New conversation";

const SOURCE_PREVIEW_CHARS: usize = 100;
const TITLE_INPUT_CHARS: usize = 100;
const TITLE_MAX_CHARS: usize = 50;
const TITLE_FALLBACK_WORDS: usize = 6;
const TAG_SAMPLE_TEXTS: usize = 5;
const TAG_SAMPLE_CHARS: usize = 3000;
const TAG_PROMPT_EXISTING: usize = 20;

const ANSWER_RULES: &str = "You are a research assistant that answers questions from the user's own documents. \
Keep a friendly, conversational tone.\n\n\
Rules:\n\
- Answer using only the information in the context below. Do not add facts that are not in it.\n\
- Separate what the documents state directly from any inference you draw.\n\
- Cite every source you use with its exact bracketed name from the context, for example \
\"According to [Rules.pdf, page 5]...\" or \"[Bylaws.docx, section 2 of 15] says...\". \
Never cite generic names like \"Document 1\" when a real name is given.\n\
- When the documents list steps or procedures, present them as a clear list.\n\
- If the context is incomplete or ambiguous, say so.\n\
- If the answer is not in the context, say \"I don't have information about this in the provided documents\".";

/// Where retrieval looks for passages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrievalScope {
    Collection(String),
    All,
}

impl RetrievalScope {
    pub fn from_request(collection_name: Option<&str>) -> Self {
        match collection_name.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => RetrievalScope::Collection(name.to_string()),
            None => RetrievalScope::All,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievedPassage {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    pub collection: String,
    pub distance: f32,
}

/// Cosine distance mapped onto a 0..1 relevance score.
pub fn similarity(distance: f32) -> f32 {
    if distance <= 1.0 {
        1.0 - distance
    } else {
        0.0
    }
}

#[derive(Clone)]
pub struct RagService {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    llm: LlmService,
    generation_limit: Arc<Semaphore>,
}

impl RagService {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        llm: LlmService,
        generation_limit: Arc<Semaphore>,
    ) -> Self {
        Self {
            store,
            embedder,
            llm,
            generation_limit,
        }
    }

    pub fn llm(&self) -> &LlmService {
        &self.llm
    }

    pub async fn retrieve(
        &self,
        query: &str,
        scope: &RetrievalScope,
        n_results: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<RetrievedPassage>> {
        let n_results = n_results.max(1);
        let embedding = self.embedder.embed(query).await?;

        let collections = match scope {
            RetrievalScope::Collection(name) => {
                let hits = self.store.query(name, &embedding, n_results, filter).await?;
                return Ok(hits
                    .into_iter()
                    .map(|hit| RetrievedPassage {
                        id: hit.id,
                        text: hit.text,
                        metadata: hit.metadata,
                        collection: name.clone(),
                        distance: hit.distance,
                    })
                    .collect());
            }
            RetrievalScope::All => self.store.list_collections().await?,
        };

        let mut merged = Vec::new();
        for collection in collections {
            match self
                .store
                .query(&collection.name, &embedding, n_results, filter)
                .await
            {
                Ok(hits) => merged.extend(hits.into_iter().map(|hit| RetrievedPassage {
                    id: hit.id,
                    text: hit.text,
                    metadata: hit.metadata,
                    collection: collection.name.clone(),
                    distance: hit.distance,
                })),
                Err(err) => {
                    tracing::warn!("retrieval from collection {} failed: {:#}", collection.name, err)
                }
            }
        }

        merged.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        merged.truncate(n_results);
        Ok(merged)
    }

    pub async fn answer(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let (prompt, sources) = self.prepare(request).await?;

        let answer = {
            let _permit = self.generation_limit.acquire().await?;
            self.llm.complete(request.model.as_deref(), &prompt).await?
        };

        Ok(finish(request, answer, sources))
    }

    /// Like [`RagService::answer`] but reports tokens as the model produces them.
    pub async fn answer_streaming<F>(&self, request: &ChatRequest, on_token: F) -> Result<ChatResponse>
    where
        F: FnMut(&str) + Send,
    {
        let (prompt, sources) = self.prepare(request).await?;

        let answer = {
            let _permit = self.generation_limit.acquire().await?;
            self.llm
                .stream_with(request.model.as_deref(), &prompt, on_token)
                .await?
        };

        Ok(finish(request, answer, sources))
    }

    async fn prepare(&self, request: &ChatRequest) -> Result<(String, Vec<SourceRef>)> {
        let query = request.query.trim();
        if query.is_empty() {
            bail!("query must not be empty");
        }

        let scope = RetrievalScope::from_request(request.collection_name.as_deref());
        let filter = Filter::for_tags(
            request.tags.as_deref().unwrap_or_default(),
            request.include_untagged,
        );
        let mut passages = self
            .retrieve(query, &scope, request.n_results, filter.as_ref())
            .await?;
        // Cited sources must match the passages the model actually sees.
        passages.retain(|passage| !passage.text.trim().is_empty());
        tracing::info!(
            "retrieved {} passages for chat ({:?})",
            passages.len(),
            scope
        );

        let history = request.history.as_deref().unwrap_or_default();
        let prompt = build_prompt(&build_context(&passages), history, query);
        let sources = passages
            .iter()
            .enumerate()
            .map(|(index, passage)| SourceRef {
                id: passage.id.clone(),
                text: preview(&passage.text, SOURCE_PREVIEW_CHARS),
                metadata: passage.metadata.clone(),
                display_name: display_name(&passage.metadata, index),
                collection: passage.collection.clone(),
                score: similarity(passage.distance),
            })
            .collect();

        Ok((prompt, sources))
    }

    pub async fn generate_title(&self, messages: &[ChatMessage], model: Option<&str>) -> String {
        let Some(first) = messages.iter().find(|message| message.role == "user") else {
            return UNTITLED_CONVERSATION.to_string();
        };
        let first_message = preview(&first.content, TITLE_INPUT_CHARS);
        let prompt = title_prompt(&first_message);

        let reply = {
            match self.generation_limit.acquire().await {
                Ok(_permit) => self.llm.complete(model, &prompt).await,
                Err(err) => Err(err.into()),
            }
        };

        match reply.map(|reply| clean_title(&reply)) {
            Ok(title) if !title.is_empty() => title,
            Ok(_) => fallback_title(&first_message),
            Err(err) => {
                tracing::warn!("title generation failed: {:#}", err);
                fallback_title(&first_message)
            }
        }
    }

    pub async fn suggest_tags(
        &self,
        texts: &[String],
        existing: &[String],
        model: Option<&str>,
        max_tags: usize,
    ) -> Result<Vec<String>> {
        if texts.iter().all(|text| text.trim().is_empty()) {
            bail!("at least one non-empty text is required");
        }

        let prompt = tag_prompt(texts, existing, max_tags);
        let reply = {
            let _permit = self.generation_limit.acquire().await?;
            self.llm.complete(model, &prompt).await?
        };
        Ok(tags::clean_suggested_tags(reply.trim(), max_tags))
    }
}

fn finish(request: &ChatRequest, answer: String, sources: Vec<SourceRef>) -> ChatResponse {
    let mut history = request.history.clone().unwrap_or_default();
    history.push(ChatMessage::user(request.query.clone()));
    history.push(ChatMessage::assistant(answer.clone()));
    ChatResponse {
        answer,
        sources,
        history,
    }
}

/// Human-readable citation label, e.g. `rules.pdf, page 3` or `notes.txt, section 2 of 4`.
pub fn display_name(metadata: &Metadata, index: usize) -> String {
    let name = ["original_filename", "source"]
        .iter()
        .find_map(|key| metadata.get(*key).and_then(scalar_text))
        .unwrap_or_else(|| format!("Document {}", index + 1));

    if let Some(page) = metadata.get("page").filter(|page| !page.is_null()) {
        let page = scalar_text(page).unwrap_or_else(|| page.to_string());
        return format!("{name}, page {page}");
    }

    let chunk = metadata.get("chunk").and_then(Value::as_i64);
    let total = metadata.get("total_chunks").and_then(Value::as_i64);
    match (chunk, total) {
        (Some(chunk), Some(total)) if total > 1 => {
            format!("{name}, section {} of {total}", chunk + 1)
        }
        _ => name,
    }
}

pub fn build_context(passages: &[RetrievedPassage]) -> String {
    let blocks: Vec<String> = passages
        .iter()
        .enumerate()
        .filter(|(_, passage)| !passage.text.is_empty())
        .map(|(index, passage)| {
            format!("[{}]: {}", display_name(&passage.metadata, index), passage.text)
        })
        .collect();

    if blocks.is_empty() {
        NO_CONTEXT_MESSAGE.to_string()
    } else {
        blocks.join("\n\n")
    }
}

pub fn format_history(history: &[ChatMessage]) -> String {
    if history.is_empty() {
        return String::new();
    }

    let mut out = String::from("Previous conversation:\n");
    for message in history {
        let speaker = match message.role.as_str() {
            "user" => "User",
            "assistant" => "Assistant",
            _ => continue,
        };
        out.push_str(speaker);
        out.push_str(": ");
        out.push_str(&message.content);
        out.push('\n');
    }
    out
}

pub fn build_prompt(context: &str, history: &[ChatMessage], query: &str) -> String {
    format!(
        "{ANSWER_RULES}\n\nContext:\n{context}\n\n{}\n\nQuestion: {query}\n\nAnswer:",
        format_history(history)
    )
}

fn title_prompt(first_message: &str) -> String {
    format!(
        "Write a short title (5 to 10 words) for a conversation that starts with this message:\n\n\
         User message: \"{first_message}\"\n\n\
         The title should read like a natural sentence describing what the user wants. \
         Use sentence case and no quotation marks, for example:\n\
         - How do I reserve the community pool\n\
         - What are the rules for guest parking\n\n\
         Reply with the title only."
    )
}

fn clean_title(reply: &str) -> String {
    let trimmed = reply.trim();
    let title = if trimmed.chars().count() > TITLE_MAX_CHARS {
        format!("{}...", trimmed.chars().take(TITLE_MAX_CHARS).collect::<String>())
    } else {
        trimmed.to_string()
    };
    title.trim_matches(|c| c == '"' || c == '\'').trim().to_string()
}

fn fallback_title(first_message: &str) -> String {
    let words: Vec<&str> = first_message.split_whitespace().collect();
    if words.len() <= TITLE_FALLBACK_WORDS {
        first_message.trim().to_string()
    } else {
        format!("{}...", words[..TITLE_FALLBACK_WORDS].join(" "))
    }
}

fn tag_prompt(texts: &[String], existing: &[String], max_tags: usize) -> String {
    let combined = texts
        .iter()
        .take(TAG_SAMPLE_TEXTS)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n\n");
    let combined = if combined.chars().count() > TAG_SAMPLE_CHARS {
        format!("{}...", combined.chars().take(TAG_SAMPLE_CHARS).collect::<String>())
    } else {
        combined
    };

    let existing_line = if existing.is_empty() {
        String::new()
    } else {
        let listed: Vec<&str> = existing
            .iter()
            .take(TAG_PROMPT_EXISTING)
            .map(String::as_str)
            .collect();
        format!("\nExisting tags (reuse these when they fit): {}", listed.join(", "))
    };

    format!(
        "Suggest {max_tags} tags that categorize the document content below.\n\n\
         Instructions:\n\
         - Tags are short (1-3 words), single words preferred.\n\
         - Prefer existing tags when they are relevant.{existing_line}\n\
         - Cover the main topics, themes and document type.\n\
         - Use lowercase with hyphens, like \"pool-rules\" or \"budget\".\n\
         - Reply with the tags only, one per line.\n\n\
         Document content:\n{combined}\n\n\
         Tags:"
    )
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::llm::{LlmBackend, ProviderKind, TokenStream};
    use crate::store::{MemoryStore, VectorRecord};

    const VOCAB: [&str; 3] = ["pool", "gym", "pets"];

    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let lowered = text.to_lowercase();
            Ok(VOCAB
                .iter()
                .map(|word| lowered.matches(word).count() as f32 + 0.01)
                .collect())
        }

        fn model(&self) -> &str {
            "keywords"
        }
    }

    struct Scripted {
        reply: Option<&'static str>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmBackend for Scripted {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Ollama
        }

        fn default_model(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _model: &str, prompt: &str) -> Result<String> {
            self.prompts.lock().push(prompt.to_string());
            match self.reply {
                Some(reply) => Ok(reply.to_string()),
                None => bail!("model offline"),
            }
        }

        async fn stream(&self, model: &str, prompt: &str) -> Result<TokenStream> {
            let full = self.complete(model, prompt).await?;
            let tokens: Vec<Result<String>> = full
                .split_inclusive(' ')
                .map(|token| Ok(token.to_string()))
                .collect();
            Ok(futures::stream::iter(tokens).boxed())
        }
    }

    fn metadata(value: Value) -> Metadata {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn service(reply: Option<&'static str>) -> (RagService, Arc<Scripted>) {
        let store = Arc::new(MemoryStore::new());
        let embedder = KeywordEmbedder;
        for (collection, id, text, meta) in [
            ("hoa", "1", "The pool opens at 9am.", json!({"source": "rules.pdf", "page": 2})),
            ("hoa", "2", "Pets must be leashed.", json!({"source": "pets.txt", "chunk": 0, "total_chunks": 1})),
            ("gym", "3", "The gym is open late.", json!({"source": "gym.docx", "chunk": 1, "total_chunks": 3})),
        ] {
            if !store.collection_exists(collection).await.unwrap() {
                store.create_collection(collection, None).await.unwrap();
            }
            store
                .upsert(
                    collection,
                    vec![VectorRecord {
                        id: id.to_string(),
                        embedding: embedder.embed(text).await.unwrap(),
                        text: text.to_string(),
                        metadata: metadata(meta),
                    }],
                )
                .await
                .unwrap();
        }

        let backend = Arc::new(Scripted {
            reply,
            prompts: Mutex::new(Vec::new()),
        });
        let llm = LlmService::from_backends(vec![backend.clone()], ProviderKind::Ollama);
        let rag = RagService::new(store, Arc::new(KeywordEmbedder), llm, Arc::new(Semaphore::new(1)));
        (rag, backend)
    }

    fn chat(query: &str, collection: Option<&str>) -> ChatRequest {
        ChatRequest {
            collection_name: collection.map(str::to_string),
            query: query.to_string(),
            history: None,
            model: None,
            tags: None,
            include_untagged: true,
            n_results: 5,
            conversation_id: None,
        }
    }

    #[test]
    fn display_names_prefer_filename_and_location() {
        let page = metadata(json!({"source": "rules.pdf", "page": 3}));
        assert_eq!(display_name(&page, 0), "rules.pdf, page 3");

        let section = metadata(json!({"source": "notes.txt", "chunk": 1, "total_chunks": 4}));
        assert_eq!(display_name(&section, 0), "notes.txt, section 2 of 4");

        let single = metadata(json!({"source": "memo.txt", "chunk": 0, "total_chunks": 1}));
        assert_eq!(display_name(&single, 0), "memo.txt");

        let renamed = metadata(json!({"original_filename": "Budget.xlsx", "source": "tmp123"}));
        assert_eq!(display_name(&renamed, 0), "Budget.xlsx");

        assert_eq!(display_name(&Metadata::new(), 2), "Document 3");
    }

    #[test]
    fn context_lists_labelled_passages() {
        assert_eq!(build_context(&[]), NO_CONTEXT_MESSAGE);

        let passages = vec![
            RetrievedPassage {
                id: "a".into(),
                text: "Pool hours".into(),
                metadata: metadata(json!({"source": "rules.pdf", "page": 1})),
                collection: "hoa".into(),
                distance: 0.1,
            },
            RetrievedPassage {
                id: "b".into(),
                text: "Gym hours".into(),
                metadata: Metadata::new(),
                collection: "hoa".into(),
                distance: 0.2,
            },
        ];
        assert_eq!(
            build_context(&passages),
            "[rules.pdf, page 1]: Pool hours\n\n[Document 2]: Gym hours"
        );
    }

    #[test]
    fn history_skips_unknown_roles() {
        let history = vec![
            ChatMessage::user("hi"),
            ChatMessage {
                role: "system".into(),
                content: "ignored".into(),
            },
            ChatMessage::assistant("hello"),
        ];
        assert_eq!(
            format_history(&history),
            "Previous conversation:\nUser: hi\nAssistant: hello\n"
        );
        assert_eq!(format_history(&[]), "");

        let prompt = build_prompt("[a.txt]: x", &history, "what?");
        assert!(prompt.contains("Context:\n[a.txt]: x"));
        assert!(prompt.contains("User: hi"));
        assert!(prompt.ends_with("Question: what?\n\nAnswer:"));
    }

    #[test]
    fn similarity_is_clamped() {
        assert_eq!(similarity(0.25), 0.75);
        assert_eq!(similarity(1.4), 0.0);
    }

    #[test]
    fn titles_are_cleaned_and_fall_back_to_words() {
        assert_eq!(clean_title("  \"Pool opening hours\"  "), "Pool opening hours");
        let long = "a".repeat(60);
        assert_eq!(clean_title(&long), format!("{}...", "a".repeat(50)));

        assert_eq!(fallback_title("when does the pool open"), "when does the pool open");
        assert_eq!(
            fallback_title("when does the community pool open on weekends"),
            "when does the community pool open..."
        );
    }

    #[test]
    fn tag_prompt_caps_samples() {
        let texts: Vec<String> = (0..8).map(|i| format!("text-{i}")).collect();
        let existing: Vec<String> = (0..25).map(|i| format!("tag{i}")).collect();
        let prompt = tag_prompt(&texts, &existing, 4);
        assert!(prompt.contains("Suggest 4 tags"));
        assert!(prompt.contains("text-4"));
        assert!(!prompt.contains("text-5"));
        assert!(prompt.contains("tag19"));
        assert!(!prompt.contains("tag20"));

        let huge = vec!["x".repeat(5000)];
        assert!(tag_prompt(&huge, &[], 8).contains(&format!("{}...", "x".repeat(3000))));
    }

    #[tokio::test]
    async fn retrieval_across_collections_merges_by_distance() {
        let (rag, _) = service(Some("ok")).await;

        let all = rag.retrieve("gym", &RetrievalScope::All, 2, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "3");
        assert_eq!(all[0].collection, "gym");
        assert!(all[0].distance <= all[1].distance);

        let scoped = rag
            .retrieve("gym", &RetrievalScope::Collection("hoa".into()), 5, None)
            .await
            .unwrap();
        assert!(scoped.iter().all(|passage| passage.collection == "hoa"));
    }

    #[tokio::test]
    async fn answer_returns_sources_and_extended_history() {
        let (rag, backend) = service(Some("The pool opens at 9am [rules.pdf, page 2].")).await;
        let mut request = chat("When does the pool open?", Some("hoa"));
        request.history = Some(vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")]);

        let response = rag.answer(&request).await.unwrap();
        assert_eq!(response.answer, "The pool opens at 9am [rules.pdf, page 2].");
        assert_eq!(response.sources[0].display_name, "rules.pdf, page 2");
        assert_eq!(response.sources[0].collection, "hoa");
        assert_eq!(response.history.len(), 4);
        assert_eq!(response.history[2], ChatMessage::user("When does the pool open?"));

        let prompts = backend.prompts.lock();
        assert!(prompts[0].contains("[rules.pdf, page 2]: The pool opens at 9am."));
        assert!(prompts[0].contains("Previous conversation:\nUser: hi"));
    }

    #[tokio::test]
    async fn passages_without_text_are_not_cited() {
        let store = Arc::new(MemoryStore::new());
        store.create_collection("notes", None).await.unwrap();
        let records = [("blank", ""), ("pool", "Pool hours are posted.")]
            .into_iter()
            .map(|(id, text)| VectorRecord {
                id: id.to_string(),
                embedding: vec![1.0, 0.01, 0.01],
                text: text.to_string(),
                metadata: metadata(json!({"source": format!("{id}.txt")})),
            })
            .collect();
        store.upsert("notes", records).await.unwrap();

        let backend = Arc::new(Scripted {
            reply: Some("posted"),
            prompts: Mutex::new(Vec::new()),
        });
        let llm = LlmService::from_backends(vec![backend.clone()], ProviderKind::Ollama);
        let rag = RagService::new(store, Arc::new(KeywordEmbedder), llm, Arc::new(Semaphore::new(1)));

        let response = rag.answer(&chat("pool", Some("notes"))).await.unwrap();
        assert_eq!(response.sources.len(), 1);
        assert_eq!(response.sources[0].id, "pool");
        assert_eq!(response.sources[0].display_name, "pool.txt");
        assert!(backend.prompts.lock()[0].contains("[pool.txt]: Pool hours are posted."));
    }

    #[tokio::test]
    async fn streaming_answer_reports_tokens() {
        let (rag, _) = service(Some("nine in the morning")).await;
        let mut tokens = Vec::new();
        let response = rag
            .answer_streaming(&chat("pool", None), |token| tokens.push(token.to_string()))
            .await
            .unwrap();
        assert_eq!(tokens.concat(), "nine in the morning");
        assert_eq!(tokens.len(), 4);
        assert_eq!(response.answer, "nine in the morning");
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let (rag, _) = service(Some("x")).await;
        assert!(rag.answer(&chat("   ", None)).await.is_err());
    }

    #[tokio::test]
    async fn title_generation_falls_back_when_the_model_fails() {
        let (rag, _) = service(None).await;
        let messages = vec![ChatMessage::user("what are the rules for guests at the pool")];
        assert_eq!(
            rag.generate_title(&messages, None).await,
            "what are the rules for guests..."
        );
        assert_eq!(
            rag.generate_title(&[ChatMessage::assistant("hi")], None).await,
            UNTITLED_CONVERSATION
        );

        let (rag, _) = service(Some("'Guest rules at the pool'")).await;
        assert_eq!(rag.generate_title(&messages, None).await, "Guest rules at the pool");
    }

    #[tokio::test]
    async fn suggested_tags_are_cleaned() {
        let (rag, backend) = service(Some("1. Pool Rules\n- Safety\n\"hours\"\nx")).await;
        let tags = rag
            .suggest_tags(&["Pool rules text".to_string()], &["safety".to_string()], None, 2)
            .await
            .unwrap();
        assert_eq!(tags, vec!["pool-rules", "safety"]);
        assert!(backend.prompts.lock()[0].contains("Existing tags (reuse these when they fit): safety"));
    }
}
