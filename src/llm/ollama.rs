use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{
    ensure_success, normalize_err_body, spawn_line_stream, GenerationOptions, LineEvent,
    LlmBackend, ProviderKind, TokenStream,
};

#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
    default_model: String,
    options: GenerationOptions,
}

#[derive(Serialize)]
struct GenerateReq<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    num_predict: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResp {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: "llama2".to_string(),
            options: GenerationOptions {
                temperature: 0.7,
                max_tokens: 1024,
            },
        }
    }

    pub fn with_generation(mut self, default_model: impl Into<String>, options: GenerationOptions) -> Self {
        self.default_model = default_model.into();
        self.options = options;
        self
    }

    pub async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let input = text.trim();
        if input.is_empty() {
            anyhow::bail!("cannot embed empty text input");
        }

        match self.embed_with_endpoint_fallback(model, input).await {
            Ok(vector) => Ok(vector),
            Err(err) => {
                if !is_context_length_error(&err) {
                    return Err(err);
                }

                let word_count = input.split_whitespace().count();
                let mut last_err = err;
                for max_words in [1400usize, 1000, 800, 600, 450, 320, 240, 180, 120] {
                    if word_count <= max_words {
                        continue;
                    }

                    let truncated = truncate_to_word_limit(input, max_words);
                    tracing::debug!("retrying embedding truncated to {} words", max_words);
                    match self.embed_with_endpoint_fallback(model, &truncated).await {
                        Ok(vector) => return Ok(vector),
                        Err(next_err) => {
                            if !is_context_length_error(&next_err) {
                                return Err(next_err);
                            }
                            last_err = next_err;
                        }
                    }
                }

                Err(anyhow::anyhow!(
                    "ollama embedding exceeded context length even after adaptive truncation \
                     (original_words={word_count}). last error: {last_err}"
                ))
            }
        }
    }

    async fn embed_with_endpoint_fallback(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        // /api/embed on current releases, /api/embeddings on older ones.
        match self.embed_modern(model, text).await {
            Ok(vector) => Ok(vector),
            Err(modern_err) => match self.embed_legacy(model, text).await {
                Ok(vector) => Ok(vector),
                Err(legacy_err) => Err(anyhow::anyhow!(
                    "ollama embedding failed via /api/embed and /api/embeddings. \
                     modern error: {modern_err}; legacy error: {legacy_err}; \
                     ensure the embedding model is pulled (e.g. `ollama pull {model}`)"
                )),
            },
        }
    }

    async fn embed_modern(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        #[derive(Serialize)]
        struct EmbedReq<'a> {
            model: &'a str,
            input: &'a str,
        }

        #[derive(Deserialize)]
        struct EmbedResp {
            embeddings: Vec<Vec<f32>>,
        }

        let url = format!("{}/api/embed", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&EmbedReq { model, input: text })
            .send()
            .await
            .context("failed to call ollama embed endpoint")?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "ollama /api/embed returned {status}: {}",
                normalize_err_body(&body)
            );
        }

        let response = response
            .json::<EmbedResp>()
            .await
            .context("failed to decode ollama /api/embed response")?;

        response
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("ollama /api/embed returned empty embeddings array"))
    }

    async fn embed_legacy(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        #[derive(Serialize)]
        struct EmbeddingReq<'a> {
            model: &'a str,
            prompt: &'a str,
        }

        #[derive(Deserialize)]
        struct EmbeddingResp {
            embedding: Vec<f32>,
        }

        let url = format!("{}/api/embeddings", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&EmbeddingReq {
                model,
                prompt: text,
            })
            .send()
            .await
            .context("failed to call ollama embeddings endpoint")?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "ollama /api/embeddings returned {status}: {}",
                normalize_err_body(&body)
            );
        }

        let response = response
            .json::<EmbeddingResp>()
            .await
            .context("failed to decode ollama embeddings response")?;

        Ok(response.embedding)
    }

    async fn send_generate(&self, model: &str, prompt: &str, stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&GenerateReq {
                model,
                prompt,
                stream,
                options: GenerateOptions {
                    num_predict: self.options.max_tokens,
                    temperature: self.options.temperature,
                },
            })
            .send()
            .await
            .context("failed to call ollama generate endpoint")?;
        ensure_success(response, ProviderKind::Ollama).await
    }
}

#[async_trait]
impl LlmBackend for OllamaClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn complete(&self, model: &str, prompt: &str) -> Result<String> {
        let response = self
            .send_generate(model, prompt, false)
            .await?
            .json::<GenerateResp>()
            .await
            .context("failed to decode ollama generate response")?;

        if let Some(err) = response.error {
            anyhow::bail!("ollama generate failed: {err}");
        }
        Ok(response.response.trim().to_string())
    }

    async fn stream(&self, model: &str, prompt: &str) -> Result<TokenStream> {
        let response = self.send_generate(model, prompt, true).await?;
        Ok(spawn_line_stream(response, ProviderKind::Ollama, parse_stream_line))
    }
}

/// One NDJSON object per line: `{"response": "...", "done": false}`.
fn parse_stream_line(line: &str) -> Result<LineEvent> {
    if line.is_empty() {
        return Ok(LineEvent::Skip);
    }

    let chunk: GenerateResp =
        serde_json::from_str(line).context("failed to decode ollama stream chunk")?;
    if let Some(err) = chunk.error {
        anyhow::bail!("ollama stream failed: {err}");
    }
    if chunk.done {
        return Ok(if chunk.response.is_empty() {
            LineEvent::Done
        } else {
            LineEvent::Token(chunk.response)
        });
    }
    if chunk.response.is_empty() {
        return Ok(LineEvent::Skip);
    }
    Ok(LineEvent::Token(chunk.response))
}

fn is_context_length_error(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("input length exceeds the context length")
        || (msg.contains("context length") && msg.contains("input length"))
}

fn truncate_to_word_limit(text: &str, max_words: usize) -> String {
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ndjson_stream_lines() {
        assert_eq!(
            parse_stream_line(r#"{"model":"llama2","response":"Hel","done":false}"#).unwrap(),
            LineEvent::Token("Hel".to_string())
        );
        assert_eq!(
            parse_stream_line(r#"{"model":"llama2","response":"","done":true,"eval_count":12}"#)
                .unwrap(),
            LineEvent::Done
        );
        assert_eq!(parse_stream_line("").unwrap(), LineEvent::Skip);
        assert!(parse_stream_line(r#"{"error":"model 'x' not found"}"#).is_err());
        assert!(parse_stream_line("not json").is_err());
    }

    #[test]
    fn context_length_errors_are_detected() {
        let err = anyhow::anyhow!("ollama /api/embed returned 500: the input length exceeds the context length");
        assert!(is_context_length_error(&err));
        assert!(!is_context_length_error(&anyhow::anyhow!("connection refused")));
    }

    #[test]
    fn truncation_keeps_leading_words() {
        assert_eq!(truncate_to_word_limit("a  b\nc d", 3), "a b c");
    }
}
