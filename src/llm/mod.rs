mod anthropic;
mod ollama;
mod openai;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::LlmConfig;

pub use anthropic::AnthropicClient;
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;

/// Tokens as the provider produces them. The stream ends after the provider's final event.
pub type TokenStream = BoxStream<'static, Result<String>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Ollama,
    Anthropic,
    OpenAi,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Ollama,
        ProviderKind::Anthropic,
        ProviderKind::OpenAi,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(ProviderKind::Ollama),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "openai" => Ok(ProviderKind::OpenAi),
            other => Err(anyhow!("unknown llm provider {other:?}")),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn default_model(&self) -> &str;

    async fn complete(&self, model: &str, prompt: &str) -> Result<String>;

    async fn stream(&self, model: &str, prompt: &str) -> Result<TokenStream>;
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LineEvent {
    Token(String),
    Done,
    Skip,
}

/// Reads a streaming HTTP body line by line on a background task, handing each line to
/// `parse` and forwarding the tokens it yields. Lines are decoded only once complete, so a
/// multibyte character split across network chunks survives.
pub(crate) fn spawn_line_stream(
    response: reqwest::Response,
    provider: ProviderKind,
    parse: fn(&str) -> Result<LineEvent>,
) -> TokenStream {
    let (tx, rx) = mpsc::channel::<Result<String>>(64);

    tokio::spawn(async move {
        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = tx
                        .send(Err(anyhow!("{provider} stream interrupted: {err}")))
                        .await;
                    return;
                }
            };
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if !forward_line(&tx, parse, &line).await {
                    return;
                }
            }
        }

        if !buffer.is_empty() {
            forward_line(&tx, parse, &buffer).await;
        }
    });

    ReceiverStream::new(rx).boxed()
}

/// Parses one raw line and forwards its outcome. Returns false once reading should stop.
async fn forward_line(
    tx: &mpsc::Sender<Result<String>>,
    parse: fn(&str) -> Result<LineEvent>,
    raw: &[u8],
) -> bool {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    if line.is_empty() {
        return true;
    }

    match parse(line) {
        Ok(LineEvent::Token(token)) => tx.send(Ok(token)).await.is_ok(),
        Ok(LineEvent::Done) => false,
        Ok(LineEvent::Skip) => true,
        Err(err) => {
            let _ = tx.send(Err(err)).await;
            false
        }
    }
}

pub(crate) async fn ensure_success(
    response: reqwest::Response,
    provider: ProviderKind,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    bail!("{provider} returned {status}: {}", normalize_err_body(&body))
}

pub(crate) fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = json.get("error").and_then(|v| v.as_str()) {
            return err.to_string();
        }
        if let Some(err) = json
            .get("error")
            .and_then(|v| v.get("message"))
            .and_then(|v| v.as_str())
        {
            return err.to_string();
        }
    }

    trimmed.to_string()
}

/// Splits `provider:model`. A prefix that names no provider is treated as part of the
/// model name, so Ollama tags such as `llama3:8b` select the default provider.
pub fn parse_model_string(raw: Option<&str>, default: ProviderKind) -> (ProviderKind, Option<String>) {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return (default, None);
    };

    if let Some((prefix, model)) = raw.split_once(':') {
        if let Ok(provider) = prefix.parse::<ProviderKind>() {
            let model = model.trim();
            return (provider, (!model.is_empty()).then(|| model.to_string()));
        }
    }

    (default, Some(raw.to_string()))
}

#[derive(Clone)]
pub struct LlmService {
    backends: Vec<Arc<dyn LlmBackend>>,
    default_provider: ProviderKind,
}

impl LlmService {
    pub fn new(config: &LlmConfig) -> Self {
        let options = GenerationOptions {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        };

        let mut backends: Vec<Arc<dyn LlmBackend>> = vec![Arc::new(
            OllamaClient::new(config.ollama_base_url.clone())
                .with_generation(config.ollama_default_model.clone(), options),
        )];
        if !config.anthropic_api_key.trim().is_empty() {
            backends.push(Arc::new(AnthropicClient::new(
                config.anthropic_base_url.clone(),
                config.anthropic_api_key.clone(),
                config.anthropic_default_model.clone(),
                options,
            )));
        }
        if !config.openai_api_key.trim().is_empty() {
            backends.push(Arc::new(
                OpenAiClient::new(config.openai_base_url.clone(), config.openai_api_key.clone())
                    .with_generation(config.openai_default_model.clone(), options),
            ));
        }

        Self::from_backends(backends, config.default_provider)
    }

    pub fn from_backends(backends: Vec<Arc<dyn LlmBackend>>, preferred: ProviderKind) -> Self {
        let available: Vec<ProviderKind> = backends.iter().map(|backend| backend.kind()).collect();
        let default_provider = if available.contains(&preferred) {
            preferred
        } else {
            let fallback = ProviderKind::ALL
                .into_iter()
                .find(|kind| available.contains(kind))
                .unwrap_or(preferred);
            tracing::warn!(
                "default llm provider {} is not configured, falling back to {}",
                preferred,
                fallback
            );
            fallback
        };

        Self {
            backends,
            default_provider,
        }
    }

    pub fn default_provider(&self) -> ProviderKind {
        self.default_provider
    }

    pub fn available(&self) -> Vec<ProviderKind> {
        self.backends.iter().map(|backend| backend.kind()).collect()
    }

    fn backend(&self, kind: ProviderKind) -> Option<&Arc<dyn LlmBackend>> {
        self.backends.iter().find(|backend| backend.kind() == kind)
    }

    /// Picks the backend and concrete model name for a request's model string.
    pub fn resolve(&self, model: Option<&str>) -> Result<(Arc<dyn LlmBackend>, String)> {
        let (provider, model_name) = parse_model_string(model, self.default_provider);

        if let Some(backend) = self.backend(provider) {
            let model_name = model_name.unwrap_or_else(|| backend.default_model().to_string());
            return Ok((backend.clone(), model_name));
        }

        let fallback = self.backend(self.default_provider).with_context(|| {
            format!(
                "llm provider {provider} is not available (configured: {:?})",
                self.available()
            )
        })?;
        tracing::warn!(
            "llm provider {} is not available, falling back to {}",
            provider,
            self.default_provider
        );
        Ok((fallback.clone(), fallback.default_model().to_string()))
    }

    pub async fn complete(&self, model: Option<&str>, prompt: &str) -> Result<String> {
        let (backend, model_name) = self.resolve(model)?;
        tracing::debug!("completing with {}:{}", backend.kind(), model_name);
        backend.complete(&model_name, prompt).await
    }

    /// Streams a completion, invoking `on_token` for every token, and returns the full text.
    pub async fn stream_with<F>(&self, model: Option<&str>, prompt: &str, mut on_token: F) -> Result<String>
    where
        F: FnMut(&str) + Send,
    {
        let (backend, model_name) = self.resolve(model)?;
        tracing::debug!("streaming with {}:{}", backend.kind(), model_name);

        let mut stream = backend.stream(&model_name, prompt).await?;
        let mut full = String::new();
        while let Some(token) = stream.next().await {
            let token = token?;
            if token.is_empty() {
                continue;
            }
            on_token(&token);
            full.push_str(&token);
        }
        Ok(full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(ProviderKind, &'static str);

    #[async_trait]
    impl LlmBackend for Fixed {
        fn kind(&self) -> ProviderKind {
            self.0
        }

        fn default_model(&self) -> &str {
            self.1
        }

        async fn complete(&self, model: &str, _prompt: &str) -> Result<String> {
            Ok(format!("{}:{model}", self.0))
        }

        async fn stream(&self, model: &str, _prompt: &str) -> Result<TokenStream> {
            let tokens = vec![Ok(format!("{}", self.0)), Ok(String::new()), Ok(format!(":{model}"))];
            Ok(futures::stream::iter(tokens).boxed())
        }
    }

    fn service(kinds: &[ProviderKind], preferred: ProviderKind) -> LlmService {
        let backends = kinds
            .iter()
            .map(|kind| {
                let default = match kind {
                    ProviderKind::Ollama => "llama2",
                    ProviderKind::Anthropic => "claude-3-haiku-20240307",
                    ProviderKind::OpenAi => "gpt-4o",
                };
                Arc::new(Fixed(*kind, default)) as Arc<dyn LlmBackend>
            })
            .collect();
        LlmService::from_backends(backends, preferred)
    }

    #[test]
    fn parses_provider_prefixes() {
        let default = ProviderKind::Ollama;
        assert_eq!(parse_model_string(None, default), (default, None));
        assert_eq!(parse_model_string(Some("  "), default), (default, None));
        assert_eq!(
            parse_model_string(Some("anthropic:claude-3-opus"), default),
            (ProviderKind::Anthropic, Some("claude-3-opus".to_string()))
        );
        assert_eq!(
            parse_model_string(Some("OpenAI:gpt-4o-mini"), default),
            (ProviderKind::OpenAi, Some("gpt-4o-mini".to_string()))
        );
        assert_eq!(
            parse_model_string(Some("llama3:8b"), default),
            (default, Some("llama3:8b".to_string()))
        );
        assert_eq!(
            parse_model_string(Some("mistral"), default),
            (default, Some("mistral".to_string()))
        );
        assert_eq!(
            parse_model_string(Some("openai:"), default),
            (ProviderKind::OpenAi, None)
        );
    }

    #[test]
    fn unavailable_default_falls_back_in_order() {
        let llm = service(&[ProviderKind::OpenAi, ProviderKind::Anthropic], ProviderKind::Ollama);
        assert_eq!(llm.default_provider(), ProviderKind::Anthropic);
    }

    #[tokio::test]
    async fn unavailable_provider_uses_default_model() {
        let llm = service(&[ProviderKind::Ollama], ProviderKind::Ollama);
        let answer = llm.complete(Some("anthropic:claude-3-opus"), "hi").await.unwrap();
        assert_eq!(answer, "ollama:llama2");

        let answer = llm.complete(Some("llama3:8b"), "hi").await.unwrap();
        assert_eq!(answer, "ollama:llama3:8b");
    }

    #[tokio::test]
    async fn stream_with_reports_tokens_and_skips_empty_ones() {
        let llm = service(&[ProviderKind::Ollama, ProviderKind::OpenAi], ProviderKind::Ollama);
        let mut seen = Vec::new();
        let full = llm
            .stream_with(Some("openai:gpt-4o"), "hi", |token| seen.push(token.to_string()))
            .await
            .unwrap();
        assert_eq!(full, "openai:gpt-4o");
        assert_eq!(seen, vec!["openai", ":gpt-4o"]);
    }

    fn streamed_response(chunks: Vec<&'static [u8]>) -> reqwest::Response {
        let body = futures::stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok::<_, std::io::Error>(chunk.to_vec())),
        );
        reqwest::Response::from(axum::http::Response::new(reqwest::Body::wrap_stream(body)))
    }

    fn token_per_line(line: &str) -> Result<LineEvent> {
        match line {
            "[END]" => Ok(LineEvent::Done),
            "[BAD]" => bail!("malformed line"),
            other => Ok(LineEvent::Token(other.to_string())),
        }
    }

    async fn collect(stream: TokenStream) -> Vec<Result<String>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn line_stream_keeps_characters_split_across_chunks() {
        let response = streamed_response(vec![&b"caf\xC3"[..], &b"\xA9\n\xE2\x9C"[..], &b"\x93 done\n"[..]]);
        let tokens: Vec<String> = collect(spawn_line_stream(response, ProviderKind::Ollama, token_per_line))
            .await
            .into_iter()
            .map(|token| token.unwrap())
            .collect();
        assert_eq!(tokens, vec!["café", "✓ done"]);
    }

    #[tokio::test]
    async fn line_stream_stops_at_done_and_reports_trailing_errors() {
        let response = streamed_response(vec![&b"one\n[END]\ntwo\n"[..]]);
        let tokens = collect(spawn_line_stream(response, ProviderKind::Ollama, token_per_line)).await;
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].as_ref().unwrap(), "one");

        let response = streamed_response(vec![&b"one\n"[..], &b"[BAD]"[..]]);
        let tokens = collect(spawn_line_stream(response, ProviderKind::Ollama, token_per_line)).await;
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].as_ref().unwrap(), "one");
        assert!(tokens[1].is_err());
    }

    #[test]
    fn error_bodies_are_unwrapped() {
        assert_eq!(normalize_err_body(r#"{"error":"model not found"}"#), "model not found");
        assert_eq!(
            normalize_err_body(r#"{"error":{"message":"bad key","type":"auth"}}"#),
            "bad key"
        );
    }
}
