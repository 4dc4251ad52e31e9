use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{
    ensure_success, spawn_line_stream, GenerationOptions, LineEvent, LlmBackend, ProviderKind,
    TokenStream,
};

#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    default_model: String,
    options: GenerationOptions,
}

#[derive(Serialize)]
struct ChatReq<'a> {
    model: &'a str,
    messages: Vec<ChatMessageParam<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessageParam<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResp {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    delta: Option<ResponseMessage>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            default_model: "gpt-4o".to_string(),
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
        #[derive(Serialize)]
        struct EmbeddingReq<'a> {
            model: &'a str,
            input: &'a str,
        }

        #[derive(Deserialize)]
        struct EmbeddingResp {
            data: Vec<EmbeddingData>,
        }

        #[derive(Deserialize)]
        struct EmbeddingData {
            embedding: Vec<f32>,
        }

        let input = text.trim();
        if input.is_empty() {
            anyhow::bail!("cannot embed empty text input");
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&EmbeddingReq { model, input })
            .send()
            .await
            .context("failed to call openai embeddings endpoint")?;
        let response = ensure_success(response, ProviderKind::OpenAi)
            .await?
            .json::<EmbeddingResp>()
            .await
            .context("failed to decode openai embeddings response")?;

        response
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .ok_or_else(|| anyhow::anyhow!("openai embeddings returned no data"))
    }

    async fn send_chat(&self, model: &str, prompt: &str, stream: bool) -> Result<reqwest::Response> {
        let body = ChatReq {
            model,
            messages: vec![ChatMessageParam {
                role: "user",
                content: prompt,
            }],
            temperature: self.options.temperature,
            max_tokens: self.options.max_tokens,
            stream,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("failed to call openai chat completions endpoint")?;
        ensure_success(response, ProviderKind::OpenAi).await
    }
}

#[async_trait]
impl LlmBackend for OpenAiClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn complete(&self, model: &str, prompt: &str) -> Result<String> {
        let response = self
            .send_chat(model, prompt, false)
            .await?
            .json::<ChatResp>()
            .await
            .context("failed to decode openai chat response")?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .unwrap_or_default();
        Ok(content.trim().to_string())
    }

    async fn stream(&self, model: &str, prompt: &str) -> Result<TokenStream> {
        let response = self.send_chat(model, prompt, true).await?;
        Ok(spawn_line_stream(response, ProviderKind::OpenAi, parse_stream_line))
    }
}

fn parse_stream_line(line: &str) -> Result<LineEvent> {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return Ok(LineEvent::Skip);
    };
    if data == "[DONE]" {
        return Ok(LineEvent::Done);
    }
    if data.is_empty() {
        return Ok(LineEvent::Skip);
    }

    let chunk: ChatResp =
        serde_json::from_str(data).context("failed to decode openai stream chunk")?;
    let token = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .unwrap_or_default();

    Ok(if token.is_empty() {
        LineEvent::Skip
    } else {
        LineEvent::Token(token)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sse_chunks() {
        assert_eq!(
            parse_stream_line(r#"data: {"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#).unwrap(),
            LineEvent::Token("Hel".to_string())
        );
        assert_eq!(
            parse_stream_line(r#"data: {"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#)
                .unwrap(),
            LineEvent::Skip
        );
        assert_eq!(parse_stream_line("data: [DONE]").unwrap(), LineEvent::Done);
        assert_eq!(parse_stream_line(": keep-alive").unwrap(), LineEvent::Skip);
        assert!(parse_stream_line("data: {broken").is_err());
    }
}
