use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{
    ensure_success, spawn_line_stream, GenerationOptions, LineEvent, LlmBackend, ProviderKind,
    TokenStream,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct AnthropicClient {
    client: Client,
    base_url: String,
    api_key: String,
    default_model: String,
    options: GenerationOptions,
}

#[derive(Serialize)]
struct MessagesReq<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    messages: Vec<MessageParam<'a>>,
}

#[derive(Serialize)]
struct MessageParam<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResp {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: Delta },
    #[serde(rename = "message_stop")]
    MessageStop {},
    #[serde(rename = "error")]
    Error { error: StreamError },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct StreamError {
    message: String,
}

impl AnthropicClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
        options: GenerationOptions,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            default_model: default_model.into(),
            options,
        }
    }

    async fn send(&self, model: &str, prompt: &str, stream: bool) -> Result<reqwest::Response> {
        let body = MessagesReq {
            model,
            max_tokens: self.options.max_tokens,
            temperature: self.options.temperature,
            stream,
            messages: vec![MessageParam {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("failed to call anthropic messages endpoint")?;
        ensure_success(response, ProviderKind::Anthropic).await
    }
}

#[async_trait]
impl LlmBackend for AnthropicClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn complete(&self, model: &str, prompt: &str) -> Result<String> {
        let response = self
            .send(model, prompt, false)
            .await?
            .json::<MessagesResp>()
            .await
            .context("failed to decode anthropic messages response")?;

        let text: String = response
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect();
        Ok(text.trim().to_string())
    }

    async fn stream(&self, model: &str, prompt: &str) -> Result<TokenStream> {
        let response = self.send(model, prompt, true).await?;
        Ok(spawn_line_stream(response, ProviderKind::Anthropic, parse_stream_line))
    }
}

/// Server-sent events; only `data:` lines carry payloads.
fn parse_stream_line(line: &str) -> Result<LineEvent> {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return Ok(LineEvent::Skip);
    };
    if data.is_empty() {
        return Ok(LineEvent::Skip);
    }

    let event: StreamEvent =
        serde_json::from_str(data).context("failed to decode anthropic stream event")?;
    Ok(match event {
        StreamEvent::ContentBlockDelta { delta } => match delta.text {
            Some(text) if !text.is_empty() => LineEvent::Token(text),
            _ => LineEvent::Skip,
        },
        StreamEvent::MessageStop {} => LineEvent::Done,
        StreamEvent::Error { error } => anyhow::bail!("anthropic stream failed: {}", error.message),
        StreamEvent::Other => LineEvent::Skip,
    })
}
