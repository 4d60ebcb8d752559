use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::core::config::LlmConfig;
use crate::core::llm::sse::SseAccumulator;
use crate::core::llm::{
    Completion, ContentBlock, LlmError, LlmProvider, LlmRequest, Message, StopReason, TextCallback,
    TokenUsage, ToolDefinition, ToolResponse,
};

// ── Messages API request/response ──

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolDefinition],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

fn no_tools(tools: &&[ToolDefinition]) -> bool {
    tools.is_empty()
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    content: Vec<Value>,
    stop_reason: Option<StopReason>,
    #[serde(default)]
    usage: TokenUsage,
}

#[derive(Deserialize)]
struct WireErrorBody {
    error: WireError,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    message: String,
}

// ── Provider ──

pub struct AnthropicProvider {
    base_url: String,
    model: String,
    api_key: String,
    api_version: String,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(config: &LlmConfig, api_key: String) -> Self {
        Self {
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            api_key,
            api_version: config.api_version.clone(),
            client: Client::new(),
        }
    }

    async fn send(&self, request: &LlmRequest, stream: bool) -> Result<reqwest::Response, LlmError> {
        let body = WireRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            system: &request.system,
            messages: &request.messages,
            tools: &request.tools,
            stream,
        };
        let res = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .json(&body)
            .send()
            .await?;

        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let text = res.text().await.unwrap_or_default();
        let message = serde_json::from_str::<WireErrorBody>(&text)
            .map(|b| b.error.message)
            .unwrap_or(text);
        Err(map_status(status, message))
    }
}

fn map_status(status: StatusCode, message: String) -> LlmError {
    match status.as_u16() {
        401 | 403 => LlmError::Auth(message),
        429 => LlmError::RateLimited,
        503 | 529 => LlmError::Overloaded,
        400 | 404 | 413 | 422 => LlmError::InvalidRequest(message),
        code => LlmError::Api {
            status: code,
            message,
        },
    }
}

/// Keep the block kinds the engine understands and drop the rest
/// (server-side thinking blocks and the like).
pub(crate) fn decode_blocks(raw: Vec<Value>) -> Vec<ContentBlock> {
    raw.into_iter()
        .filter_map(|v| match serde_json::from_value::<ContentBlock>(v) {
            Ok(block) => Some(block),
            Err(e) => {
                debug!("dropping unrecognized content block: {}", e);
                None
            }
        })
        .collect()
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &LlmRequest) -> Result<Completion, LlmError> {
        let mut plain = request.clone();
        plain.tools.clear();
        let resp = self.complete_with_tools(&plain).await?;
        Ok(Completion {
            text: resp.text(),
            usage: resp.usage,
        })
    }

    async fn complete_with_tools(&self, request: &LlmRequest) -> Result<ToolResponse, LlmError> {
        let res = self.send(request, false).await?;
        let parsed: WireResponse = res.json().await?;
        Ok(ToolResponse {
            stop_reason: parsed.stop_reason.unwrap_or(StopReason::EndTurn),
            content: decode_blocks(parsed.content),
            usage: parsed.usage,
        })
    }

    async fn stream_with_tools(
        &self,
        request: &LlmRequest,
        on_text: TextCallback<'_>,
    ) -> Result<ToolResponse, LlmError> {
        let res = self.send(request, true).await?;
        let body = res.bytes_stream();
        tokio::pin!(body);
        let mut acc = SseAccumulator::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            acc.feed(&chunk, on_text)?;
            if acc.is_finished() {
                break;
            }
        }
        acc.finish()
    }
}
