//! Anthropic Messages API adapter
//!
//! Parses the Messages streaming format:
//! ```text
//! event: message_start
//! data: {"type":"message_start","message":{"usage":{"input_tokens":25}}}
//!
//! event: content_block_delta
//! data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}
//!
//! event: message_delta
//! data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":15}}
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::sse::{decode_stream, FrameOutcome, SseFrame};
use super::{build_http_client, classify_http_error, error_from_response};
use crate::stream_adapter::{
    Capabilities, ChunkStream, Part, ResponseShape, UpstreamClient, UpstreamConnector,
    UpstreamResponse,
};
use crate::types::GenerationParams;
use crate::usage::ReportedUsage;
use crate::{Error, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic connector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicConfig {
    pub base_url: String,
    pub model: String,
    pub streaming: bool,
    pub connect_timeout_secs: u64,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-3-7-sonnet-20250219".to_string(),
            streaming: true,
            connect_timeout_secs: 10,
        }
    }
}

/// Creates [`AnthropicClient`]s sharing one HTTP connection pool
#[derive(Debug, Clone)]
pub struct AnthropicConnector {
    http: reqwest::Client,
    config: Arc<AnthropicConfig>,
}

impl AnthropicConnector {
    pub fn new(config: AnthropicConfig) -> Result<Self> {
        let http = build_http_client(Duration::from_secs(config.connect_timeout_secs))?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }
}

impl UpstreamConnector for AnthropicConnector {
    fn provider(&self) -> &str {
        "anthropic"
    }

    fn connect(&self, api_key: &str) -> Result<Arc<dyn UpstreamClient>> {
        if api_key.trim().is_empty() {
            return Err(Error::authentication("missing Anthropic API key"));
        }
        Ok(Arc::new(AnthropicClient {
            http: self.http.clone(),
            config: self.config.clone(),
            api_key: api_key.to_string(),
            capabilities: Capabilities {
                streaming: self.config.streaming,
                reports_usage: true,
            },
        }))
    }
}

/// Claude model bound to one API key
pub struct AnthropicClient {
    http: reqwest::Client,
    config: Arc<AnthropicConfig>,
    api_key: String,
    capabilities: Capabilities,
}

impl std::fmt::Debug for AnthropicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicClient")
            .field("model", &self.config.model)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl AnthropicClient {
    async fn send(
        &self,
        prompt: &str,
        params: &GenerationParams,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: params.max_output_tokens,
            temperature: params.temperature,
            messages: vec![RequestMessage {
                role: "user",
                content: prompt,
            }],
            stream,
        };

        let response = self
            .http
            .post(format!(
                "{}/v1/messages",
                self.config.base_url.trim_end_matches('/')
            ))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl UpstreamClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<UpstreamResponse> {
        debug!(model = %self.config.model, "Anthropic messages");
        let response = self.send(prompt, params, false).await?;
        let message: MessagesResponse = response.json().await?;

        let parts = message
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .map(|block| Part { text: block.text })
            .collect();

        let mut result = UpstreamResponse::new(vec![ResponseShape::Parts(parts)]);
        if let Some(usage) = message.usage {
            result = result.with_usage(usage.into());
        }
        if let Some(reason) = message.stop_reason {
            result = result.with_finish_reason(reason);
        }
        Ok(result)
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ChunkStream> {
        debug!(model = %self.config.model, "Anthropic messages stream");
        let response = self.send(prompt, params, true).await?;
        Ok(decode_stream(response, parse_frame))
    }
}

fn parse_frame(frame: SseFrame) -> FrameOutcome {
    let event: StreamEvent = match serde_json::from_str(&frame.data) {
        Ok(event) => event,
        Err(e) => {
            return FrameOutcome::Fail(Error::upstream(format!(
                "failed to parse Anthropic event: {}",
                e
            )))
        }
    };

    match event {
        StreamEvent::MessageStart { message } => match message.usage {
            Some(usage) => FrameOutcome::Chunk(UpstreamResponse::empty().with_usage(usage.into())),
            None => FrameOutcome::Skip,
        },
        StreamEvent::ContentBlockDelta { delta } => match delta.text {
            Some(text) if !text.is_empty() => FrameOutcome::Chunk(UpstreamResponse::text(text)),
            _ => FrameOutcome::Skip,
        },
        StreamEvent::MessageDelta { delta, usage } => {
            let mut chunk = UpstreamResponse::empty();
            if let Some(usage) = usage {
                chunk = chunk.with_usage(usage.into());
            }
            if let Some(reason) = delta.and_then(|d| d.stop_reason) {
                chunk = chunk.with_finish_reason(reason);
            }
            FrameOutcome::Chunk(chunk)
        }
        StreamEvent::MessageStop => FrameOutcome::Done,
        StreamEvent::Error { error } => {
            let body = serde_json::json!({ "error": error }).to_string();
            FrameOutcome::Fail(classify_http_error(500, &body))
        }
        StreamEvent::Other => FrameOutcome::Skip,
    }
}

// =============================================================================
// Anthropic Wire Structures
// =============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<RequestMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct RequestMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<MessageUsage>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

impl From<MessageUsage> for ReportedUsage {
    fn from(usage: MessageUsage) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockDelta {
        delta: TextDelta,
    },
    MessageDelta {
        delta: Option<StopDelta>,
        usage: Option<MessageUsage>,
    },
    MessageStop,
    Error {
        error: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    usage: Option<MessageUsage>,
}

#[derive(Debug, Deserialize)]
struct TextDelta {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StopDelta {
    stop_reason: Option<String>,
}
