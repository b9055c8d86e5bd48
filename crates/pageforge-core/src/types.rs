//! Core types for PageForge

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use crate::usage::UsageRecord;
use crate::{Error, Result};

/// Shortest API key accepted before any upstream client is built
pub const MIN_API_KEY_LEN: usize = 10;

/// Raw inbound JSON body shared by every generation endpoint
///
/// `content` and `source` are interchangeable; `content` wins when both are
/// present and non-blank.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateBody {
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub content: Option<String>,

    #[serde(default)]
    pub source: Option<String>,

    #[serde(default)]
    pub format_prompt: Option<String>,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Defaults and limits applied when turning a body into a request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestDefaults {
    /// Output token budget when the caller sends none
    pub max_output_tokens: u32,

    /// Sampling temperature when the caller sends none
    pub temperature: f32,

    /// Content is cut to this many characters before going upstream
    pub max_content_chars: usize,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            max_output_tokens: 65_536,
            temperature: 1.0,
            max_content_chars: 100_000,
        }
    }
}

/// Sampling parameters for one upstream call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_output_tokens: u32,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

impl GenerationParams {
    /// Smaller, cooler variant used by the reduced-parameter fallback
    pub fn reduced(&self, token_divisor: u32) -> Self {
        let divisor = token_divisor.max(1);
        Self {
            max_output_tokens: (self.max_output_tokens / divisor).max(1),
            temperature: self.temperature / 2.0,
            ..*self
        }
    }
}

/// Inputs to one generation run
#[derive(Clone)]
pub struct GenerationRequest {
    pub api_key: String,
    pub content: String,
    pub format_instructions: Option<String>,
    pub params: GenerationParams,
    pub session_id: Uuid,
}

impl GenerationRequest {
    /// Validate an inbound body and apply defaults and the content limit
    pub fn from_body(body: GenerateBody, defaults: &RequestDefaults) -> Result<Self> {
        let api_key = body
            .api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .ok_or_else(|| Error::invalid_request("API key is required"))?;

        if api_key.len() < MIN_API_KEY_LEN {
            return Err(Error::invalid_request("Invalid API key"));
        }

        let content = non_blank(body.content)
            .or_else(|| non_blank(body.source))
            .ok_or_else(|| Error::invalid_request("Source code or text is required"))?;

        let content = if content.chars().count() > defaults.max_content_chars {
            debug!(
                limit = defaults.max_content_chars,
                "Content exceeds limit, truncating"
            );
            truncate_chars(&content, defaults.max_content_chars).to_string()
        } else {
            content
        };

        Ok(Self {
            api_key,
            content,
            format_instructions: non_blank(body.format_prompt),
            params: GenerationParams {
                max_output_tokens: body.max_tokens.unwrap_or(defaults.max_output_tokens),
                temperature: body.temperature.unwrap_or(defaults.temperature),
                top_p: None,
                top_k: None,
            },
            session_id: Uuid::new_v4(),
        })
    }

    /// First four characters of the key, safe for logs
    pub fn redacted_key(&self) -> String {
        redact_key(&self.api_key)
    }
}

impl fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("api_key", &self.redacted_key())
            .field("content_chars", &self.content.chars().count())
            .field("format_instructions", &self.format_instructions.is_some())
            .field("params", &self.params)
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Mask an API key down to its first four characters
pub fn redact_key(key: &str) -> String {
    format!("{}...", truncate_chars(key, 4))
}

/// Longest prefix of `s` holding at most `max` characters
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Text payload of a streamed fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextDelta {
    pub text: String,
}

/// One outward event, tagged with the session it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub session_id: Uuid,

    #[serde(flatten)]
    pub payload: EventPayload,
}

impl StreamEvent {
    pub fn new(session_id: Uuid, payload: EventPayload) -> Self {
        Self {
            session_id,
            payload,
        }
    }

    /// Wire name of this event (`event:` line in SSE framing)
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

/// Type-specific part of a [`StreamEvent`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Always first, sent before any upstream call
    StreamStart { message: String },

    /// Progress notes (model acquired, fallback step starting)
    Status { message: String },

    /// Status-class notice sent before each overload retry sleep
    Info {
        message: String,
        attempt: u32,
        retry_in_seconds: f64,
    },

    /// Content-free heartbeat for idle-timeout intermediaries
    Keepalive,

    /// Whole body produced by a non-streaming strategy
    Content { chunk: String },

    /// Batched fragment of a streamed response
    ContentBlockDelta { delta: TextDelta },

    /// Terminal success, carrying the assembled document
    MessageComplete {
        message: String,
        html: String,
        usage: UsageRecord,
        partial: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },

    /// Terminal failure
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    /// Always last
    StreamEnd,
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StreamStart { .. } => "stream_start",
            Self::Status { .. } => "status",
            Self::Info { .. } => "info",
            Self::Keepalive => "keepalive",
            Self::Content { .. } => "content",
            Self::ContentBlockDelta { .. } => "content_block_delta",
            Self::MessageComplete { .. } => "message_complete",
            Self::Error { .. } => "error",
            Self::StreamEnd => "stream_end",
        }
    }

    /// `message_complete` or `error`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MessageComplete { .. } | Self::Error { .. })
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    pub fn delta(text: impl Into<String>) -> Self {
        Self::ContentBlockDelta {
            delta: TextDelta { text: text.into() },
        }
    }
}
