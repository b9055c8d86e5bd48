//! Upstream Adapter
//!
//! Normalizes the many shapes an upstream response can take into one
//! [`UpstreamResponse`] and extracts its text in a fixed priority order.
//! Also defines the [`UpstreamClient`] / [`UpstreamConnector`] seams that the
//! concrete adapters (Gemini, Anthropic, mock) implement.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

use crate::types::GenerationParams;
use crate::usage::ReportedUsage;
use crate::Result;

/// Debug-representation prefixes that must never be mistaken for content
const OPAQUE_MARKERS: &[&str] = &["<genai.", "GenerateContentResponse"];

/// One content part of a candidate or message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
        }
    }
}

/// One candidate completion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(default)]
    pub parts: Vec<Part>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// A view of an upstream response from which text may be read
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseShape {
    /// Text the SDK already resolved for us
    Resolved(String),

    /// Direct text attribute
    Text(String),

    /// Top-level parts list
    Parts(Vec<Part>),

    /// Candidates, each with content parts
    Candidates(Vec<Candidate>),

    /// String form of an object we do not otherwise understand
    Opaque(String),
}

impl ResponseShape {
    /// Lower values are tried first
    pub fn priority(&self) -> u8 {
        match self {
            Self::Resolved(_) => 0,
            Self::Text(_) => 1,
            Self::Parts(_) => 2,
            Self::Candidates(_) => 3,
            Self::Opaque(_) => 4,
        }
    }

    fn text(&self) -> String {
        match self {
            Self::Resolved(text) | Self::Text(text) => text.clone(),
            Self::Parts(parts) => join_parts(parts),
            Self::Candidates(candidates) => candidates
                .iter()
                .map(|c| join_parts(&c.parts))
                .collect(),
            Self::Opaque(raw) => {
                if looks_like_document(raw) {
                    raw.clone()
                } else {
                    String::new()
                }
            }
        }
    }
}

fn join_parts(parts: &[Part]) -> String {
    parts
        .iter()
        .filter_map(|p| p.text.as_deref())
        .collect::<Vec<_>>()
        .join("")
}

/// Whether an opaque string is a full HTML document rather than an object dump
pub fn looks_like_document(raw: &str) -> bool {
    let trimmed = raw.trim_start();
    if OPAQUE_MARKERS.iter().any(|m| trimmed.starts_with(m)) {
        return false;
    }
    let lower = raw.to_ascii_lowercase();
    lower.contains("<!doctype html") || lower.contains("<html")
}

/// Normalized response (or stream chunk) from an upstream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamResponse {
    shapes: Vec<ResponseShape>,
    pub usage: Option<ReportedUsage>,
    pub finish_reason: Option<String>,
}

impl UpstreamResponse {
    /// Build from any set of shapes; they are kept in priority order
    pub fn new(mut shapes: Vec<ResponseShape>) -> Self {
        shapes.sort_by_key(ResponseShape::priority);
        Self {
            shapes,
            usage: None,
            finish_reason: None,
        }
    }

    /// Response holding only direct text
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![ResponseShape::Text(text.into())])
    }

    /// Chunk carrying only usage or finish metadata
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_usage(mut self, usage: ReportedUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_finish_reason(mut self, reason: impl Into<String>) -> Self {
        self.finish_reason = Some(reason.into());
        self
    }

    pub fn shapes(&self) -> &[ResponseShape] {
        &self.shapes
    }
}

/// Extract text from a response, trying each shape in priority order
///
/// Returns an empty string when nothing usable is found; never fails.
pub fn extract_text(response: &UpstreamResponse) -> String {
    response
        .shapes
        .iter()
        .map(ResponseShape::text)
        .find(|text| !text.is_empty())
        .unwrap_or_default()
}

/// What a client can do, decided once when it is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub streaming: bool,
    pub reports_usage: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            reports_usage: false,
        }
    }
}

/// Stream of normalized chunks from an upstream
pub type ChunkStream = BoxStream<'static, Result<UpstreamResponse>>;

/// A model bound to one API key
#[async_trait]
pub trait UpstreamClient: Send + Sync + Debug {
    /// Provider name (for logging)
    fn name(&self) -> &str;

    /// Model identifier sent upstream
    fn model(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Single blocking call
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<UpstreamResponse>;

    /// Streaming call; errors before the first chunk come back as `Err`
    async fn generate_stream(&self, prompt: &str, params: &GenerationParams)
        -> Result<ChunkStream>;
}

/// Builds clients for one provider
pub trait UpstreamConnector: Send + Sync + Debug {
    fn provider(&self) -> &str;

    /// Create a client for this key; purely local, no network I/O
    fn connect(&self, api_key: &str) -> Result<Arc<dyn UpstreamClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let response = UpstreamResponse::new(vec![
            ResponseShape::Candidates(vec![Candidate {
                parts: vec![Part::text("from candidates")],
                finish_reason: None,
            }]),
            ResponseShape::Text("direct".into()),
        ]);
        assert_eq!(extract_text(&response), "direct");
    }

    #[test]
    fn test_falls_through_empty_shapes() {
        let response = UpstreamResponse::new(vec![
            ResponseShape::Text(String::new()),
            ResponseShape::Parts(vec![Part::text("<p>"), Part::default(), Part::text("hi</p>")]),
        ]);
        assert_eq!(extract_text(&response), "<p>hi</p>");
    }

    #[test]
    fn test_candidates_skip_empty_first() {
        let response = UpstreamResponse::new(vec![ResponseShape::Candidates(vec![
            Candidate::default(),
            Candidate {
                parts: vec![Part::text("second")],
                finish_reason: Some("STOP".into()),
            },
        ])]);
        assert_eq!(extract_text(&response), "second");
    }

    #[test]
    fn test_every_candidate_is_joined() {
        let response = UpstreamResponse::new(vec![ResponseShape::Candidates(vec![
            Candidate {
                parts: vec![Part::text("<html>"), Part::text("<body>")],
                finish_reason: None,
            },
            Candidate::default(),
            Candidate {
                parts: vec![Part::text("</body></html>")],
                finish_reason: Some("STOP".into()),
            },
        ])]);
        assert_eq!(extract_text(&response), "<html><body></body></html>");
    }

    #[test]
    fn test_opaque_document_accepted() {
        let response = UpstreamResponse::new(vec![ResponseShape::Opaque(
            "<!DOCTYPE html><html><body>ok</body></html>".into(),
        )]);
        assert!(extract_text(&response).starts_with("<!DOCTYPE html>"));
    }

    #[test]
    fn test_opaque_debug_dump_rejected() {
        let dump = "<genai.types.GenerateContentResponse object> <html>";
        let response = UpstreamResponse::new(vec![ResponseShape::Opaque(dump.into())]);
        assert_eq!(extract_text(&response), "");

        let response = UpstreamResponse::new(vec![ResponseShape::Opaque("just words".into())]);
        assert_eq!(extract_text(&response), "");
    }

    #[test]
    fn test_metadata_only_chunk_is_empty() {
        let chunk = UpstreamResponse::empty().with_usage(ReportedUsage {
            input_tokens: Some(3),
            output_tokens: None,
        });
        assert_eq!(extract_text(&chunk), "");
        assert!(chunk.shapes().is_empty());
    }
}
