//! Upstream Adapters
//!
//! Concrete [`UpstreamConnector`](crate::UpstreamConnector) implementations
//! for the supported providers, plus the shared SSE decoder and HTTP error
//! classification.

pub mod anthropic;
pub mod gemini;
pub mod mock;
pub mod sse;

pub use anthropic::{AnthropicConfig, AnthropicConnector};
pub use gemini::{GeminiConfig, GeminiConnector};
pub use mock::{MockFailure, MockReply, MockStep, MockUpstream};

use std::time::Duration;

use crate::types::truncate_chars;
use crate::Error;

const AUTH_MARKERS: &[&str] = &["API_KEY_INVALID", "authentication_error", "PERMISSION_DENIED"];

const OVERLOAD_MARKERS: &[&str] = &[
    "overloaded_error",
    "RESOURCE_EXHAUSTED",
    "UNAVAILABLE",
    "rate_limit_error",
];

const DEADLINE_MARKERS: &[&str] = &["DEADLINE_EXCEEDED"];

/// Longest slice of an error body carried into error messages
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Map a failed upstream HTTP response onto an [`Error`] class
pub fn classify_http_error(status: u16, body: &str) -> Error {
    let message = error_message(body).unwrap_or_else(|| {
        let snippet = truncate_chars(body.trim(), MAX_ERROR_BODY_CHARS);
        if snippet.is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, snippet)
        }
    });

    let has = |markers: &[&str]| markers.iter().any(|m| body.contains(m));

    if matches!(status, 401 | 403) || has(AUTH_MARKERS) {
        Error::authentication(message)
    } else if matches!(status, 429 | 503 | 529) || has(OVERLOAD_MARKERS) {
        Error::overloaded(message)
    } else if status == 504 || has(DEADLINE_MARKERS) {
        Error::DeadlineExceeded(Duration::ZERO)
    } else {
        Error::upstream(message)
    }
}

/// Pull `error.message` out of a JSON error body (both providers use it)
fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

/// Read the body of a non-success response and classify it
pub(crate) async fn error_from_response(response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    classify_http_error(status, &body)
}

/// Shared reqwest client for a connector
pub(crate) fn build_http_client(connect_timeout: Duration) -> crate::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))
}
