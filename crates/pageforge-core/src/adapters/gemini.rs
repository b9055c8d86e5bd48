//! Google Gemini adapter
//!
//! Blocking calls go to `:generateContent`, streams to
//! `:streamGenerateContent?alt=sse`:
//! ```text
//! data: {"candidates":[{"content":{"parts":[{"text":"<!DOCTYPE"}],"role":"model"}}],"usageMetadata":{...}}
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::sse::{decode_stream, FrameOutcome, SseFrame};
use super::{build_http_client, error_from_response};
use crate::stream_adapter::{
    Candidate, Capabilities, ChunkStream, Part, ResponseShape, UpstreamClient,
    UpstreamConnector, UpstreamResponse,
};
use crate::types::GenerationParams;
use crate::usage::ReportedUsage;
use crate::{Error, Result};

/// Gemini connector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub base_url: String,
    pub model: String,
    pub top_p: f32,
    pub top_k: u32,
    /// Use the streaming endpoint at all
    pub streaming: bool,
    pub connect_timeout_secs: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            model: "gemini-2.5-pro".to_string(),
            top_p: 0.95,
            top_k: 64,
            streaming: true,
            connect_timeout_secs: 10,
        }
    }
}

/// Creates [`GeminiClient`]s sharing one HTTP connection pool
#[derive(Debug, Clone)]
pub struct GeminiConnector {
    http: reqwest::Client,
    config: Arc<GeminiConfig>,
}

impl GeminiConnector {
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let http = build_http_client(Duration::from_secs(config.connect_timeout_secs))?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }
}

impl UpstreamConnector for GeminiConnector {
    fn provider(&self) -> &str {
        "gemini"
    }

    fn connect(&self, api_key: &str) -> Result<Arc<dyn UpstreamClient>> {
        if api_key.trim().is_empty() {
            return Err(Error::authentication("missing Gemini API key"));
        }
        Ok(Arc::new(GeminiClient {
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

/// Gemini model bound to one API key
pub struct GeminiClient {
    http: reqwest::Client,
    config: Arc<GeminiConfig>,
    api_key: String,
    capabilities: Capabilities,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("model", &self.config.model)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl GeminiClient {
    fn url(&self, method: &str) -> String {
        format!(
            "{}/v1beta/models/{}:{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.model,
            method
        )
    }

    fn body<'a>(&self, prompt: &'a str, params: &GenerationParams) -> GenerateContentRequest<'a> {
        GenerateContentRequest {
            contents: vec![RequestContent {
                role: "user",
                parts: vec![RequestPart { text: prompt }],
            }],
            generation_config: GenerationConfig {
                max_output_tokens: params.max_output_tokens,
                temperature: params.temperature,
                top_p: params.top_p.unwrap_or(self.config.top_p),
                top_k: params.top_k.unwrap_or(self.config.top_k),
            },
        }
    }

    async fn send(
        &self,
        method: &str,
        query: &[(&str, &str)],
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(self.url(method))
            .query(query)
            .query(&[("key", self.api_key.as_str())])
            .json(&self.body(prompt, params))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl UpstreamClient for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<UpstreamResponse> {
        debug!(model = %self.config.model, "Gemini generateContent");
        let response = self.send("generateContent", &[], prompt, params).await?;
        let parsed: GenerateContentResponse = response.json().await?;
        Ok(parsed.into())
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ChunkStream> {
        debug!(model = %self.config.model, "Gemini streamGenerateContent");
        let response = self
            .send("streamGenerateContent", &[("alt", "sse")], prompt, params)
            .await?;
        Ok(decode_stream(response, parse_frame))
    }
}

fn parse_frame(frame: SseFrame) -> FrameOutcome {
    if frame.data.contains("\"error\"") {
        if let Ok(err) = serde_json::from_str::<StreamError>(&frame.data) {
            return FrameOutcome::Fail(super::classify_http_error(
                err.error.code.unwrap_or(500),
                &frame.data,
            ));
        }
    }
    match serde_json::from_str::<GenerateContentResponse>(&frame.data) {
        Ok(parsed) => FrameOutcome::Chunk(parsed.into()),
        Err(e) => FrameOutcome::Fail(Error::upstream(format!(
            "failed to parse Gemini chunk: {}",
            e
        ))),
    }
}

// =============================================================================
// Gemini Wire Structures
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<RequestContent<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseCandidate {
    content: Option<ResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    error: StreamErrorBody,
}

#[derive(Debug, Deserialize)]
struct StreamErrorBody {
    code: Option<u16>,
}

impl From<GenerateContentResponse> for UpstreamResponse {
    fn from(raw: GenerateContentResponse) -> Self {
        let finish_reason = raw
            .candidates
            .iter()
            .find_map(|c| c.finish_reason.clone());

        let candidates = raw
            .candidates
            .into_iter()
            .map(|c| Candidate {
                parts: c.content.map(|content| content.parts).unwrap_or_default(),
                finish_reason: c.finish_reason,
            })
            .collect::<Vec<_>>();

        let shapes = if candidates.is_empty() {
            Vec::new()
        } else {
            vec![ResponseShape::Candidates(candidates)]
        };

        let mut response = UpstreamResponse::new(shapes);
        if let Some(usage) = raw.usage_metadata {
            response = response.with_usage(ReportedUsage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
            });
        }
        if let Some(reason) = finish_reason {
            response = response.with_finish_reason(reason);
        }
        response
    }
}
