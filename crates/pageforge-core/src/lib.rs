//! PageForge Core
//!
//! Streaming-response reconciliation and retry layer for turning user
//! content into HTML pages with a generative-AI upstream.
//!
//! This crate provides:
//! - Request, event and usage types plus error classification
//! - The upstream adapter: normalized response shapes and text extraction
//! - Gemini, Anthropic and scripted mock upstream clients
//! - The stream reconciler (batching, keepalive, partial-content handling)
//! - The retry/fallback controller (overload backoff and degraded strategies)

pub mod adapters;
pub mod cascade;
pub mod error;
pub mod prompt;
pub mod reconciler;
pub mod retry;
pub mod stream;
pub mod stream_adapter;
pub mod types;
pub mod usage;

pub use cascade::{
    client_error, Completion, ControllerConfig, GenerationController, GenerationOutcome, Strategy,
};
pub use error::{Error, Result};
pub use reconciler::{Reconciler, ReconcilerConfig, ReconcilerState};
pub use retry::{RetryPolicy, RetryState};
pub use stream::{EventSink, FragmentBatcher};
pub use stream_adapter::{
    extract_text, Capabilities, ChunkStream, ResponseShape, UpstreamClient, UpstreamConnector,
    UpstreamResponse,
};
pub use types::{
    EventPayload, GenerateBody, GenerationParams, GenerationRequest, RequestDefaults, StreamEvent,
};
pub use usage::{ReportedUsage, UsageRecord};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cascade::{ControllerConfig, GenerationController, GenerationOutcome, Strategy};
    pub use crate::error::{Error, Result};
    pub use crate::stream::EventSink;
    pub use crate::stream_adapter::{UpstreamClient, UpstreamConnector, UpstreamResponse};
    pub use crate::types::{EventPayload, GenerationRequest, StreamEvent};
}
