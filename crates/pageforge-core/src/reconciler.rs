//! Stream Reconciler
//!
//! Drives a single generation attempt against an upstream client and turns
//! what comes back into the outward event sequence: batched
//! `content_block_delta` fragments for streams, a single `content` event for
//! blocking calls, `keepalive` while the upstream is quiet, and finally
//! `message_complete` with the assembled document and its usage.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::stream::{EventSink, FragmentBatcher};
use crate::stream_adapter::{extract_text, UpstreamClient};
use crate::types::{EventPayload, GenerationParams};
use crate::usage::{ReportedUsage, UsageRecord};
use crate::{Error, Result};

/// Status sent once the upstream has answered
pub const MODEL_READY: &str = "Model loaded, starting generation";

/// Batching and keepalive settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Pending fragments that force a flush
    pub batch_chunks: usize,

    /// Milliseconds after the last flush that force the next one
    pub batch_interval_ms: u64,

    /// Milliseconds without a flush before a keepalive goes out
    pub keepalive_interval_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            batch_chunks: 3,
            batch_interval_ms: 200,
            keepalive_interval_ms: 5_000,
        }
    }
}

impl ReconcilerConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms.max(1))
    }
}

/// Lifecycle of one request's generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Init,
    Streaming,
    Complete,
    PartialComplete,
    /// Only after every strategy has been tried
    Failed,
}

impl ReconcilerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Streaming => "streaming",
            Self::Complete => "complete",
            Self::PartialComplete => "partial_complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::PartialComplete | Self::Failed)
    }

    /// Move to `next`, logging the transition
    pub fn advance(&mut self, next: ReconcilerState, session_id: uuid::Uuid) {
        if *self != next {
            debug!(
                session_id = %session_id,
                from = self.as_str(),
                to = next.as_str(),
                "Reconciler state transition"
            );
            *self = next;
        }
    }
}

/// Text and metadata from one successful attempt
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptOutput {
    pub text: String,
    pub usage: Option<ReportedUsage>,
    /// The upstream failed after some content arrived
    pub partial: bool,
}

/// Drives upstream calls and emits their events
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Consume a streaming call within `allotment`
    ///
    /// Every fragment is appended to `accumulator` as it arrives, so text
    /// received before a failure survives it. A failure after some text
    /// returns that text as a partial result; a failure before any text
    /// returns the error.
    pub async fn stream(
        &self,
        client: &dyn UpstreamClient,
        prompt: &str,
        params: &GenerationParams,
        sink: &EventSink,
        allotment: Duration,
        accumulator: &mut String,
    ) -> Result<AttemptOutput> {
        let deadline = Instant::now() + allotment;
        let keepalive = self.config.keepalive_interval();

        let mut chunks = self
            .guarded(sink, deadline, allotment, client.generate_stream(prompt, params))
            .await?;

        sink.emit(EventPayload::status(MODEL_READY)).await?;

        let start_len = accumulator.len();
        let mut batcher = FragmentBatcher::new(self.config.batch_chunks, self.config.batch_interval());
        let mut keepalive_at = Instant::now() + keepalive;
        let mut usage = ReportedUsage::default();
        let mut finish_reason = None;
        let mut chunk_count = 0usize;
        let mut failure: Option<Error> = None;

        loop {
            let flush_at = batcher.flush_deadline();

            tokio::select! {
                biased;

                _ = sink.closed() => {
                    debug!(session_id = %sink.session_id(), "Client disconnected, dropping upstream stream");
                    return Err(Error::Cancelled);
                }

                _ = sleep_until(deadline) => {
                    failure = Some(Error::DeadlineExceeded(allotment));
                    break;
                }

                _ = sleep_until(flush_at.unwrap_or(deadline)), if flush_at.is_some() => {
                    if let Some(batch) = batcher.flush() {
                        sink.emit(EventPayload::delta(batch)).await?;
                        keepalive_at = Instant::now() + keepalive;
                    }
                }

                _ = sleep_until(keepalive_at) => {
                    sink.emit(EventPayload::Keepalive).await?;
                    keepalive_at = Instant::now() + keepalive;
                }

                item = chunks.next() => match item {
                    None => break,
                    Some(Ok(chunk)) => {
                        chunk_count += 1;
                        if let Some(reported) = chunk.usage {
                            usage.merge(reported);
                        }
                        if chunk.finish_reason.is_some() {
                            finish_reason = chunk.finish_reason.clone();
                        }
                        let text = extract_text(&chunk);
                        if !text.is_empty() {
                            accumulator.push_str(&text);
                            if let Some(batch) = batcher.push(text) {
                                sink.emit(EventPayload::delta(batch)).await?;
                                keepalive_at = Instant::now() + keepalive;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        failure = Some(err);
                        break;
                    }
                },
            }
        }

        drop(chunks);

        if let Some(batch) = batcher.flush() {
            sink.emit(EventPayload::delta(batch)).await?;
        }

        let text = accumulator[start_len..].to_string();
        let usage = (!usage.is_empty()).then_some(usage);

        match failure {
            None if text.is_empty() => Err(Error::Extraction(format!(
                "stream ended after {} chunks without text (finish reason: {})",
                chunk_count,
                finish_reason.as_deref().unwrap_or("none")
            ))),
            None => {
                info!(
                    session_id = %sink.session_id(),
                    chunks = chunk_count,
                    chars = text.len(),
                    "Stream completed"
                );
                Ok(AttemptOutput {
                    text,
                    usage,
                    partial: false,
                })
            }
            Some(err) if text.is_empty() => Err(err),
            Some(err) => {
                warn!(
                    session_id = %sink.session_id(),
                    error = %err,
                    chars = text.len(),
                    "Stream failed after partial content, keeping it"
                );
                Ok(AttemptOutput {
                    text,
                    usage,
                    partial: true,
                })
            }
        }
    }

    /// One blocking call within `allotment`, emitting a single `content` event
    pub async fn single_shot(
        &self,
        client: &dyn UpstreamClient,
        prompt: &str,
        params: &GenerationParams,
        sink: &EventSink,
        allotment: Duration,
    ) -> Result<AttemptOutput> {
        let deadline = Instant::now() + allotment;
        let response = self
            .guarded(sink, deadline, allotment, client.generate(prompt, params))
            .await?;

        sink.emit(EventPayload::status(MODEL_READY)).await?;

        let text = extract_text(&response);
        if text.is_empty() {
            return Err(Error::Extraction(format!(
                "no text in response (finish reason: {})",
                response.finish_reason.as_deref().unwrap_or("none")
            )));
        }

        sink.emit(EventPayload::Content {
            chunk: text.clone(),
        })
        .await?;

        Ok(AttemptOutput {
            text,
            usage: response.usage,
            partial: false,
        })
    }

    /// Emit `message_complete` for a finished attempt and return its usage
    pub async fn complete(
        &self,
        sink: &EventSink,
        prompt: &str,
        output: &AttemptOutput,
        warning: Option<String>,
        elapsed: Duration,
        rate_per_million: f64,
    ) -> Result<UsageRecord> {
        let usage = UsageRecord::compute(prompt, &output.text, output.usage, elapsed, rate_per_million);
        let message = if output.partial {
            "Generation partially complete"
        } else if warning.is_some() {
            "Generation complete (fallback)"
        } else {
            "Generation complete"
        };
        sink.emit(EventPayload::MessageComplete {
            message: message.to_string(),
            html: output.text.clone(),
            usage,
            partial: output.partial,
            warning,
        })
        .await?;
        Ok(usage)
    }

    /// Await `fut` under the deadline, sending keepalives while it is pending
    async fn guarded<T, F>(
        &self,
        sink: &EventSink,
        deadline: Instant,
        allotment: Duration,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let keepalive = self.config.keepalive_interval();
        let mut keepalive_at = Instant::now() + keepalive;
        tokio::pin!(fut);

        loop {
            tokio::select! {
                biased;

                _ = sink.closed() => return Err(Error::Cancelled),

                _ = sleep_until(deadline) => return Err(Error::DeadlineExceeded(allotment)),

                result = &mut fut => {
                    return result.map_err(|err| match err {
                        // reqwest timeouts carry no duration of their own
                        Error::DeadlineExceeded(d) if d.is_zero() => Error::DeadlineExceeded(allotment),
                        other => other,
                    });
                }

                _ = sleep_until(keepalive_at) => {
                    sink.emit(EventPayload::Keepalive).await?;
                    keepalive_at = Instant::now() + keepalive;
                }
            }
        }
    }
}
