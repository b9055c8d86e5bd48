//! Scripted in-process upstream
//!
//! Replies are consumed in order, one per `generate`/`generate_stream` call.
//! When the script runs dry the fallback reply is used, and without one the
//! mock renders a small demo page echoing the prompt, which is what the
//! offline `mock` provider serves.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::prompt::escape_html;
use crate::stream_adapter::{
    Capabilities, ChunkStream, UpstreamClient, UpstreamConnector, UpstreamResponse,
};
use crate::types::{truncate_chars, GenerationParams};
use crate::usage::ReportedUsage;
use crate::{Error, Result};

/// Failure classes a script can inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Overloaded,
    Authentication,
    Upstream,
    Deadline,
}

impl MockFailure {
    fn to_error(self) -> Error {
        match self {
            Self::Overloaded => Error::overloaded("mock upstream overloaded"),
            Self::Authentication => Error::authentication("mock upstream rejected the key"),
            Self::Upstream => Error::upstream("mock upstream failure"),
            Self::Deadline => Error::DeadlineExceeded(Duration::ZERO),
        }
    }
}

/// One step of a scripted stream
#[derive(Debug, Clone)]
pub enum MockStep {
    Text(String),
    Delay(Duration),
    Usage(ReportedUsage),
    Fail(MockFailure),
}

/// Scripted reply to a single call
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Streamed as-is; a blocking call concatenates the text
    Stream(Vec<MockStep>),
    Complete(UpstreamResponse),
    /// Fails before producing anything
    Fail(MockFailure),
}

impl MockReply {
    /// Stream of the given fragments with no delays
    pub fn chunks<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Stream(
            fragments
                .into_iter()
                .map(|f| MockStep::Text(f.into()))
                .collect(),
        )
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Complete(UpstreamResponse::text(text))
    }
}

/// A call the mock received
#[derive(Debug, Clone)]
pub struct MockCall {
    pub streaming: bool,
    pub prompt: String,
    pub params: GenerationParams,
}

#[derive(Debug)]
struct MockInner {
    script: Mutex<VecDeque<MockReply>>,
    fallback: Mutex<Option<MockReply>>,
    calls: Mutex<Vec<MockCall>>,
    connects: AtomicUsize,
    capabilities: Capabilities,
}

/// Scripted upstream, acting as both connector and client
#[derive(Debug, Clone)]
pub struct MockUpstream {
    inner: Arc<MockInner>,
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::default())
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            inner: Arc::new(MockInner {
                script: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                capabilities,
            }),
        }
    }

    /// Queue a reply for the next unscripted call
    pub fn push(&self, reply: MockReply) -> &Self {
        self.inner.script.lock().push_back(reply);
        self
    }

    /// Reply used once the script is exhausted
    pub fn set_fallback(&self, reply: MockReply) {
        *self.inner.fallback.lock() = Some(reply);
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.inner.calls.lock().clone()
    }

    fn next_reply(&self, streaming: bool, prompt: &str, params: &GenerationParams) -> MockReply {
        self.inner.calls.lock().push(MockCall {
            streaming,
            prompt: prompt.to_string(),
            params: *params,
        });

        if let Some(reply) = self.inner.script.lock().pop_front() {
            return reply;
        }
        if let Some(reply) = self.inner.fallback.lock().clone() {
            return reply;
        }
        demo_page(prompt)
    }
}

/// Offline page echoing the start of the prompt
fn demo_page(prompt: &str) -> MockReply {
    let preview = escape_html(truncate_chars(prompt, 400));
    MockReply::chunks([
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head><meta charset=\"utf-8\">".to_string(),
        "<title>PageForge demo</title></head>\n<body>\n<h1>PageForge demo</h1>\n".to_string(),
        format!("<pre>{}</pre>\n</body>\n</html>\n", preview),
    ])
}

impl UpstreamConnector for MockUpstream {
    fn provider(&self) -> &str {
        "mock"
    }

    fn connect(&self, api_key: &str) -> Result<Arc<dyn UpstreamClient>> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        if api_key.trim().is_empty() {
            return Err(Error::authentication("missing API key"));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl UpstreamClient for MockUpstream {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<UpstreamResponse> {
        match self.next_reply(false, prompt, params) {
            MockReply::Complete(response) => Ok(response),
            MockReply::Fail(failure) => Err(failure.to_error()),
            MockReply::Stream(steps) => {
                let mut text = String::new();
                let mut usage = ReportedUsage::default();
                for step in steps {
                    match step {
                        MockStep::Text(fragment) => text.push_str(&fragment),
                        MockStep::Delay(delay) => tokio::time::sleep(delay).await,
                        MockStep::Usage(reported) => usage.merge(reported),
                        MockStep::Fail(failure) => return Err(failure.to_error()),
                    }
                }
                let response = UpstreamResponse::text(text);
                Ok(if usage.is_empty() {
                    response
                } else {
                    response.with_usage(usage)
                })
            }
        }
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ChunkStream> {
        let steps = match self.next_reply(true, prompt, params) {
            MockReply::Fail(failure) => return Err(failure.to_error()),
            MockReply::Complete(response) => {
                return Ok(stream::iter(vec![Ok(response)]).boxed());
            }
            MockReply::Stream(steps) => steps,
        };

        let chunks = stream::unfold(steps.into_iter(), |mut steps| async move {
            loop {
                match steps.next()? {
                    MockStep::Delay(delay) => tokio::time::sleep(delay).await,
                    MockStep::Text(text) => {
                        return Some((Ok(UpstreamResponse::text(text)), steps))
                    }
                    MockStep::Usage(usage) => {
                        return Some((Ok(UpstreamResponse::empty().with_usage(usage)), steps))
                    }
                    MockStep::Fail(failure) => {
                        // nothing may follow a failure
                        return Some((Err(failure.to_error()), Vec::new().into_iter()));
                    }
                }
            }
        });
        Ok(chunks.boxed())
    }
}
