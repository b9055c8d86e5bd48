//! Retry/Fallback Controller
//!
//! Wraps the [`Reconciler`] with overload backoff and walks the fallback
//! cascade until one strategy yields content:
//!
//! ```text
//! stream ─▶ non_streaming ─▶ reduced_parameters ─▶ simplified_prompt ─▶ placeholder
//! ```
//!
//! The retry budget is shared by every step of a request. Authentication
//! and input errors end the run at once; everything else moves on to the
//! next step. `stream_start` is always the first event and `stream_end` the
//! last, with exactly one `message_complete` or `error` in between.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::prompt::{build_prompt, placeholder_page, simplified_prompt};
use crate::reconciler::{AttemptOutput, Reconciler, ReconcilerConfig, ReconcilerState};
use crate::retry::{RetryPolicy, RetryState};
use crate::stream::EventSink;
use crate::stream_adapter::UpstreamClient;
use crate::types::{EventPayload, GenerationRequest};
use crate::usage::UsageRecord;
use crate::{Error, Result};

/// One way of producing the document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Primary streaming call
    Stream,
    /// Same request as one blocking call
    NonStreaming,
    /// Blocking call with fewer tokens and a lower temperature
    ReducedParameters,
    /// Blocking call over a prefix of the content
    SimplifiedPrompt,
    /// Static page previewing the input, no upstream call
    Placeholder,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::NonStreaming => "non_streaming",
            Self::ReducedParameters => "reduced_parameters",
            Self::SimplifiedPrompt => "simplified_prompt",
            Self::Placeholder => "placeholder",
        }
    }

    /// `status` message sent when this step starts
    pub fn announcement(&self) -> &'static str {
        match self {
            Self::Stream => "Starting streaming generation",
            Self::NonStreaming => "Trying non-streaming fallback",
            Self::ReducedParameters => "Trying with reduced parameters",
            Self::SimplifiedPrompt => "Trying with a simplified prompt",
            Self::Placeholder => "Generating placeholder page",
        }
    }

    /// `warning` reported on `message_complete` when this step won
    pub fn warning(&self) -> Option<&'static str> {
        match self {
            Self::Stream => None,
            Self::NonStreaming => Some("Used non-streaming fallback"),
            Self::ReducedParameters => Some("Used reduced parameters fallback"),
            Self::SimplifiedPrompt => Some("Used simplified prompt fallback"),
            Self::Placeholder => Some("All generation strategies failed; returned a placeholder page"),
        }
    }
}

fn default_cascade() -> Vec<Strategy> {
    vec![
        Strategy::NonStreaming,
        Strategy::ReducedParameters,
        Strategy::SimplifiedPrompt,
        Strategy::Placeholder,
    ]
}

/// Controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub retry: RetryPolicy,

    pub reconciler: ReconcilerConfig,

    /// Fallback steps tried after the primary stream, in order
    pub cascade: Vec<Strategy>,

    /// Wall-clock budget for the whole request
    pub timeout_budget_secs: u64,

    /// No attempt gets less than this, whatever the budget says
    pub min_attempt_secs: u64,

    /// Output tokens are divided by this for the reduced-parameter step
    pub reduced_token_divisor: u32,

    /// Content prefix used by the simplified-prompt step
    pub simplified_prompt_chars: usize,

    /// Cost per million tokens
    pub rate_per_million: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            reconciler: ReconcilerConfig::default(),
            cascade: default_cascade(),
            timeout_budget_secs: 85,
            min_attempt_secs: 20,
            reduced_token_divisor: 16,
            simplified_prompt_chars: 2_000,
            rate_per_million: 0.0,
        }
    }
}

impl ControllerConfig {
    /// Time allotted to an attempt starting `elapsed` into the request
    pub fn allotment(&self, elapsed: Duration) -> Duration {
        let budget = Duration::from_secs(self.timeout_budget_secs);
        let floor = Duration::from_secs(self.min_attempt_secs);
        budget.saturating_sub(elapsed).max(floor)
    }
}

/// A finished generation
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub html: String,
    pub usage: UsageRecord,
    pub model: String,
    pub strategy: Strategy,
    pub partial: bool,
    pub warning: Option<String>,
}

/// How a run ended (cancellation is reported as `Err` instead)
#[derive(Debug)]
pub enum GenerationOutcome {
    Completed(Completion),
    Failed(Error),
}

impl GenerationOutcome {
    pub fn completion(&self) -> Option<&Completion> {
        match self {
            Self::Completed(completion) => Some(completion),
            Self::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Completed(_) => None,
            Self::Failed(err) => Some(err),
        }
    }
}

/// Runs one request through retries and the fallback cascade
#[derive(Debug, Clone, Default)]
pub struct GenerationController {
    reconciler: Reconciler,
    config: ControllerConfig,
}

impl GenerationController {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            reconciler: Reconciler::new(config.reconciler.clone()),
            config,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Steps this client will go through, in order
    pub fn plan(&self, client: &dyn UpstreamClient) -> Vec<Strategy> {
        let mut steps = Vec::with_capacity(self.config.cascade.len() + 1);
        if client.capabilities().streaming {
            steps.push(Strategy::Stream);
        }
        for step in &self.config.cascade {
            if !steps.contains(step) {
                steps.push(*step);
            }
        }
        steps
    }

    /// Run `request` to completion, emitting every event into `sink`
    ///
    /// Returns `Err` only when the client went away mid-run.
    pub async fn run(
        &self,
        request: &GenerationRequest,
        client: Arc<dyn UpstreamClient>,
        sink: &EventSink,
    ) -> Result<GenerationOutcome> {
        let started = Instant::now();
        metrics::counter!("pageforge_requests_total", "provider" => client.name().to_string())
            .increment(1);

        info!(
            session_id = %request.session_id,
            provider = client.name(),
            model = client.model(),
            api_key = %request.redacted_key(),
            content_chars = request.content.chars().count(),
            "Starting generation"
        );

        sink.emit(EventPayload::StreamStart {
            message: "Stream starting".to_string(),
        })
        .await?;

        let outcome = match self.drive(request, client.as_ref(), sink, started).await {
            Ok(completion) => GenerationOutcome::Completed(completion),
            Err(Error::Cancelled) => {
                info!(session_id = %request.session_id, "Generation cancelled by client");
                return Err(Error::Cancelled);
            }
            Err(err) => {
                error!(
                    session_id = %request.session_id,
                    kind = err.kind(),
                    error = %err,
                    "Generation failed"
                );
                metrics::counter!("pageforge_errors_total", "kind" => err.kind()).increment(1);
                let (message, details) = client_error(&err);
                sink.emit(EventPayload::Error {
                    error: message,
                    details,
                })
                .await?;
                GenerationOutcome::Failed(err)
            }
        };

        metrics::histogram!("pageforge_generation_latency_seconds")
            .record(started.elapsed().as_secs_f64());

        sink.emit(EventPayload::StreamEnd).await?;
        Ok(outcome)
    }

    async fn drive(
        &self,
        request: &GenerationRequest,
        client: &dyn UpstreamClient,
        sink: &EventSink,
        started: Instant,
    ) -> Result<Completion> {
        let mut state = ReconcilerState::Init;
        let mut retry = RetryState::new(self.config.retry.max_retries);
        let prompt = build_prompt(request);
        let mut last_error = None;

        state.advance(ReconcilerState::Streaming, request.session_id);

        for (index, strategy) in self.plan(client).into_iter().enumerate() {
            // a client that cannot stream starts at a blocking step, which is then primary
            let primary = index == 0 && strategy != Strategy::Placeholder;
            if !primary {
                metrics::counter!("pageforge_fallbacks_total", "strategy" => strategy.as_str())
                    .increment(1);
            }
            sink.emit(EventPayload::status(strategy.announcement())).await?;

            let step_prompt = match strategy {
                Strategy::SimplifiedPrompt => {
                    simplified_prompt(request, self.config.simplified_prompt_chars)
                }
                _ => prompt.clone(),
            };

            match self
                .attempt(strategy, request, client, &step_prompt, sink, started, &mut retry)
                .await
            {
                Ok(output) => {
                    let next = if output.partial {
                        ReconcilerState::PartialComplete
                    } else {
                        ReconcilerState::Complete
                    };
                    state.advance(next, request.session_id);

                    let warning = if primary {
                        None
                    } else {
                        strategy.warning().map(str::to_string)
                    };
                    let usage = self
                        .reconciler
                        .complete(
                            sink,
                            &step_prompt,
                            &output,
                            warning.clone(),
                            started.elapsed(),
                            self.config.rate_per_million,
                        )
                        .await?;

                    info!(
                        session_id = %request.session_id,
                        strategy = strategy.as_str(),
                        partial = output.partial,
                        retries = retry.attempt,
                        output_tokens = usage.output_tokens,
                        "Generation complete"
                    );

                    return Ok(Completion {
                        html: output.text,
                        usage,
                        model: client.model().to_string(),
                        strategy,
                        partial: output.partial,
                        warning,
                    });
                }
                Err(err) if err.is_fatal() => {
                    state.advance(ReconcilerState::Failed, request.session_id);
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        session_id = %request.session_id,
                        strategy = strategy.as_str(),
                        kind = err.kind(),
                        error = %err,
                        "Strategy produced no content, moving on"
                    );
                    last_error = Some(err);
                }
            }
        }

        state.advance(ReconcilerState::Failed, request.session_id);
        let last = last_error.unwrap_or_else(|| Error::config("no generation strategies configured"));
        Err(Error::Exhausted(Box::new(last)))
    }

    /// One strategy, retried on overload while the shared budget lasts
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        strategy: Strategy,
        request: &GenerationRequest,
        client: &dyn UpstreamClient,
        prompt: &str,
        sink: &EventSink,
        started: Instant,
        retry: &mut RetryState,
    ) -> Result<AttemptOutput> {
        loop {
            let allotment = self.config.allotment(started.elapsed());
            debug!(
                session_id = %request.session_id,
                strategy = strategy.as_str(),
                allotment_secs = allotment.as_secs_f64(),
                "Starting attempt"
            );

            let result = match strategy {
                Strategy::Stream => {
                    self.reconciler
                        .stream(
                            client,
                            prompt,
                            &request.params,
                            sink,
                            allotment,
                            &mut retry.partial_content,
                        )
                        .await
                }
                Strategy::NonStreaming | Strategy::SimplifiedPrompt => {
                    self.reconciler
                        .single_shot(client, prompt, &request.params, sink, allotment)
                        .await
                }
                Strategy::ReducedParameters => {
                    let params = request.params.reduced(self.config.reduced_token_divisor);
                    self.reconciler
                        .single_shot(client, prompt, &params, sink, allotment)
                        .await
                }
                Strategy::Placeholder => {
                    let html = placeholder_page(&request.content);
                    sink.emit(EventPayload::Content {
                        chunk: html.clone(),
                    })
                    .await?;
                    Ok(AttemptOutput {
                        text: html,
                        usage: None,
                        partial: false,
                    })
                }
            };

            match result {
                Err(err) if err.is_transient() && retry.can_retry() => {
                    let index = retry.record_retry();
                    let delay = self.config.retry.jittered_delay(index);
                    warn!(
                        session_id = %request.session_id,
                        strategy = strategy.as_str(),
                        retry = index + 1,
                        max_retries = retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Upstream overloaded, backing off"
                    );
                    metrics::counter!("pageforge_upstream_retries_total").increment(1);

                    sink.emit(EventPayload::Info {
                        message: format!(
                            "Service busy, retrying ({}/{})",
                            index + 1,
                            retry.max_retries
                        ),
                        attempt: index + 1,
                        retry_in_seconds: delay.as_secs_f64(),
                    })
                    .await?;

                    tokio::select! {
                        _ = sink.closed() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return other,
            }
        }
    }
}

/// Safe `(error, details)` pair for the terminal error event
pub fn client_error(err: &Error) -> (String, Option<String>) {
    match err {
        Error::Exhausted(inner) => (
            "All generation strategies failed".to_string(),
            Some(inner.to_string()),
        ),
        Error::Authentication(msg) => ("Authentication failed".to_string(), Some(msg.clone())),
        Error::InvalidRequest(msg) => ("Invalid request".to_string(), Some(msg.clone())),
        Error::DeadlineExceeded(_) => ("Generation timed out".to_string(), Some(err.to_string())),
        other => ("Generation failed".to_string(), Some(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allotment_has_floor() {
        let config = ControllerConfig::default();
        assert_eq!(config.allotment(Duration::ZERO), Duration::from_secs(85));
        assert_eq!(config.allotment(Duration::from_secs(50)), Duration::from_secs(35));
        assert_eq!(config.allotment(Duration::from_secs(80)), Duration::from_secs(20));
        assert_eq!(config.allotment(Duration::from_secs(500)), Duration::from_secs(20));
    }

    #[test]
    fn test_strategy_serde_names() {
        let cascade: Vec<Strategy> =
            serde_json::from_str(r#"["non_streaming","placeholder"]"#).unwrap();
        assert_eq!(cascade, vec![Strategy::NonStreaming, Strategy::Placeholder]);
        assert!(Strategy::Stream.warning().is_none());
    }

    #[test]
    fn test_client_error_messages() {
        let err = Error::Exhausted(Box::new(Error::upstream("boom")));
        let (message, details) = client_error(&err);
        assert_eq!(message, "All generation strategies failed");
        assert!(details.unwrap().contains("boom"));
    }
}
