//! Application state shared across all requests

use metrics_exporter_prometheus::PrometheusHandle;
use pageforge_core::adapters::{AnthropicConnector, GeminiConnector, MockUpstream};
use pageforge_core::{
    EventSink, GenerateBody, GenerationController, GenerationOutcome, GenerationRequest, Result,
    UpstreamClient, UpstreamConnector,
};
use pageforge_telemetry::{MetricsCollector, UsageEntry, UsageService};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::session::{SessionRecord, SessionStore};

/// One upstream provider and the controller that drives it
pub struct Provider {
    connector: Arc<dyn UpstreamConnector>,
    controller: GenerationController,
}

impl Provider {
    pub fn new(connector: Arc<dyn UpstreamConnector>, controller: GenerationController) -> Self {
        Self {
            connector,
            controller,
        }
    }

    pub fn name(&self) -> &str {
        self.connector.provider()
    }

    pub fn controller(&self) -> &GenerationController {
        &self.controller
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name())
            .field("controller", &self.controller)
            .finish()
    }
}

/// Application state shared across all requests
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration
    pub config: Arc<ServerConfig>,

    pub gemini: Arc<Provider>,

    pub anthropic: Arc<Provider>,

    /// Append-only usage accounting
    pub usage: Arc<UsageService>,

    /// Outcome counters
    pub metrics: MetricsCollector,

    /// Finished sessions for reconnecting clients
    pub sessions: SessionStore,

    /// Prometheus handle for rendering `/metrics`
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    /// Initialize application state from configuration
    pub fn new(config: ServerConfig, metrics_handle: Option<PrometheusHandle>) -> Result<Self> {
        let (gemini, anthropic): (Arc<dyn UpstreamConnector>, Arc<dyn UpstreamConnector>) =
            if config.providers.mock {
                info!("Mock upstream enabled, no requests will leave this process");
                let mock = MockUpstream::new();
                (Arc::new(mock.clone()), Arc::new(mock))
            } else {
                (
                    Arc::new(GeminiConnector::new(config.providers.gemini.clone())?),
                    Arc::new(AnthropicConnector::new(config.providers.anthropic.clone())?),
                )
            };

        Self::with_connectors(config, gemini, anthropic, metrics_handle)
    }

    /// Build state around the given connectors
    pub fn with_connectors(
        config: ServerConfig,
        gemini: Arc<dyn UpstreamConnector>,
        anthropic: Arc<dyn UpstreamConnector>,
        metrics_handle: Option<PrometheusHandle>,
    ) -> Result<Self> {
        let usage = UsageService::new(config.usage.clone())?;

        let gemini = Provider::new(gemini, controller(&config, config.providers.rates.gemini));
        let anthropic = Provider::new(
            anthropic,
            controller(&config, config.providers.rates.anthropic),
        );

        info!(
            gemini = gemini.name(),
            anthropic = anthropic.name(),
            cascade = ?config.generation.cascade,
            timeout_budget_secs = config.generation.timeout_budget_secs,
            max_content_chars = config.limits.max_content_chars,
            "Application state initialized"
        );

        Ok(Self {
            sessions: SessionStore::new(&config.sessions),
            config: Arc::new(config),
            gemini: Arc::new(gemini),
            anthropic: Arc::new(anthropic),
            usage: Arc::new(usage),
            metrics: MetricsCollector::new(),
            metrics_handle,
        })
    }

    /// Validate the body, then create an upstream client for its key
    ///
    /// Validation runs first, so an invalid body never reaches a connector.
    pub fn prepare(
        &self,
        provider: &Provider,
        body: GenerateBody,
    ) -> Result<(GenerationRequest, Arc<dyn UpstreamClient>)> {
        let request = GenerationRequest::from_body(body, &self.config.limits)?;
        let client = provider.connector.connect(&request.api_key)?;
        debug!(
            session_id = %request.session_id,
            provider = provider.name(),
            model = client.model(),
            "Upstream client ready"
        );
        Ok((request, client))
    }

    /// Run a prepared request and record how it ended
    ///
    /// The sink is dropped on return, which ends the client's event stream
    /// after the session and usage have been recorded.
    pub async fn generate(
        &self,
        provider: &Provider,
        request: &GenerationRequest,
        client: Arc<dyn UpstreamClient>,
        sink: EventSink,
    ) -> Result<GenerationOutcome> {
        let started = Instant::now();
        self.metrics.record_request();

        let result = provider.controller.run(request, client, &sink).await;

        match &result {
            Ok(GenerationOutcome::Completed(completion)) => {
                self.metrics.record_completion(completion, started.elapsed());
                self.usage.record(UsageEntry::from_completion(
                    request.session_id,
                    provider.name(),
                    completion,
                ));
                self.sessions.insert(SessionRecord::completed(
                    request.session_id,
                    provider.name(),
                    completion,
                ));
            }
            Ok(GenerationOutcome::Failed(err)) => {
                self.metrics.record_failure(started.elapsed());
                self.sessions.insert(SessionRecord::failed(
                    request.session_id,
                    provider.name(),
                    err,
                ));
            }
            Err(_) => self.metrics.record_cancelled(),
        }

        drop(sink);
        result
    }
}

fn controller(config: &ServerConfig, rate_per_million: f64) -> GenerationController {
    let mut generation = config.generation.clone();
    generation.rate_per_million = rate_per_million;
    GenerationController::new(generation)
}
