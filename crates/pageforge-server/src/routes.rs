//! HTTP routes and handlers

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderName, HeaderValue, Method, Uri},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use pageforge_core::{
    EventSink, GenerateBody, GenerationOutcome, GenerationRequest, StreamEvent, UpstreamClient,
    UsageRecord,
};
use pageforge_telemetry::{MetricsSnapshot, UsageStats};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::CorsConfig;
use crate::error::AppError;
use crate::state::{AppState, Provider};

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors);

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/api/process-gemini-stream", post(process_gemini_stream))
        .route("/api/process-stream", post(process_stream))
        .route("/api/gemini-stream-edge", post(gemini_stream_edge))
        .route("/api/process-gemini", post(process_gemini))
        .route("/api/usage-stats", get(usage_stats))
        .route("/api/sessions/:id", get(get_session))
        .fallback(fallback)
        .layer(cors)
        .with_state(state)
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let origin = if config.allowed_origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            config
                .allowed_origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(Duration::from_secs(config.max_age_secs))
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics(State(state): State<AppState>) -> String {
    state
        .metrics_handle
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}

/// Gemini, streamed as SSE
async fn process_gemini_stream(
    State(state): State<AppState>,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<Response, AppError> {
    let provider = Arc::clone(&state.gemini);
    stream_events(state, provider, body?.0)
}

/// Anthropic, streamed as SSE
async fn process_stream(
    State(state): State<AppState>,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<Response, AppError> {
    let provider = Arc::clone(&state.anthropic);
    stream_events(state, provider, body?.0)
}

fn stream_events(
    state: AppState,
    provider: Arc<Provider>,
    body: GenerateBody,
) -> Result<Response, AppError> {
    let (request, client) = state.prepare(&provider, body)?;
    let (sink, rx) = EventSink::channel(request.session_id, state.config.event_buffer);

    info!(
        session_id = %request.session_id,
        provider = provider.name(),
        "Opening event stream"
    );

    tokio::spawn(async move {
        if let Err(err) = state.generate(&provider, &request, client, sink).await {
            debug!(session_id = %request.session_id, error = %err, "Event stream closed early");
        }
    });

    let events = ReceiverStream::new(rx)
        .map(|event| Event::default().event(event.event_type()).json_data(&event));

    let headers = [
        (header::CACHE_CONTROL, "no-cache"),
        (header::CONNECTION, "keep-alive"),
        (X_ACCEL_BUFFERING, "no"),
    ];
    Ok((headers, Sse::new(events)).into_response())
}

#[derive(Debug, Serialize)]
struct EdgeResponse {
    events: Vec<StreamEvent>,
    success: bool,
}

/// Gemini, with the whole event sequence returned in one body
async fn gemini_stream_edge(
    State(state): State<AppState>,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<Json<EdgeResponse>, AppError> {
    let provider = Arc::clone(&state.gemini);
    let (request, client) = state.prepare(&provider, body?.0)?;

    let (sink, rx) = EventSink::channel(request.session_id, state.config.event_buffer);
    let (outcome, events) = tokio::join!(
        state.generate(&provider, &request, client, sink),
        ReceiverStream::new(rx).collect::<Vec<_>>()
    );

    Ok(Json(EdgeResponse {
        events,
        success: matches!(outcome?, GenerationOutcome::Completed(_)),
    }))
}

#[derive(Debug, Serialize)]
struct PageResponse {
    html: String,
    model: String,
    usage: UsageRecord,
    processing_time: f64,
    session_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
    partial: bool,
}

/// Gemini, answered with a single JSON document
async fn process_gemini(
    State(state): State<AppState>,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<Json<PageResponse>, AppError> {
    let provider = Arc::clone(&state.gemini);
    let (request, client) = state.prepare(&provider, body?.0)?;

    match run_discarding_events(&state, &provider, &request, client).await? {
        GenerationOutcome::Completed(completion) => Ok(Json(PageResponse {
            html: completion.html,
            model: completion.model,
            processing_time: completion.usage.processing_time,
            usage: completion.usage,
            session_id: request.session_id,
            warning: completion.warning,
            partial: completion.partial,
        })),
        GenerationOutcome::Failed(err) => Err(err.into()),
    }
}

async fn run_discarding_events(
    state: &AppState,
    provider: &Provider,
    request: &GenerationRequest,
    client: Arc<dyn UpstreamClient>,
) -> pageforge_core::Result<GenerationOutcome> {
    let (sink, mut rx) = EventSink::channel(request.session_id, state.config.event_buffer);
    let drain = async move { while rx.recv().await.is_some() {} };
    let (outcome, ()) = tokio::join!(state.generate(provider, request, client, sink), drain);
    outcome
}

#[derive(Debug, Serialize)]
struct UsageStatsResponse {
    #[serde(flatten)]
    usage: UsageStats,
    generation: GenerationStats,
}

#[derive(Debug, Serialize)]
struct GenerationStats {
    #[serde(flatten)]
    counters: MetricsSnapshot,
    avg_latency_us: u64,
    fallback_rate: f64,
}

impl From<MetricsSnapshot> for GenerationStats {
    fn from(counters: MetricsSnapshot) -> Self {
        Self {
            avg_latency_us: counters.avg_latency_us(),
            fallback_rate: counters.fallback_rate(),
            counters,
        }
    }
}

async fn usage_stats(State(state): State<AppState>) -> Json<UsageStatsResponse> {
    Json(UsageStatsResponse {
        usage: state.usage.stats(),
        generation: state.metrics.snapshot().into(),
    })
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    Uuid::parse_str(&id)
        .ok()
        .and_then(|session_id| state.sessions.get(&session_id))
        .map(|record| Json(record).into_response())
        .ok_or_else(|| AppError::NotFound(format!("no finished session {}", id)))
}

async fn fallback(uri: Uri) -> AppError {
    AppError::NotFound(uri.path().to_string())
}
