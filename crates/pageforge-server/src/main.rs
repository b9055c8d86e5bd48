//! PageForge Server
//!
//! Turns user-supplied content into HTML pages with Gemini or Anthropic,
//! streaming progress to the browser over SSE.

use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use pageforge_server::{create_router, AppState, ConfigOverrides, ServerConfig};
use std::net::SocketAddr;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "pageforge-server")]
#[command(about = "PageForge HTML generation server", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[command(flatten)]
    overrides: ConfigOverrides,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    info!("Starting PageForge server");

    let config = ServerConfig::load(&cli.config, &cli.overrides)?;
    info!("Configuration loaded successfully");
    info!("Gemini model: {}", config.providers.gemini.model);
    info!("Anthropic model: {}", config.providers.anthropic.model);
    info!("Max content chars: {}", config.limits.max_content_chars);
    info!("Timeout budget: {}s", config.generation.timeout_budget_secs);
    info!("Usage log: {:?}", config.usage.path);

    let metrics_handle = init_metrics()?;

    let addr: SocketAddr = format!("{}:{}", config.listen, config.port).parse()?;
    let sweep_interval = config.sessions.sweep_interval();

    let state = AppState::new(config, Some(metrics_handle))?;

    let background = CancellationToken::new();
    let sweeper = state.sessions.spawn_sweeper(sweep_interval, background.clone());
    let usage = state.usage.clone();

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("PageForge listening on http://{}", addr);

    let shutdown = async {
        shutdown_signal().await;
        warn!("Shutdown signal received, stopping server...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    background.cancel();
    let _ = sweeper.await;
    usage.flush().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Listen for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new(
            "pageforge_core=debug,pageforge_server=debug,pageforge_telemetry=debug,tower_http=debug",
        )
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("pageforge_core=info,pageforge_server=info,pageforge_telemetry=info")
        })
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize metrics exporter and return handle for rendering
fn init_metrics() -> Result<PrometheusHandle> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics: {}", e))?;

    metrics::describe_counter!(
        "pageforge_requests_total",
        "Generation requests started, by provider"
    );
    metrics::describe_counter!(
        "pageforge_upstream_retries_total",
        "Upstream calls retried after an overload signal"
    );
    metrics::describe_counter!(
        "pageforge_fallbacks_total",
        "Fallback strategies attempted, by strategy"
    );
    metrics::describe_counter!("pageforge_errors_total", "Failed generations by error kind");
    metrics::describe_counter!("pageforge_tokens_total", "Tokens recorded in the usage log, by provider");
    metrics::describe_histogram!(
        "pageforge_generation_latency_seconds",
        metrics::Unit::Seconds,
        "Wall-clock time per generation"
    );

    info!("Metrics exporter initialized");
    Ok(handle)
}
