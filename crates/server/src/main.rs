use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fetchcast_core::{load_config, validate_config, AppContext, JobRegistry};
use fetchcast_server::api::create_router;
use fetchcast_server::state::AppState;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Determine config path
    let config_path = std::env::var("FETCHCAST_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    // Load configuration
    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Validate configuration
    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded successfully");
    info!("Output directory: {:?}", config.pipeline.output_dir);
    info!(
        "Concurrency: {} downloads, {} conversions",
        config.pipeline.download_concurrency, config.pipeline.convert_concurrency
    );

    tokio::fs::create_dir_all(&config.pipeline.output_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create output directory {:?}",
                config.pipeline.output_dir
            )
        })?;

    let context = Arc::new(AppContext::from_config(config.clone()));
    info!(
        "Using retriever {:?} and ffmpeg {:?}",
        config.retriever.binary, config.converter.ffmpeg_path
    );
    // Jobs fail individually when a tool is missing; the server still starts.
    if let Err(e) = context.check_tools().await {
        warn!("Converter not ready: {}", e);
    }

    let gc_handle = spawn_output_gc(
        Arc::clone(context.registry()),
        config.jobs.gc_interval_secs,
    );

    let state = Arc::new(AppState::new(Arc::clone(&context)));
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutting down...");
    if let Some(handle) = gc_handle {
        handle.abort();
    }

    // Stop whatever is still running so no tool outlives the server
    for job in context.registry().list() {
        if !job.status.is_terminal() {
            if let Err(e) = context.cancel_job(&job.id) {
                error!("Failed to cancel job {} on shutdown: {}", job.id, e);
            }
        }
    }
    let drained = tokio::time::timeout(
        context.config().pipeline.kill_grace() + Duration::from_secs(2),
        context.dispatch().wait_idle(),
    )
    .await;
    if drained.is_err() {
        error!("Timed out waiting for running jobs to stop");
    }

    Ok(())
}

/// Periodically drops finished jobs whose outputs were deleted.
fn spawn_output_gc(registry: Arc<JobRegistry>, interval_secs: u64) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        info!("Output garbage collection disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.tick().await;
        loop {
            interval.tick().await;
            let pruned = registry.prune_missing_outputs();
            if pruned > 0 {
                info!("Pruned {} jobs with missing outputs", pruned);
            } else {
                debug!("No jobs with missing outputs");
            }
        }
    }))
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
