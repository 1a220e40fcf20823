use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use worklist_core::orchestrator::JobUpdateCallback;
use worklist_core::{
    build_adapters, config_path, load_config, validate_config, JobControl, JobOrchestrator,
    JobStatus, JobStore, RetryManager, Scheduler, SqliteJobStore, ValidationGate,
};
use worklist_server::api::create_router;
use worklist_server::metrics;
use worklist_server::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Set to `json` for structured log lines.
const LOG_FORMAT_ENV: &str = "WORKLIST_LOG_FORMAT";

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    match std::env::var(LOG_FORMAT_ENV).as_deref() {
        Ok("json") => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    init_logging();
    info!("worklist {}", VERSION);

    // Load configuration
    let config_path = config_path();
    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Validate configuration
    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded successfully");
    info!("Database path: {:?}", config.database.path);

    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    info!("Configuration hash: {}", &config_hash[..16]);

    // Create SQLite job store
    let store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::new(&config.database.path).context("Failed to create job store")?,
    );
    info!("Job store initialized");

    tokio::fs::create_dir_all(&config.pipeline.work_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create work directory {:?}",
                config.pipeline.work_dir
            )
        })?;

    // Create stage adapters; missing tools fail their jobs, not the service
    let adapters = build_adapters(&config.tools, &config.pacs);
    for (tool, e) in adapters.validate_all().await {
        warn!("Tool {} is not usable: {}", tool, e);
    }

    let mut control = JobControl::new(Arc::clone(&store));

    let scheduler = if config.scheduler.enabled {
        let update_callback: JobUpdateCallback = Arc::new(|job_id: &str, status: JobStatus| {
            metrics::JOB_STATUS_TRANSITIONS
                .with_label_values(&[status.as_str()])
                .inc();
            debug!("Job {} is now {}", job_id, status);
        });

        let orchestrator = JobOrchestrator::new(
            Arc::clone(&store),
            adapters,
            ValidationGate::new(config.validation.clone()),
            RetryManager::new(config.retry.clone()),
            config.pipeline.clone(),
        )
        .with_cancel_check_interval(config.scheduler.cancel_check_interval())
        .with_update_callback(update_callback);

        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            Arc::new(orchestrator),
        ));
        scheduler.start();
        control = control.with_scheduler(Arc::clone(&scheduler));
        Some(scheduler)
    } else {
        info!("Scheduler disabled in config, jobs are stored but not run");
        None
    };

    // Create app state
    let state = Arc::new(AppState::new(config.clone(), control));

    // Create router
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Stop scheduler; running stages are interrupted and resume on next start
    if let Some(ref scheduler) = scheduler {
        info!("Stopping scheduler...");
        scheduler.stop().await;
    }

    info!("Server shut down");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
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
