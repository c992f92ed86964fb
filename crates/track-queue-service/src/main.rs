//! # Track Queue Service
//!
//! Binary entry point for the track ingestion queue.
//!
//! This executable:
//! - Loads configuration from files and environment
//! - Initializes structured logging
//! - Builds the configured queue store and point store
//! - Starts one supervised consumer worker per queue type
//! - Serves the HTTP API from track-queue-api until SIGINT or SIGTERM

mod backends;

use std::path::PathBuf;
use std::time::Duration;
use track_queue_api::{start_server, LoggingConfig, ServiceConfig, ServiceError};
use track_queue_core::{IngestService, ShutdownToken};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Names an explicit configuration file to layer over the defaults
const CONFIG_FILE_ENV: &str = "TRACK_QUEUE_CONFIG_FILE";

#[tokio::main]
async fn main() {
    let explicit_path = std::env::var(CONFIG_FILE_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .map(PathBuf::from);

    let service_config = match ServiceConfig::load(explicit_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(&LoggingConfig::default());
            error!(
                error = %e,
                "Could not load service configuration; aborting. \
                 Fix the configuration and restart."
            );
            std::process::exit(e.exit_code());
        }
    };

    init_tracing(&service_config.logging);

    if let Err(e) = run(service_config).await {
        error!(error = %e, "Track queue service failed");
        std::process::exit(e.exit_code());
    }
}

async fn run(service_config: ServiceConfig) -> Result<(), ServiceError> {
    service_config.validate()?;

    info!(
        queue_backend = ?service_config.storage.queue_backend,
        point_backend = ?service_config.storage.point_backend,
        "Starting track queue service"
    );

    let queue_store = backends::build_queue_store(&service_config.storage).await?;
    let point_store = backends::build_point_store(
        &service_config.storage,
        service_config.ingest.worker.operation_timeout(),
    )
    .await?;

    let service = IngestService::new(queue_store, point_store, service_config.ingest.clone());
    let shutdown = ShutdownToken::new();
    let supervisor = service.start_workers(shutdown.clone());

    tokio::spawn(watch_signals(shutdown.clone()));

    let shutdown_timeout = Duration::from_secs(service_config.server.shutdown_timeout_seconds);
    let server_result = start_server(service_config, service, shutdown.clone()).await;

    // The server may have failed on its own; workers must stop either way.
    shutdown.cancel();
    if !supervisor.shutdown(shutdown_timeout).await {
        warn!(
            timeout_seconds = shutdown_timeout.as_secs(),
            "Workers did not finish their current cycle before the shutdown timeout"
        );
    }

    server_result?;
    info!("Track queue service stopped");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn watch_signals(shutdown: ShutdownToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }

    shutdown.cancel();
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &logging.level;
        EnvFilter::new(format!(
            "track_queue_service={level},track_queue_core={level},\
             track_queue_api={level},tower_http={level}"
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);

    if logging.json_format {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
