//! Query Exporter Binary Entry Point
//!
//! Loads the configuration, starts query scheduling and serves metrics.
//! Core functionality is provided by the `query_exporter` library crate.

use clap::Parser;
use query_exporter::{
    clock::SystemClock,
    collector::{Pipeline, QueryScheduler},
    config::AppConfig,
    metrics::MetricsRegistry,
    server::{AppState, create_router},
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Export Prometheus metrics generated from SQL queries
#[derive(Parser, Debug)]
#[command(name = "query-exporter", version, about, long_about = None)]
struct Cli {
    /// Configuration file, repeat to merge several
    #[arg(
        short,
        long,
        default_value = "config.yaml",
        env = "QE_CONFIG",
        value_delimiter = ','
    )]
    config: Vec<PathBuf>,

    /// Server bind address (overrides config file)
    #[arg(long, env = "QE_HOST")]
    host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, env = "QE_PORT")]
    port: Option<u16>,

    /// Only validate the configuration, then exit
    #[arg(long)]
    check_only: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,query_exporter=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    tracing::info!(paths = ?cli.config, "Loading configuration");
    let mut config = AppConfig::load_files(cli.config.as_slice())?;

    // Apply CLI/env overrides (CLI > ENV > config file)
    if let Some(host) = cli.host {
        config.server.bind = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.validate()?;

    if cli.check_only {
        tracing::info!(
            databases = config.databases.len(),
            metrics = config.metrics.len(),
            queries = config.queries.len(),
            "Configuration is valid"
        );
        return Ok(());
    }

    let registry = Arc::new(MetricsRegistry::new(Arc::new(SystemClock)));
    let pipeline = Arc::new(Pipeline::new(&config, Arc::clone(&registry))?);
    let scheduler = Arc::new(QueryScheduler::new(pipeline)?);
    scheduler.start();

    let app = create_router(AppState {
        scheduler: Arc::clone(&scheduler),
        registry,
    });

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Listening on: http://{}", addr);
    tracing::info!("Press Ctrl+C to shutdown");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Setup graceful shutdown signal handler.
async fn shutdown_signal(scheduler: Arc<QueryScheduler>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }

    tracing::info!("Shutting down query scheduler...");
    scheduler.shutdown().await;
}
