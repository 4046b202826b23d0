//! Plugwatch binary entry point.
//!
//! Wires configuration, the device backend, the refresh engine and the HTTP
//! server together. Core functionality is provided by the `plugwatch`
//! library crate.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use plugwatch::config::Backend;
use plugwatch::device::sim::SimBackend;
use plugwatch::server::{AppState, create_router};
use plugwatch::{
    AppConfig, Credentials, DeviceFactory, Discovery, MetricCache, PlugExporter, RefreshEngine,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Plugwatch - Smart Plug Telemetry Exporter
#[derive(Parser, Debug)]
#[command(name = "plugwatch", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", env = "PLUGWATCH_CONFIG")]
    config: String,

    /// Server bind address (overrides config file)
    #[arg(long, env = "PLUGWATCH_SERVER_BIND")]
    server_bind: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, env = "PLUGWATCH_SERVER_PORT")]
    server_port: Option<u16>,

    /// Comma-separated device addresses (overrides config file)
    #[arg(long, env = "PLUGWATCH_DEVICES", value_delimiter = ',')]
    devices: Option<Vec<String>>,

    /// Device account username override
    #[arg(long)]
    username: Option<String>,

    /// Device account password override
    #[arg(long)]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,plugwatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Plugwatch - Smart Plug Telemetry Exporter");

    let cli = Cli::parse();

    let mut config = if std::path::Path::new(&cli.config).exists() {
        tracing::info!("Loading configuration from: {}", cli.config);
        AppConfig::load(&cli.config)?
    } else {
        tracing::warn!("Config file {} not found, using defaults", cli.config);
        AppConfig::default()
    };

    // Apply CLI/env overrides (CLI > ENV > config file)
    if let Some(bind) = cli.server_bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.server_port {
        config.server.port = port;
    }
    if let Some(devices) = cli.devices {
        config.exporter.devices = devices;
    }
    config.validate()?;

    let mut credentials = config.exporter.credentials();
    if cli.username.is_some() || cli.password.is_some() {
        let base = credentials.unwrap_or_default();
        credentials = Some(Credentials::new(
            cli.username.unwrap_or(base.username),
            cli.password.unwrap_or(base.password),
        ));
    }

    // Build the device backend and the refresh engine around it.
    let backend = match config.exporter.backend {
        Backend::Sim => Arc::new(SimBackend::new()),
    };
    let engine = Arc::new(RefreshEngine::new(
        config.exporter.engine_settings(credentials),
        Arc::new(MetricCache::new()),
        Arc::clone(&backend) as Arc<dyn DeviceFactory>,
        backend as Arc<dyn Discovery>,
    ));
    engine.initialize().await;

    log_startup_summary(&config, engine.device_count().await);

    // Interval mode: prime the cache, then poll in the background. In
    // scrape-triggered mode each scrape runs its own bounded refresh.
    if engine.interval_mode() {
        engine.run_cycle().await;
        let loop_engine = Arc::clone(&engine);
        tokio::spawn(async move { loop_engine.run().await });
    }

    let exporter = Arc::new(PlugExporter::new(engine, config.exporter.scrape_timeout));
    let app = create_router(AppState {
        exporter: Arc::clone(&exporter),
    });

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    tracing::info!("Scrape endpoint listening on: http://{}/metrics", addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(exporter))
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Log a readable startup summary with key runtime values.
fn log_startup_summary(config: &AppConfig, devices: usize) {
    match config.exporter.refresh_interval {
        Some(interval) => {
            tracing::info!(
                devices,
                interval_s = interval.as_secs(),
                "Automatic polling is enabled"
            );
        }
        None => {
            tracing::info!(
                devices,
                scrape_timeout_ms = config.exporter.scrape_timeout.as_millis() as u64,
                "Automatic polling is disabled; refreshing on scrape"
            );
        }
    }
}

/// Setup graceful shutdown signal handler.
async fn shutdown_signal(exporter: Arc<PlugExporter>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
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

    tracing::info!("Shutting down refresh engine...");
    exporter.cleanup().await;
}
