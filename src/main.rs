use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod error;
mod health;
mod observability;
mod proxy;
mod routing;
#[cfg(test)]
mod test_support;

use config::{Config, LogFormat, LoggingConfig};
use observability::{MetricsCollector, Observability, RequestLogger};
use proxy::{ReverseProxy, UpstreamProxyPool};
use routing::{ControlPlaneClient, RoutingCache};

#[derive(Parser, Debug)]
#[command(name = "token-router")]
#[command(about = "Token-routing reverse proxy for AI model backends")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[arg(short, long)]
    validate_config: bool,
}

fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
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

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(&args.config).await?;

    init_tracing(&config.logging);
    info!("Starting token router");

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    // Initialize components
    let metrics = Arc::new(MetricsCollector::new(&config.metrics)?);
    let logger = Arc::new(RequestLogger::new());
    let observability = Arc::new(Observability::new(metrics.clone(), logger.clone()));

    let credential = config.control_plane.credential.to_credential()?;
    let client = ControlPlaneClient::new(&config.control_plane, credential)?;
    let cache = Arc::new(RoutingCache::new(Arc::new(client), metrics.clone()));
    let pool = Arc::new(UpstreamProxyPool::new(&config.proxy, metrics.clone()));
    let reverse_proxy = Arc::new(ReverseProxy::new(cache.clone(), pool, observability, &config.proxy));

    let shutdown = CancellationToken::new();

    // Start routing table sync
    let sync_task = tokio::spawn(cache.clone().run_periodic(config.control_plane.sync_interval, shutdown.clone()));

    // Start metrics server if enabled
    let metrics_task = if config.metrics.enabled {
        let metrics = metrics.clone();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = metrics.start_server(shutdown).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start the main server
    let mut server_task = {
        let shutdown = shutdown.clone();
        let server_config = config.server.clone();
        tokio::spawn(async move {
            if let Err(e) = reverse_proxy.start(&server_config, shutdown).await {
                error!("Server error: {}", e);
            }
        })
    };

    info!("Token router started, listening on {}", config.server.listen_addr());

    // Handle shutdown gracefully
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        _ = &mut server_task => {
            error!("Main server task exited unexpectedly");
        }
    }

    shutdown.cancel();

    if let Err(e) = sync_task.await {
        warn!("Routing sync task ended abnormally: {}", e);
    }
    if !server_task.is_finished() {
        let _ = server_task.await;
    }
    if let Some(metrics_task) = metrics_task {
        let _ = metrics_task.await;
    }

    info!(statistics = %logger.statistics(), "Request log statistics");
    info!("Token router shutdown complete");
    Ok(())
}
