// src/main.rs
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use golb::{
    config,
    controller::Controller,
    metrics::MetricsRegistry,
    server::listener::normalize_address,
    Balancer,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("golb=info".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "golb.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = config::load_config(&config_path).await?;

    // Initialize metrics
    let metrics_registry = Arc::new(MetricsRegistry::new()?);

    let balancer = Arc::new(Balancer::from_config(
        &config,
        Some(metrics_registry.collector()),
    )?);
    balancer
        .run_all()
        .await
        .context("Failed to enable virtual servers")?;

    // Start the admin controller if configured
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let controller_task = match &config.controller {
        Some(controller_config) => {
            let addr: SocketAddr = normalize_address(&controller_config.address)
                .parse()
                .with_context(|| {
                    format!("Invalid controller address {}", controller_config.address)
                })?;
            let controller = Arc::new(Controller::new(
                balancer.clone(),
                Some(metrics_registry.clone()),
                controller_config.auth.clone(),
            ));
            let (_, handle) = controller.serve(addr, async move {
                let _ = shutdown_rx.changed().await;
            })?;
            Some(handle)
        }
        None => None,
    };

    shutdown_signal().await;

    let _ = shutdown_tx.send(true);
    balancer.stop_all().await;
    if let Some(handle) = controller_task {
        let _ = handle.await;
    }

    info!("Shutdown complete");
    Ok(())
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to install signal handler: {}", err);
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

    info!("Shutdown signal received");
}
