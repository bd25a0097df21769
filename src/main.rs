//! Snova Proxy Server - Entry Point
//!
//! Builds the configured backends and runs the local proxy with graceful shutdown support.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use snova::config::{Config, LogConfig};
use snova::proxy::{ManagerRegistry, ProxyServer, Router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("failed to load configuration")?;

    init_tracing(&config.log);
    info!("Starting Snova Proxy Server");

    let registry = Arc::new(
        ManagerRegistry::from_config(&config).context("failed to build backends")?,
    );
    info!("Backends: {}", registry.names().join(", "));

    let router = Router::new(&config.routing);
    if let Some(missing) = router
        .backend_names()
        .into_iter()
        .find(|name| registry.get(name).is_none())
    {
        anyhow::bail!("routing refers to backend {} which is not configured", missing);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy_server = ProxyServer::new(config.server.clone(), registry, router);

    let proxy_task = tokio::spawn(async move {
        if let Err(e) = proxy_server.run(shutdown_rx).await {
            error!("Proxy server error: {}", e);
        }
    });

    info!("Server started - Proxy: {}", config.listen_addr());

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = proxy_task.await;

    info!("Snova Proxy Server stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("snova={}", log.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
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
