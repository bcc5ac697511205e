//! Proxytrail - Entry Point
//!
//! Starts the recording proxy with graceful shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use proxytrail::config::LogConfig;
use proxytrail::proxy::ProxyServer;
use proxytrail::repository::TransactionRepository;
use proxytrail::{Config, Database};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first so the log settings apply from the first line
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!("Starting Proxytrail");

    // Connect to database
    let db = Database::new(&config).await?;
    let latency = db.health_check().await?;
    info!(path = %config.database.path, ?latency, "Connected to database");

    // Run migrations
    db.run_migrations().await?;
    info!("Database migrations complete");

    let repository = TransactionRepository::new(db.pool().clone());
    let proxy_server = ProxyServer::new(config.proxy.clone(), Arc::new(repository));

    let shutdown = CancellationToken::new();
    let proxy_shutdown = shutdown.clone();
    let mut proxy_task = tokio::spawn(async move { proxy_server.run(proxy_shutdown).await });

    info!("Proxy started on {}", config.proxy_addr());

    // Wait for a shutdown signal, or for the server to stop on its own
    let finished = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut proxy_task => Some(result),
    };
    let outcome = match finished {
        Some(result) => result,
        None => {
            info!("Shutdown signal received");
            shutdown.cancel();
            proxy_task.await
        }
    };

    let outcome = match outcome {
        Ok(result) => result.map_err(anyhow::Error::from),
        Err(e) => Err(anyhow::anyhow!("Proxy task failed: {}", e)),
    };
    if let Err(e) = &outcome {
        error!("Proxy server error: {}", e);
    }

    db.close().await;
    info!("Proxytrail stopped");
    outcome
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("proxytrail={}", log.level).into());

    if log.is_json() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
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
            Ok(mut stream) => {
                stream.recv().await;
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
