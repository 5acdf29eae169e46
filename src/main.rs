//! Simple Proxy - Entry Point
//!
//! Parses the listening port, loads configuration and runs the proxy until
//! Ctrl+C or SIGTERM.

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use simple_proxy::config::LogConfig;
use simple_proxy::proxy::ProxyServer;
use simple_proxy::{Config, Result};

#[derive(Parser)]
#[command(name = "simple-proxy")]
#[command(about = "Forward HTTP/HTTPS proxy with a whole-response cache", long_about = None)]
struct Cli {
    /// TCP port to listen on
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env_with_port(cli.port)?;

    init_tracing(&config.log);
    info!("Starting Simple Proxy");

    let server = ProxyServer::new(&config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy_task = tokio::spawn(async move {
        if let Err(e) = server.run(shutdown_rx).await {
            error!("Proxy server error: {}", e);
        }
    });

    info!(
        cache_capacity = config.cache.capacity,
        "Proxy listening on {}",
        config.proxy_addr()
    );

    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = proxy_task.await;

    info!("Simple Proxy stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("simple_proxy={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
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
            .expect("Failed to install signal handler")
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
