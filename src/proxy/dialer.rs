//! Outbound TCP connections to origins and tunnel targets

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::error::{ProxyError, Result};

/// Opens outbound connections
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream>;
}

/// Dials targets directly over TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    #[instrument(skip(self))]
    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        debug!("Dialing {}", format_authority(host, port));
        TcpStream::connect((host, port)).await.map_err(|e| {
            ProxyError::ConnectFailed(format!(
                "TCP connect to {} failed: {}",
                format_authority(host, port),
                e
            ))
        })
    }
}

/// Dial with an optional deadline
pub async fn dial(
    dialer: &dyn Dialer,
    host: &str,
    port: u16,
    timeout: Option<Duration>,
) -> Result<TcpStream> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, dialer.connect(host, port))
            .await
            .map_err(|_| ProxyError::Timeout)?,
        None => dialer.connect(host, port).await,
    }
}

fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
