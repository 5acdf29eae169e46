//! CONNECT tunnel implementation for HTTPS proxying
//!
//! Handles bidirectional data transfer between client and target server.

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::error::{ProxyError, Result};
use crate::proxy::dialer::{dial, Dialer};
use crate::proxy::request_line::ConnectTarget;

/// Upper bound on header bytes discarded after a CONNECT line
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Byte counts of a finished tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Client to target
    pub bytes_sent: u64,
    /// Target to client
    pub bytes_received: u64,
}

/// Handles CONNECT tunnel requests
pub struct TunnelHandler;

impl TunnelHandler {
    /// Open the TCP connection to the CONNECT target
    #[instrument(skip(dialer))]
    pub async fn dial(
        dialer: &dyn Dialer,
        target: &ConnectTarget,
        timeout: Option<Duration>,
    ) -> Result<TcpStream> {
        let port = target.port()?;
        debug!("Establishing tunnel to {}:{}", target.host, port);
        dial(dialer, &target.host, port, timeout).await
    }

    /// Discard the rest of the request head, up to and including the blank line
    pub async fn skip_headers<R>(client: &mut R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line = Vec::new();
        let mut consumed = 0;
        loop {
            line.clear();
            let n = client.read_until(b'\n', &mut line).await?;
            consumed += n;
            if n == 0 || line == b"\r\n" || line == b"\n" {
                return Ok(());
            }
            if consumed > MAX_HEADER_BYTES {
                return Err(ProxyError::TunnelError("request head too large".into()));
            }
        }
    }

    /// Tell the client the tunnel is up
    pub async fn acknowledge<W>(client: &mut W, target: &ConnectTarget) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        client.write_all(&target.established_response()).await?;
        client.flush().await?;
        Ok(())
    }

    /// Relay bytes in both directions until the client side finishes.
    ///
    /// Target to client runs on a spawned task; client to target runs on the
    /// current one. Once the client stops sending, the target's write half is
    /// shut down and the spawned task is joined before anything is dropped.
    #[instrument(skip_all)]
    pub async fn relay<R, W, T>(
        mut client_read: R,
        mut client_write: W,
        target: T,
    ) -> Result<TunnelStats>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut target_read, mut target_write) = tokio::io::split(target);

        let target_to_client = tokio::spawn(async move {
            let result = tokio::io::copy(&mut target_read, &mut client_write).await;
            let _ = client_write.shutdown().await;
            result
        });

        let client_to_target = tokio::io::copy(&mut client_read, &mut target_write).await;
        let _ = target_write.shutdown().await;

        let target_to_client = target_to_client
            .await
            .map_err(|e| ProxyError::TunnelError(format!("relay task failed: {}", e)))?;

        let bytes_sent = client_to_target.unwrap_or_else(|e| {
            debug!("Client to target copy ended: {}", e);
            0
        });

        let bytes_received = target_to_client.unwrap_or_else(|e| {
            debug!("Target to client copy ended: {}", e);
            0
        });

        debug!(bytes_sent, bytes_received, "Tunnel closed");

        Ok(TunnelStats {
            bytes_sent,
            bytes_received,
        })
    }
}
