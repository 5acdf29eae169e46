//! Per-connection request handling
//!
//! Reads the request line, then serves the request from the cache, through a
//! CONNECT tunnel, or by fetching from the origin.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

use crate::cache::ResponseCache;
use crate::error::{ProxyError, Result};
use crate::proxy::dialer::Dialer;
use crate::proxy::fetch::{FetchOutcome, OriginFetcher};
use crate::proxy::relay::{replay_cached, RelayOutcome, RELAY_CHUNK_SIZE};
use crate::proxy::request_line::{cache_key, ConnectTarget, RequestLine};
use crate::proxy::tunnel::{TunnelHandler, TunnelStats};

/// Longest request line accepted from a client
const MAX_REQUEST_LINE: usize = 64 * 1024;

/// How long unread client input is drained after the response is sent
const LINGER: Duration = Duration::from_secs(2);

/// How a connection was served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    Cache(RelayOutcome),
    Origin(FetchOutcome),
    Tunnel(TunnelStats),
    /// CONNECT target could not be dialed; fetched from the origin instead
    Degraded(FetchOutcome),
}

/// Proxy connection handler
pub struct ProxyHandler {
    cache: Arc<ResponseCache>,
    fetcher: OriginFetcher,
    dialer: Arc<dyn Dialer>,
    connect_timeout: Option<Duration>,
}

impl ProxyHandler {
    pub fn new(
        cache: Arc<ResponseCache>,
        fetcher: OriginFetcher,
        dialer: Arc<dyn Dialer>,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            cache,
            fetcher,
            dialer,
            connect_timeout,
        }
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Handle one accepted client connection.
    ///
    /// Failures are logged here and never propagate to the listener; the
    /// client just sees its connection close.
    #[instrument(skip(self, stream))]
    pub async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Option<Served> {
        match self.serve(stream).await {
            Ok(served) => Some(served),
            Err(ProxyError::EmptyRequest) => {
                debug!("Empty request line, closing connection");
                None
            }
            Err(e) if e.is_request_failure() => {
                warn!(error = %e, "Request failed");
                None
            }
            Err(e) => {
                debug!(error = %e, "Connection abandoned");
                None
            }
        }
    }

    async fn serve(&self, stream: TcpStream) -> Result<Served> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::with_capacity(RELAY_CHUNK_SIZE, read_half);

        let request = read_request_line(&mut reader).await?;
        let key = cache_key(request.target());
        info!("Request for: {}", request.target());

        if let Some(target) = request.connect_target() {
            return self
                .serve_connect(&request, &target, &key, reader, write_half)
                .await;
        }

        // CONNECT exchanges never come from the cache, even when the line
        // did not match the tunnel pattern.
        let cached = if request.is_connect() {
            None
        } else {
            self.cache.lookup(&key)
        };

        let served = match cached {
            Some(body) => {
                let outcome = replay_cached(&self.cache, &key, body, &mut write_half).await?;
                info!("Connected to: {} from CACHE", key);
                Served::Cache(outcome)
            }
            None => Served::Origin(
                self.fetcher
                    .fetch(request.target(), &key, &mut write_half)
                    .await?,
            ),
        };

        close(reader, write_half).await;
        Ok(served)
    }

    async fn serve_connect(
        &self,
        request: &RequestLine,
        target: &ConnectTarget,
        key: &str,
        mut reader: BufReader<OwnedReadHalf>,
        mut write_half: OwnedWriteHalf,
    ) -> Result<Served> {
        let upstream =
            match TunnelHandler::dial(self.dialer.as_ref(), target, self.connect_timeout).await {
                Ok(upstream) => upstream,
                Err(e) => {
                    info!(error = %e, "Tunnel dial failed - fetching {} directly", request.target());
                    let outcome = self
                        .fetcher
                        .fetch(request.target(), key, &mut write_half)
                        .await?;
                    close(reader, write_half).await;
                    return Ok(Served::Degraded(outcome));
                }
            };

        TunnelHandler::skip_headers(&mut reader).await?;
        TunnelHandler::acknowledge(&mut write_half, target).await?;
        info!("Tunnel established to {}:{}", target.host, target.port);

        let stats = TunnelHandler::relay(reader, write_half, upstream).await?;
        Ok(Served::Tunnel(stats))
    }
}

/// Send FIN, then drain leftover client input for up to `LINGER`
async fn close(mut reader: BufReader<OwnedReadHalf>, mut write_half: OwnedWriteHalf) {
    let _ = write_half.shutdown().await;
    let mut sink = tokio::io::sink();
    let drain = tokio::io::copy(&mut reader, &mut sink);
    let _ = tokio::time::timeout(LINGER, drain).await;
}

/// Read the first line from the client, tolerating non-UTF-8 bytes
async fn read_request_line(reader: &mut BufReader<OwnedReadHalf>) -> Result<RequestLine> {
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(MAX_REQUEST_LINE as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Err(ProxyError::EmptyRequest);
    }

    RequestLine::parse(&String::from_utf8_lossy(&line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_close_sends_fin_and_drains_leftover_input() {
        let (mut client, server) = connected_pair().await;
        client
            .write_all(b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\n\r\n")
            .await
            .unwrap();

        let (read_half, mut write_half) = server.into_split();
        let mut reader = BufReader::new(read_half);
        let line = read_request_line(&mut reader).await.unwrap();
        assert_eq!(line.target(), "http://example.test/");
        write_half.write_all(b"body").await.unwrap();

        let closing = tokio::spawn(close(reader, write_half));

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut received))
            .await
            .expect("no FIN from the proxy side")
            .unwrap();
        assert_eq!(received, b"body");

        client.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), closing)
            .await
            .expect("drain did not stop at client EOF")
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_request_line_on_immediate_eof() {
        let (client, server) = connected_pair().await;
        drop(client);

        let (read_half, _write_half) = server.into_split();
        let mut reader = BufReader::new(read_half);
        assert!(matches!(
            read_request_line(&mut reader).await,
            Err(ProxyError::EmptyRequest)
        ));
    }
}
