//! Shared fixtures for proxy integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{RootCertStore, ServerConfig};
use simple_proxy::config::{CacheConfig, Config, LogConfig, ProxyServerConfig};
use simple_proxy::proxy::{Dialer, ProxyServerBuilder};
use simple_proxy::{ProxyError, ResponseCache};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

pub const WAIT: Duration = Duration::from_secs(5);

/// Routes `host:port` pairs to local listeners and counts dial attempts
#[derive(Default)]
pub struct MapDialer {
    routes: Mutex<HashMap<(String, u16), SocketAddr>>,
    attempts: Mutex<HashMap<(String, u16), usize>>,
}

impl MapDialer {
    pub fn route(&self, host: &str, port: u16, addr: SocketAddr) {
        self.routes.lock().insert((host.to_string(), port), addr);
    }

    pub fn attempts(&self, host: &str, port: u16) -> usize {
        self.attempts
            .lock()
            .get(&(host.to_string(), port))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_attempts(&self) -> usize {
        self.attempts.lock().values().sum()
    }
}

#[async_trait]
impl Dialer for MapDialer {
    async fn connect(&self, host: &str, port: u16) -> simple_proxy::Result<TcpStream> {
        let key = (host.to_string(), port);
        *self.attempts.lock().entry(key.clone()).or_default() += 1;

        let addr = self.routes.lock().get(&key).copied();
        let Some(addr) = addr else {
            return Err(ProxyError::ConnectFailed(format!("no route to {}:{}", host, port)));
        };
        TcpStream::connect(addr)
            .await
            .map_err(|e| ProxyError::ConnectFailed(e.to_string()))
    }
}

/// A local address with nothing listening on it
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Self-signed certificate and a root store trusting it
pub struct TestCert {
    pub server_config: Arc<ServerConfig>,
    pub roots: RootCertStore,
}

pub fn test_cert(host: &str) -> TestCert {
    test_cert_for(&[host])
}

/// One self-signed certificate valid for every name in `hosts`
pub fn test_cert_for(hosts: &[&str]) -> TestCert {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let names = hosts.iter().map(|host| host.to_string()).collect::<Vec<_>>();
    let params = rcgen::CertificateParams::new(names).unwrap();
    let cert = params.self_signed(&key_pair).unwrap();

    let cert_der: CertificateDer<'static> = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let mut roots = RootCertStore::empty();
    roots.add(cert_der.clone()).unwrap();

    let server_config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert_der], key_der)
    .unwrap();

    TestCert {
        server_config: Arc::new(server_config),
        roots,
    }
}

/// Canned origin response
#[derive(Clone)]
pub struct OriginResponse {
    pub status: u16,
    pub location: Option<String>,
    pub body: Vec<u8>,
}

impl OriginResponse {
    pub fn ok(body: &[u8]) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: &[u8]) -> Self {
        Self {
            status,
            location: None,
            body: body.to_vec(),
        }
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        Self {
            status,
            location: Some(location.to_string()),
            body: b"moved".to_vec(),
        }
    }
}

/// A mock origin: its address and how many requests it answered
pub struct Origin {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

impl Origin {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn answer<S>(mut stream: S, response: &OriginResponse) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            return Ok(());
        }
        head.push(byte[0]);
    }

    let location = response
        .location
        .as_ref()
        .map(|location| format!("Location: {}\r\n", location))
        .unwrap_or_default();
    let mut out = format!(
        "HTTP/1.1 {} Mock\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        location,
        response.body.len()
    )
    .into_bytes();
    out.extend_from_slice(&response.body);
    stream.write_all(&out).await?;
    stream.shutdown().await
}

/// Plain HTTP origin answering every request with `response`
pub async fn plain_origin(response: OriginResponse) -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let response = response.clone();
            tokio::spawn(async move {
                let _ = answer(stream, &response).await;
            });
        }
    });

    Origin { addr, hits }
}

/// HTTPS origin answering every request with `response`
pub async fn tls_origin(cert: &TestCert, response: OriginResponse) -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let acceptor = TlsAcceptor::from(cert.server_config.clone());

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let acceptor = acceptor.clone();
            let response = response.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    let _ = answer(tls, &response).await;
                }
            });
        }
    });

    Origin { addr, hits }
}

/// A running proxy bound to an ephemeral port
pub struct TestProxy {
    pub addr: SocketAddr,
    pub cache: Arc<ResponseCache>,
    shutdown: watch::Sender<bool>,
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub fn test_config(capacity: usize) -> Config {
    Config {
        proxy: ProxyServerConfig {
            port: 0,
            host: "127.0.0.1".to_string(),
            connect_timeout: Some(2),
        },
        cache: CacheConfig { capacity },
        log: LogConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
    }
}

pub async fn start_proxy(dialer: Arc<MapDialer>, roots: RootCertStore) -> TestProxy {
    let tls_config = simple_proxy::proxy::fetch::tls_config_with_roots(roots).unwrap();
    let server = ProxyServerBuilder::new(test_config(16))
        .dialer(dialer)
        .tls_config(tls_config)
        .build()
        .unwrap();
    let cache = server.handler().cache().clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = server.serve(listener, rx).await;
    });

    TestProxy {
        addr,
        cache,
        shutdown,
    }
}

/// Send `request`, half-close, and read until the proxy closes the connection.
///
/// A reset after the proxy has closed counts as the end of the response.
pub async fn roundtrip(proxy: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    tokio::time::timeout(WAIT, async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
            }
        }
    })
    .await
    .expect("proxy did not close the connection");
    response
}
