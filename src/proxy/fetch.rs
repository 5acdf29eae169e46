//! Non-tunneled origin fetches
//!
//! Every fetch is attempted over TLS first. If the origin cannot be reached
//! securely, or answers with anything but `200 OK`, the same URL is retried
//! over plaintext HTTP. Redirects that keep the scheme are followed on both
//! attempts.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use http::header::{CONNECTION, HOST, LOCATION};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tokio_util::io::StreamReader;
use tracing::{debug, info, instrument, warn};
use url::{Host, Position, Url};

use crate::cache::ResponseCache;
use crate::error::{ProxyError, Result};
use crate::proxy::dialer::{dial, Dialer};
use crate::proxy::relay::{relay_and_cache, RelayOutcome};

/// Redirect hops followed per attempt before the last response is used as is
const MAX_REDIRECTS: usize = 5;

/// How a fetch was ultimately served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Secure(RelayOutcome),
    Plain(RelayOutcome),
}

impl FetchOutcome {
    pub fn relay(&self) -> RelayOutcome {
        match self {
            FetchOutcome::Secure(outcome) | FetchOutcome::Plain(outcome) => *outcome,
        }
    }
}

/// TLS client configuration trusting the bundled webpki roots
pub fn default_tls_config() -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    tls_config_with_roots(roots)
}

/// TLS client configuration trusting only `roots`
pub fn tls_config_with_roots(roots: RootCertStore) -> Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Fetches plain requests from origin servers, caching what it streams
pub struct OriginFetcher {
    dialer: Arc<dyn Dialer>,
    tls: TlsConnector,
    cache: Arc<ResponseCache>,
    connect_timeout: Option<Duration>,
}

impl OriginFetcher {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        tls_config: Arc<ClientConfig>,
        cache: Arc<ResponseCache>,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            dialer,
            tls: TlsConnector::from(tls_config),
            cache,
            connect_timeout,
        }
    }

    /// Fetch `url` and stream its body to `client`, caching it under `key`.
    #[instrument(skip(self, client))]
    pub async fn fetch<W>(&self, url: &str, key: &str, client: &mut W) -> Result<FetchOutcome>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        match self.fetch_secure(url, key, client).await {
            Ok(outcome) => return Ok(FetchOutcome::Secure(outcome)),
            Err(ProxyError::UpstreamStatus { status }) => {
                info!(status, "HTTPS not available - trying HTTP request");
            }
            Err(e) if e.is_fallback_trigger() => {
                info!(error = %e, "Secure connection failed - trying HTTP request");
            }
            Err(e) => return Err(e),
        }

        self.fetch_plain(url, key, client).await.map(FetchOutcome::Plain)
    }

    async fn fetch_secure<W>(&self, url: &str, key: &str, client: &mut W) -> Result<RelayOutcome>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let response = self.get(secure_url(url)?).await?;
        if response.status() != StatusCode::OK {
            return Err(ProxyError::UpstreamStatus {
                status: response.status().as_u16(),
            });
        }

        let outcome = self.stream_body(response, key, client).await?;
        info!("Connected to: https://{}", key);
        Ok(outcome)
    }

    async fn fetch_plain<W>(&self, url: &str, key: &str, client: &mut W) -> Result<RelayOutcome>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let response = self.get(plain_url(url)?).await.inspect_err(|e| {
            warn!(error = %e, "Problem encountered while trying to connect to the server")
        })?;
        if response.status().is_client_error() || response.status().is_server_error() {
            return Err(ProxyError::UpstreamStatus {
                status: response.status().as_u16(),
            });
        }

        let outcome = self.stream_body(response, key, client).await?;
        info!("Connected to: http://{}", key);
        Ok(outcome)
    }

    /// `GET` `url`, following up to `MAX_REDIRECTS` same-scheme redirects
    async fn get(&self, mut url: Url) -> Result<Response<Incoming>> {
        let mut hops = 0;
        loop {
            let response = self.open(&url).await?;
            match redirect_target(&url, response.status(), response.headers()) {
                Some(next) if hops < MAX_REDIRECTS => {
                    let status = response.status().as_u16();
                    debug!(status, "Following redirect to {}", next);
                    hops += 1;
                    url = next;
                }
                _ => return Ok(response),
            }
        }
    }

    /// Dial the origin for `url`, wrapping it in TLS for `https`
    async fn open(&self, url: &Url) -> Result<Response<Incoming>> {
        let (host, port) = host_port(url)?;
        let tcp = dial(self.dialer.as_ref(), &host, port, self.connect_timeout).await?;
        if url.scheme() != "https" {
            return send_get(tcp, url).await;
        }

        let server_name = ServerName::try_from(host.clone()).map_err(|e| {
            ProxyError::InvalidUrl(format!("Invalid TLS server name '{}': {}", host, e))
        })?;
        let tls = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::Tls(format!("Handshake with {} failed: {}", host, e)))?;
        send_get(tls, url).await
    }

    async fn stream_body<W>(
        &self,
        response: Response<Incoming>,
        key: &str,
        client: &mut W,
    ) -> Result<RelayOutcome>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let body = response
            .into_body()
            .into_data_stream()
            .map_err(std::io::Error::other);
        let reader = StreamReader::new(body);
        tokio::pin!(reader);

        relay_and_cache(&self.cache, key, reader, client).await
    }
}

/// Issue `GET` for `url` over an established connection
async fn send_get<S>(stream: S, url: &Url) -> Result<Response<Incoming>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ProxyError::Http(format!("Handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Origin connection ended: {}", e);
        }
    });

    let request = Request::builder()
        .method(Method::GET)
        .uri(&url[Position::BeforePath..Position::AfterQuery])
        .header(HOST, &url[Position::BeforeHost..Position::AfterPort])
        .header(CONNECTION, "close")
        .body(Empty::<Bytes>::new())
        .map_err(|e| ProxyError::InvalidUrl(format!("Failed to build request: {}", e)))?;

    sender
        .send_request(request)
        .await
        .map_err(|e| ProxyError::Http(format!("Request failed: {}", e)))
}

/// Where an origin's redirect points, if it should be followed.
///
/// Only redirects that keep the scheme are followed.
fn redirect_target(url: &Url, status: StatusCode, headers: &HeaderMap) -> Option<Url> {
    if !matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    ) {
        return None;
    }

    let location = headers.get(LOCATION)?.to_str().ok()?;
    let next = url.join(location).ok()?;
    (next.scheme() == url.scheme()).then_some(next)
}

/// The target with a leading `scheme://` removed.
///
/// A scheme only counts when it starts the target, so a `://` further along,
/// e.g. inside a query, is left alone. Targets with nothing before the path
/// (`/favicon.ico`, `http://`) have no host and are rejected.
fn authority_and_rest(url: &str) -> Result<&str> {
    let rest = match url.split_once("://") {
        Some((scheme, rest)) if is_scheme(scheme) => rest,
        _ => url,
    };

    if rest.is_empty() || rest.starts_with(['/', '?', '#']) {
        return Err(ProxyError::InvalidUrl(format!("Missing host in {}", url)));
    }
    Ok(rest)
}

fn is_scheme(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// Rewrite `url` to use `https`
pub fn secure_url(url: &str) -> Result<Url> {
    let url = Url::parse(&format!("https://{}", authority_and_rest(url)?))?;
    if url.host().is_none() {
        return Err(ProxyError::InvalidUrl(format!("Missing host in {}", url)));
    }
    Ok(url)
}

/// Rewrite `url` to use `http`, dropping an explicit `:443`
pub fn plain_url(url: &str) -> Result<Url> {
    let mut url = Url::parse(&format!("http://{}", authority_and_rest(url)?))?;
    if url.host().is_none() {
        return Err(ProxyError::InvalidUrl(format!("Missing host in {}", url)));
    }
    if url.port() == Some(443) {
        url.set_port(None)
            .map_err(|_| ProxyError::InvalidUrl(format!("Cannot clear port on {}", url)))?;
    }
    Ok(url)
}

fn host_port(url: &Url) -> Result<(String, u16)> {
    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => return Err(ProxyError::InvalidUrl(format!("Missing host in {}", url))),
    };
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ProxyError::InvalidUrl(format!("Missing port in {}", url)))?;
    Ok((host, port))
}
