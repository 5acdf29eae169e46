//! Proxy listener
//!
//! Accepts client connections and hands each one to its own handler task.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::ClientConfig;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::cache::ResponseCache;
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::proxy::dialer::{Dialer, DirectDialer};
use crate::proxy::fetch::{default_tls_config, OriginFetcher};
use crate::proxy::handler::ProxyHandler;

/// Proxy server
pub struct ProxyServer {
    addr: String,
    handler: Arc<ProxyHandler>,
}

impl ProxyServer {
    /// Create a proxy server with the default dialer and TLS roots
    pub fn new(config: &Config) -> Result<Self> {
        ProxyServerBuilder::new(config.clone()).build()
    }

    pub fn handler(&self) -> &Arc<ProxyHandler> {
        &self.handler
    }

    /// Bind the configured address and serve until shutdown
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = self.addr.parse().map_err(|_| {
            ProxyError::InvalidConfig(format!("Invalid proxy server address: {}", self.addr))
        })?;

        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections from `listener` until shutdown is signalled
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("Running proxy on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                handler.handle(stream, client_addr).await;
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Builder for creating a proxy server
pub struct ProxyServerBuilder {
    config: Config,
    dialer: Option<Arc<dyn Dialer>>,
    tls_config: Option<Arc<ClientConfig>>,
    cache: Option<Arc<ResponseCache>>,
}

impl ProxyServerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            dialer: None,
            tls_config: None,
            cache: None,
        }
    }

    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn tls_config(mut self, tls_config: Arc<ClientConfig>) -> Self {
        self.tls_config = Some(tls_config);
        self
    }

    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<ProxyServer> {
        let dialer = self.dialer.unwrap_or_else(|| Arc::new(DirectDialer));
        let tls_config = match self.tls_config {
            Some(tls_config) => tls_config,
            None => default_tls_config()?,
        };
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(ResponseCache::new(self.config.cache.capacity)));
        let connect_timeout = self.config.connect_timeout();

        let fetcher = OriginFetcher::new(dialer.clone(), tls_config, cache.clone(), connect_timeout);
        let handler = Arc::new(ProxyHandler::new(cache, fetcher, dialer, connect_timeout));

        Ok(ProxyServer {
            addr: self.config.proxy_addr(),
            handler,
        })
    }
}
