use crate::error::{ProxyError, Result};
use std::env;
use std::time::Duration;

/// Default number of cached responses
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy server configuration
    pub proxy: ProxyServerConfig,
    /// Response cache configuration
    pub cache: CacheConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Port for the proxy server (default: 8000)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Deadline for outbound dials, in seconds. `None` waits indefinitely.
    pub connect_timeout: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of cached responses (0 disables caching)
    pub capacity: usize,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let port = get_env_or("PROXY_PORT", "8000").parse().map_err(|_| {
            ProxyError::InvalidConfig("PROXY_PORT must be a valid port number".into())
        })?;
        Self::from_env_with_port(port)
    }

    /// Load configuration from environment variables, listening on `port`.
    ///
    /// `PROXY_PORT` is not read.
    pub fn from_env_with_port(port: u16) -> Result<Self> {
        let connect_timeout = match env::var("PROXY_CONNECT_TIMEOUT") {
            Ok(raw) if !raw.trim().is_empty() => Some(raw.trim().parse().map_err(|_| {
                ProxyError::InvalidConfig(
                    "PROXY_CONNECT_TIMEOUT must be a number of seconds".into(),
                )
            })?),
            _ => None,
        };

        let format = get_env_or("LOG_FORMAT", "pretty").to_lowercase();
        if format != "pretty" && format != "json" {
            return Err(ProxyError::InvalidConfig(
                "LOG_FORMAT must be either 'pretty' or 'json'".into(),
            ));
        }

        Ok(Config {
            proxy: ProxyServerConfig {
                port,
                host: get_env_or("PROXY_HOST", "0.0.0.0"),
                connect_timeout,
            },
            cache: CacheConfig {
                capacity: get_env_or("CACHE_CAPACITY", &DEFAULT_CACHE_CAPACITY.to_string())
                    .parse()
                    .map_err(|_| {
                        ProxyError::InvalidConfig("CACHE_CAPACITY must be a valid number".into())
                    })?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format,
            },
        })
    }

    /// Get the proxy server address
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }

    /// Outbound dial deadline, if one is configured
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.proxy.connect_timeout.map(Duration::from_secs)
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
