use thiserror::Error;

/// Unified error type for the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    // Request errors
    #[error("Empty request line")]
    EmptyRequest,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    // Upstream errors
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Origin responded with status {status}")]
    UpstreamStatus { status: u16 },

    #[error("Operation timed out")]
    Timeout,

    // Tunnel errors
    #[error("Tunnel error: {0}")]
    TunnelError(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Whether a failed secure attempt should be retried over plaintext.
    ///
    /// Only failures that happen before any body byte reaches the client
    /// qualify; a malformed URL stays malformed under either scheme.
    pub fn is_fallback_trigger(&self) -> bool {
        matches!(
            self,
            ProxyError::ConnectFailed(_)
                | ProxyError::Tls(_)
                | ProxyError::UpstreamStatus { .. }
                | ProxyError::Timeout
                | ProxyError::Http(_)
        )
    }

    /// Whether the failure is worth surfacing to the operator at warn level
    pub fn is_request_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::InvalidUrl(_)
                | ProxyError::ConnectFailed(_)
                | ProxyError::UpstreamStatus { .. }
                | ProxyError::Timeout
                | ProxyError::Http(_)
                | ProxyError::Tls(_)
        )
    }
}

// Convert from hyper errors
impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for ProxyError {
    fn from(err: url::ParseError) -> Self {
        ProxyError::InvalidUrl(err.to_string())
    }
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}
