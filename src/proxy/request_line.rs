//! First-line parsing for incoming proxy requests

use crate::error::{ProxyError, Result};

/// The first line of a client request: `<METHOD> <URL> [HTTP/<version>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    method: String,
    target: String,
    version: Option<String>,
    /// Tokens after the version
    trailing: bool,
}

/// Destination of a `CONNECT host:port HTTP/1.x` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    /// Raw port text; validated when dialing so a bad port can degrade
    /// to a plain fetch instead of failing recognition.
    pub port: String,
    /// `1.0` or `1.1`, echoed back in the acknowledgment
    pub version: String,
}

impl RequestLine {
    /// Split a request line on whitespace.
    ///
    /// Anything with fewer than two tokens is an empty request.
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let (Some(method), Some(target)) = (tokens.next(), tokens.next()) else {
            return Err(ProxyError::EmptyRequest);
        };

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: tokens.next().map(str::to_string),
            trailing: tokens.next().is_some(),
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Match the whole line against `CONNECT <host>:<port> HTTP/<1.0|1.1>`
    /// (case-insensitive)
    pub fn connect_target(&self) -> Option<ConnectTarget> {
        if !self.is_connect() || self.trailing {
            return None;
        }

        let version = self.version.as_deref()?;
        let (scheme, number) = version.split_at_checked(5)?;
        if !scheme.eq_ignore_ascii_case("HTTP/") || !matches!(number, "1.0" | "1.1") {
            return None;
        }

        let (host, port) = self.target.rsplit_once(':')?;
        if host.is_empty() || port.is_empty() {
            return None;
        }

        Some(ConnectTarget {
            host: host.to_string(),
            port: port.to_string(),
            version: number.to_string(),
        })
    }
}

impl ConnectTarget {
    pub fn port(&self) -> Result<u16> {
        self.port
            .parse()
            .map_err(|_| ProxyError::InvalidPort(self.port.clone()))
    }

    /// Acknowledgment sent once the target socket is open
    pub fn established_response(&self) -> Vec<u8> {
        // Latin-1 control text; every character here is ASCII.
        format!(
            "HTTP/{} 200 Connection established\r\nProxy-agent: Simple/0.1\r\n\r\n",
            self.version
        )
        .into_bytes()
    }
}

/// Cache key for a request URL: the URL with its scheme prefixes removed
pub fn cache_key(url: &str) -> String {
    url.replace("https://", "").replace("http://", "")
}
