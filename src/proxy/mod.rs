//! Proxy server implementation
//!
//! This module provides the proxy server functionality including:
//! - Request-line parsing
//! - HTTPS-first origin fetches with HTTP fallback
//! - CONNECT tunnels for HTTPS
//! - Streaming relay with response caching

pub mod dialer;
pub mod fetch;
pub mod handler;
pub mod relay;
pub mod request_line;
pub mod server;
pub mod tunnel;

pub use dialer::{Dialer, DirectDialer};
pub use fetch::{FetchOutcome, OriginFetcher};
pub use handler::{ProxyHandler, Served};
pub use request_line::{cache_key, ConnectTarget, RequestLine};
pub use server::{ProxyServer, ProxyServerBuilder};
pub use tunnel::TunnelHandler;
