//! Simple Proxy - forward HTTP/HTTPS proxy
//!
//! ## Features
//!
//! - CONNECT tunnels relaying opaque bytes in both directions
//! - Plain requests fetched over HTTPS first, falling back to HTTP
//! - Same-scheme redirects followed before a response is judged
//! - Whole-response cache keyed by URL, bounded with FIFO eviction

pub mod cache;
pub mod config;
pub mod error;
pub mod proxy;

pub use cache::ResponseCache;
pub use config::Config;
pub use error::{ProxyError, Result};
