//! Streaming copy to the client with cache population

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::cache::ResponseCache;
use crate::error::Result;

/// Size of each read from the source stream
pub const RELAY_CHUNK_SIZE: usize = 32 * 1024;

/// Result of a completed relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Bytes written to the client
    pub bytes: u64,
    /// Whether the key was already cached when the relay started
    pub from_cache: bool,
    /// Whether this relay stored a new cache entry
    pub stored: bool,
}

/// Copy `source` to `client` chunk by chunk, caching the body under `key`.
///
/// Bytes are accumulated only if `key` is not cached when the relay starts,
/// and the entry is written only after `source` reaches EOF. A failure in
/// the middle of the stream leaves the cache untouched.
#[instrument(skip(cache, source, client))]
pub async fn relay_and_cache<R, W>(
    cache: &ResponseCache,
    key: &str,
    mut source: R,
    client: &mut W,
) -> Result<RelayOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let from_cache = cache.contains(key);
    let mut accumulated = BytesMut::new();
    let mut chunk = vec![0u8; RELAY_CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = source.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        client.write_all(&chunk[..n]).await?;
        if !from_cache {
            accumulated.extend_from_slice(&chunk[..n]);
        }
        total += n as u64;
    }
    client.flush().await?;

    let stored = !from_cache && cache.insert(key, accumulated.freeze());
    debug!(bytes = total, from_cache, stored, "Relay finished");

    Ok(RelayOutcome {
        bytes: total,
        from_cache,
        stored,
    })
}

/// Replay a cached body to the client
pub async fn replay_cached<W>(
    cache: &ResponseCache,
    key: &str,
    body: Bytes,
    client: &mut W,
) -> Result<RelayOutcome>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    relay_and_cache(cache, key, body.as_ref(), client).await
}
