//! Cache store interface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::http::ResponseHead;
use crate::vc::BoxWrite;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    #[error("cache open timed out")]
    Timeout,

    #[error("object exceeds {limit} bytes")]
    TooLarge { limit: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a URL; the fragment never reaches the wire and is ignored.
    pub fn from_url(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(url.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A complete stored response.
#[derive(Debug)]
pub struct CachedObject {
    pub response: ResponseHead,
    pub body: Bytes,
    pub stored_at: Instant,
    pub ttl: Duration,
}

impl CachedObject {
    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }

    pub fn is_fresh(&self) -> bool {
        self.age() < self.ttl
    }
}

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub object: Arc<CachedObject>,
    pub fresh: bool,
}

#[derive(Debug)]
pub enum CacheReadResult {
    Hit(CacheHit),
    Miss,
    /// No object yet, but a writer is filling it.
    Busy,
    Error(CacheError),
}

pub enum CacheWriteResult {
    Writer(Box<dyn CacheWriter>),
    /// Another writer holds the key.
    LockMiss,
    /// Another writer holds the key and a readable object exists.
    Hit(CacheHit),
}

impl std::fmt::Debug for CacheWriteResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheWriteResult::Writer(_) => f.write_str("Writer"),
            CacheWriteResult::LockMiss => f.write_str("LockMiss"),
            CacheWriteResult::Hit(hit) => f.debug_tuple("Hit").field(hit).finish(),
        }
    }
}

/// Exclusive write access to one key.
pub trait CacheWriter: Send {
    fn set_response(&mut self, head: &ResponseHead, ttl: Duration);

    /// Body sink. Shutting it down commits the object; dropping it first
    /// discards everything written.
    fn into_sink(self: Box<Self>) -> BoxWrite;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub writers: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn open_read(&self, key: &CacheKey) -> CacheReadResult;

    async fn open_write(&self, key: &CacheKey, retry_as_read: bool) -> CacheWriteResult;

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_fragment() {
        let a = CacheKey::from_url(&Url::parse("http://a.test/x?y=1#frag").unwrap());
        let b = CacheKey::from_url(&Url::parse("http://a.test/x?y=1").unwrap());
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "http://a.test/x?y=1");
    }

    #[test]
    fn freshness_follows_ttl() {
        let object = CachedObject {
            response: ResponseHead::new(http::StatusCode::OK),
            body: Bytes::new(),
            stored_at: Instant::now(),
            ttl: Duration::from_secs(60),
        };
        assert!(object.is_fresh());
        let expired = CachedObject {
            ttl: Duration::ZERO,
            ..object
        };
        assert!(!expired.is_fresh());
    }
}
