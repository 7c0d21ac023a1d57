//! Drives open-for-read and open-for-write against a cache store.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::store::{
    CacheError, CacheHit, CacheKey, CacheReadResult, CacheStats, CacheStore, CacheWriteResult,
    CacheWriter,
};
use crate::config::CacheConfig;
use crate::observability::metrics::record_cache_lookup;

/// Result of a cache lookup as seen by the transaction.
#[derive(Debug)]
pub enum LookupOutcome {
    /// Cache disabled or request not cacheable.
    Skipped,
    Hit(CacheHit),
    /// Object present but past its TTL; kept for serve-stale.
    Stale(CacheHit),
    Miss,
    Error(CacheError),
}

impl LookupOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupOutcome::Skipped => "skipped",
            LookupOutcome::Hit(_) => "hit_fresh",
            LookupOutcome::Stale(_) => "hit_stale",
            LookupOutcome::Miss => "miss",
            LookupOutcome::Error(_) => "error",
        }
    }
}

#[derive(Clone)]
pub struct CachePipeline {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
}

impl std::fmt::Debug for CachePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePipeline")
            .field("enabled", &self.config.enabled)
            .finish()
    }
}

impl CachePipeline {
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.config.default_ttl_secs)
    }

    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.config.open_write_retry_ms)
    }

    /// Open for read. A key another transaction is writing is retried while
    /// read-while-writer is on; after the last attempt it counts as a miss.
    pub async fn lookup(&self, key: &CacheKey) -> LookupOutcome {
        if !self.config.enabled {
            return LookupOutcome::Skipped;
        }

        let mut attempts = 0u32;
        let outcome = loop {
            match self.store.open_read(key).await {
                CacheReadResult::Hit(hit) if hit.fresh => break LookupOutcome::Hit(hit),
                CacheReadResult::Hit(hit) => break LookupOutcome::Stale(hit),
                CacheReadResult::Miss => break LookupOutcome::Miss,
                CacheReadResult::Error(e) => break LookupOutcome::Error(e),
                CacheReadResult::Busy => {
                    record_cache_lookup("busy");
                    if !self.config.read_while_writer || attempts >= self.config.open_write_retries {
                        tracing::debug!(key = %key, attempts, "Cache writer still busy, treating as miss");
                        break LookupOutcome::Miss;
                    }
                    attempts += 1;
                    tokio::time::sleep(self.retry_delay()).await;
                }
            }
        };

        record_cache_lookup(outcome.as_str());
        tracing::debug!(key = %key, result = outcome.as_str(), "Cache lookup");
        outcome
    }

    /// Open for write, retrying while another writer holds the key.
    pub async fn open_writer(&self, key: &CacheKey) -> Option<Box<dyn CacheWriter>> {
        if !self.config.enabled {
            return None;
        }
        let mut attempts = 0u32;
        loop {
            match self.store.open_write(key, false).await {
                CacheWriteResult::Writer(writer) => return Some(writer),
                CacheWriteResult::Hit(_) => return None,
                CacheWriteResult::LockMiss => {
                    if attempts >= self.config.open_write_retries {
                        tracing::debug!(key = %key, attempts, "Cache write lock busy, not caching");
                        return None;
                    }
                    attempts += 1;
                    tokio::time::sleep(self.retry_delay()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;
    use crate::cache::store::CachedObject;
    use crate::http::ResponseHead;
    use bytes::Bytes;
    use std::time::Instant;
    use url::Url;

    fn key() -> CacheKey {
        CacheKey::from_url(&Url::parse("http://a.test/obj").unwrap())
    }

    fn object(ttl: Duration) -> CachedObject {
        CachedObject {
            response: ResponseHead::new(http::StatusCode::OK),
            body: Bytes::from_static(b"cached"),
            stored_at: Instant::now(),
            ttl,
        }
    }

    fn config() -> CacheConfig {
        CacheConfig {
            open_write_retries: 2,
            open_write_retry_ms: 1,
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn fresh_and_stale_hits() {
        let store = MemoryCache::new(10, 1024);
        let pipeline = CachePipeline::new(Arc::new(store.clone()), config());

        assert!(matches!(pipeline.lookup(&key()).await, LookupOutcome::Miss));
        store.insert(key(), object(Duration::from_secs(60)));
        assert!(matches!(pipeline.lookup(&key()).await, LookupOutcome::Hit(_)));
        store.insert(key(), object(Duration::ZERO));
        assert!(matches!(pipeline.lookup(&key()).await, LookupOutcome::Stale(_)));
    }

    #[tokio::test]
    async fn disabled_cache_is_skipped() {
        let pipeline = CachePipeline::new(
            Arc::new(MemoryCache::new(10, 1024)),
            CacheConfig {
                enabled: false,
                ..config()
            },
        );
        assert!(matches!(pipeline.lookup(&key()).await, LookupOutcome::Skipped));
        assert!(pipeline.open_writer(&key()).await.is_none());
    }

    #[tokio::test]
    async fn busy_writer_is_read_once_committed() {
        let store = MemoryCache::new(10, 1024);
        let pipeline = CachePipeline::new(
            Arc::new(store.clone()),
            CacheConfig {
                open_write_retries: 50,
                open_write_retry_ms: 5,
                ..CacheConfig::default()
            },
        );
        let writer = pipeline.open_writer(&key()).await.unwrap();

        let committer = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                store.insert(key(), object(Duration::from_secs(60)));
                drop(writer);
            })
        };

        assert!(matches!(pipeline.lookup(&key()).await, LookupOutcome::Hit(_)));
        committer.await.unwrap();
    }

    #[tokio::test]
    async fn busy_writer_becomes_miss_after_retries() {
        let store = MemoryCache::new(10, 1024);
        let pipeline = CachePipeline::new(Arc::new(store), config());
        let _writer = pipeline.open_writer(&key()).await.unwrap();

        assert!(matches!(pipeline.lookup(&key()).await, LookupOutcome::Miss));
        assert!(pipeline.open_writer(&key()).await.is_none());
    }
}
