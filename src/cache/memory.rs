//! Bounded in-memory cache store.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::AsyncWrite;

use crate::cache::store::{
    CacheHit, CacheKey, CacheReadResult, CacheStats, CacheStore, CacheWriteResult, CacheWriter,
    CachedObject,
};
use crate::config::CacheConfig;
use crate::http::ResponseHead;
use crate::vc::BoxWrite;

#[derive(Debug, Default)]
struct Inner {
    objects: DashMap<CacheKey, Arc<CachedObject>>,
    writers: DashMap<CacheKey, Instant>,
    max_entries: usize,
    max_object_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Inner {
    fn insert(&self, key: CacheKey, object: CachedObject) {
        if self.max_entries > 0 && !self.objects.contains_key(&key) {
            while self.objects.len() >= self.max_entries {
                let oldest = self
                    .objects
                    .iter()
                    .min_by_key(|e| e.value().stored_at)
                    .map(|e| e.key().clone());
                match oldest {
                    Some(victim) => {
                        self.objects.remove(&victim);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(key = %victim, "Cache object evicted");
                    }
                    None => break,
                }
            }
        }
        tracing::debug!(key = %key, bytes = object.body.len(), ttl_secs = object.ttl.as_secs(), "Cache object stored");
        self.objects.insert(key, Arc::new(object));
    }
}

/// Exclusive hold on a key; released on drop.
#[derive(Debug)]
struct WriteLock {
    key: CacheKey,
    inner: Arc<Inner>,
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        self.inner.writers.remove(&self.key);
    }
}

#[derive(Debug, Clone)]
pub struct MemoryCache {
    inner: Arc<Inner>,
}

impl MemoryCache {
    pub fn new(max_entries: usize, max_object_bytes: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_entries,
                max_object_bytes,
                ..Inner::default()
            }),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.max_object_bytes)
    }

    pub fn len(&self) -> usize {
        self.inner.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.objects.is_empty()
    }

    /// Store a complete object directly.
    pub fn insert(&self, key: CacheKey, object: CachedObject) {
        self.inner.insert(key, object);
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.inner.objects.remove(key).is_some()
    }

    fn lookup(&self, key: &CacheKey) -> Option<CacheHit> {
        self.inner.objects.get(key).map(|object| CacheHit {
            fresh: object.is_fresh(),
            object: Arc::clone(object.value()),
        })
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn open_read(&self, key: &CacheKey) -> CacheReadResult {
        if let Some(hit) = self.lookup(key) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            return CacheReadResult::Hit(hit);
        }
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        if self.inner.writers.contains_key(key) {
            CacheReadResult::Busy
        } else {
            CacheReadResult::Miss
        }
    }

    async fn open_write(&self, key: &CacheKey, retry_as_read: bool) -> CacheWriteResult {
        match self.inner.writers.entry(key.clone()) {
            Entry::Occupied(_) => {
                if retry_as_read {
                    if let Some(hit) = self.lookup(key).filter(|h| h.fresh) {
                        return CacheWriteResult::Hit(hit);
                    }
                }
                CacheWriteResult::LockMiss
            }
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                CacheWriteResult::Writer(Box::new(MemoryWriter {
                    lock: WriteLock {
                        key: key.clone(),
                        inner: Arc::clone(&self.inner),
                    },
                    head: None,
                    ttl: Duration::ZERO,
                }))
            }
        }
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.inner.objects.len(),
            bytes: self
                .inner
                .objects
                .iter()
                .map(|e| e.value().body.len() as u64)
                .sum(),
            writers: self.inner.writers.len(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }
}

struct MemoryWriter {
    lock: WriteLock,
    head: Option<ResponseHead>,
    ttl: Duration,
}

impl CacheWriter for MemoryWriter {
    fn set_response(&mut self, head: &ResponseHead, ttl: Duration) {
        self.head = Some(head.clone());
        self.ttl = ttl;
    }

    fn into_sink(self: Box<Self>) -> BoxWrite {
        let MemoryWriter { lock, head, ttl } = *self;
        Box::new(MemorySink {
            lock: Some(lock),
            head,
            ttl,
            body: BytesMut::new(),
            failed: false,
        })
    }
}

/// Body sink of one cache write.
struct MemorySink {
    lock: Option<WriteLock>,
    head: Option<ResponseHead>,
    ttl: Duration,
    body: BytesMut,
    failed: bool,
}

impl AsyncWrite for MemorySink {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(lock) = this.lock.as_ref() else {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "cache write finished")));
        };
        let limit = lock.inner.max_object_bytes;
        if this.failed || (this.body.len() + buf.len()) as u64 > limit {
            this.failed = true;
            this.body.clear();
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                format!("cache object exceeds {} bytes", limit),
            )));
        }
        this.body.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(lock) = this.lock.take() else {
            return Poll::Ready(Ok(()));
        };
        match this.head.take() {
            Some(response) if !this.failed => {
                let object = CachedObject {
                    response,
                    body: std::mem::take(&mut this.body).freeze(),
                    stored_at: Instant::now(),
                    ttl: this.ttl,
                };
                lock.inner.insert(lock.key.clone(), object);
            }
            _ => tracing::debug!(key = %lock.key, "Cache write discarded"),
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use tokio::io::AsyncWriteExt;
    use url::Url;

    fn key(path: &str) -> CacheKey {
        CacheKey::from_url(&Url::parse(&format!("http://a.test{}", path)).unwrap())
    }

    async fn write(cache: &MemoryCache, k: &CacheKey, body: &[u8], commit: bool) {
        let mut writer = match cache.open_write(k, false).await {
            CacheWriteResult::Writer(w) => w,
            other => panic!("expected writer, got {:?}", other),
        };
        writer.set_response(&ResponseHead::new(StatusCode::OK), Duration::from_secs(60));
        let mut sink = writer.into_sink();
        sink.write_all(body).await.unwrap();
        if commit {
            sink.shutdown().await.unwrap();
        }
    }

    #[tokio::test]
    async fn commit_on_shutdown() {
        let cache = MemoryCache::new(10, 1024);
        let k = key("/a");
        write(&cache, &k, b"hello", true).await;

        match cache.open_read(&k).await {
            CacheReadResult::Hit(hit) => {
                assert!(hit.fresh);
                assert_eq!(&hit.object.body[..], b"hello");
            }
            other => panic!("expected hit, got {:?}", other),
        }
        assert_eq!(cache.stats().writers, 0);
    }

    #[tokio::test]
    async fn drop_discards_and_unlocks() {
        let cache = MemoryCache::new(10, 1024);
        let k = key("/a");
        write(&cache, &k, b"partial", false).await;
        assert!(matches!(cache.open_read(&k).await, CacheReadResult::Miss));
        assert!(matches!(cache.open_write(&k, false).await, CacheWriteResult::Writer(_)));
    }

    #[tokio::test]
    async fn second_writer_misses_lock_and_readers_see_busy() {
        let cache = MemoryCache::new(10, 1024);
        let k = key("/a");
        let first = cache.open_write(&k, false).await;
        assert!(matches!(first, CacheWriteResult::Writer(_)));
        assert!(matches!(cache.open_write(&k, true).await, CacheWriteResult::LockMiss));
        assert!(matches!(cache.open_read(&k).await, CacheReadResult::Busy));
        drop(first);
        assert!(matches!(cache.open_read(&k).await, CacheReadResult::Miss));
    }

    #[tokio::test]
    async fn oversized_body_fails_the_sink() {
        let cache = MemoryCache::new(10, 4);
        let k = key("/big");
        let mut writer = match cache.open_write(&k, false).await {
            CacheWriteResult::Writer(w) => w,
            other => panic!("expected writer, got {:?}", other),
        };
        writer.set_response(&ResponseHead::new(StatusCode::OK), Duration::from_secs(60));
        let mut sink = writer.into_sink();
        assert!(sink.write_all(b"too large").await.is_err());
        sink.shutdown().await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn oldest_entry_is_evicted() {
        let cache = MemoryCache::new(2, 1024);
        write(&cache, &key("/1"), b"1", true).await;
        write(&cache, &key("/2"), b"2", true).await;
        write(&cache, &key("/3"), b"3", true).await;
        assert_eq!(cache.len(), 2);
        assert!(matches!(cache.open_read(&key("/1")).await, CacheReadResult::Miss));
        assert_eq!(cache.stats().evictions, 1);
    }
}
