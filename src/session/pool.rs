//! Idle origin sessions, connection ceilings and the admission queue.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::config::{OriginConfig, ProxyConfig, SharingMatch};
use crate::net::BoxIo;
use crate::observability::metrics;
use crate::session::sharing::SessionPolicy;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("origin connection limit reached for {addr}")]
    Throttled { addr: SocketAddr },

    #[error("admission queue full for {addr}")]
    QueueFull { addr: SocketAddr },

    #[error("gave up on {addr} after {retries} admission retries")]
    QueueExhausted { addr: SocketAddr, retries: u32 },
}

/// What an idle session is filed under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub addr: SocketAddr,
    /// Requested `host:port`, lowercased.
    pub authority: String,
}

impl PoolKey {
    pub fn new(addr: SocketAddr, host: &str, port: u16) -> Self {
        Self {
            addr,
            authority: format!("{}:{}", host.to_ascii_lowercase(), port),
        }
    }

    fn matches(&self, wanted: &PoolKey, mode: SharingMatch) -> bool {
        match mode {
            SharingMatch::None => false,
            SharingMatch::Ip => self.addr == wanted.addr,
            SharingMatch::Host => self.authority == wanted.authority,
            SharingMatch::Both => self == wanted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct OpenCounts {
    total: AtomicUsize,
    per_addr: DashMap<SocketAddr, usize>,
}

/// Holds one unit of the global and per-address ceilings.
#[derive(Debug)]
struct Slot {
    counts: Arc<OpenCounts>,
    addr: SocketAddr,
}

impl Slot {
    fn try_new(counts: &Arc<OpenCounts>, addr: SocketAddr, max_total: usize, max_per_addr: usize) -> Option<Self> {
        let mut prev = counts.total.load(Ordering::Relaxed);
        loop {
            if max_total > 0 && prev >= max_total {
                return None;
            }
            match counts
                .total
                .compare_exchange_weak(prev, prev + 1, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }

        let mut per_addr = counts.per_addr.entry(addr).or_insert(0);
        if max_per_addr > 0 && *per_addr >= max_per_addr {
            drop(per_addr);
            counts.total.fetch_sub(1, Ordering::Relaxed);
            return None;
        }
        *per_addr += 1;
        drop(per_addr);

        Some(Self {
            counts: Arc::clone(counts),
            addr,
        })
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.counts.total.fetch_sub(1, Ordering::Relaxed);
        if let Some(mut n) = self.counts.per_addr.get_mut(&self.addr) {
            *n = n.saturating_sub(1);
        }
    }
}

/// Bookkeeping carried with a pooled connection.
#[derive(Debug)]
pub struct SessionMeta {
    pub id: SessionId,
    pub key: PoolKey,
    /// The origin allows another request on this connection.
    pub keepalive: bool,
    /// Bound to one transaction, never returned to the pool.
    pub private: bool,
    pub transaction_count: u32,
    pub created: Instant,
    idle_since: Instant,
    _slot: Slot,
}

/// An open origin connection plus its pool bookkeeping.
pub struct PooledSession {
    meta: SessionMeta,
    stream: BoxIo,
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession").field("meta", &self.meta).finish()
    }
}

impl PooledSession {
    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut SessionMeta {
        &mut self.meta
    }

    pub fn id(&self) -> SessionId {
        self.meta.id
    }

    /// Reused from the pool rather than freshly connected.
    pub fn is_reused(&self) -> bool {
        self.meta.transaction_count > 1
    }

    /// Split so the stream can be bound into a connection table.
    pub fn into_parts(self) -> (SessionMeta, BoxIo) {
        (self.meta, self.stream)
    }

    pub fn from_parts(meta: SessionMeta, stream: BoxIo) -> Self {
        Self { meta, stream }
    }
}

/// Permission to open one origin connection within the ceilings.
#[derive(Debug)]
pub struct ConnectPermit {
    slot: Slot,
    key: PoolKey,
    counters: Arc<Counters>,
}

impl ConnectPermit {
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Wrap a freshly connected stream; the permit's slot moves with it.
    pub fn into_session(self, stream: BoxIo) -> PooledSession {
        self.counters.connected.fetch_add(1, Ordering::Relaxed);
        metrics::record_pool_event("connect");
        let now = Instant::now();
        PooledSession {
            meta: SessionMeta {
                id: SessionId::next(),
                key: self.key,
                keepalive: true,
                private: false,
                transaction_count: 1,
                created: now,
                idle_since: now,
                _slot: self.slot,
            },
            stream,
        }
    }
}

/// A place in the admission queue of one address.
#[derive(Debug)]
pub struct QueueTicket {
    depth: Arc<DashMap<SocketAddr, usize>>,
    addr: SocketAddr,
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if let Some(mut n) = self.depth.get_mut(&self.addr) {
            *n = n.saturating_sub(1);
        }
    }
}

#[derive(Debug)]
pub enum Acquire {
    Found(PooledSession),
    NotFound(ConnectPermit),
    /// A connection ceiling is reached.
    Busy,
}

#[derive(Debug, Default)]
struct Counters {
    reused: AtomicU64,
    connected: AtomicU64,
    released: AtomicU64,
    closed: AtomicU64,
    throttled: AtomicU64,
}

/// Pool statistics for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub open: usize,
    pub open_per_address: HashMap<String, usize>,
    pub queued: usize,
    pub reused: u64,
    pub connected: u64,
    pub released: u64,
    pub closed: u64,
    pub throttled: u64,
    /// Sessions handed out and not yet released or closed.
    pub checked_out: u64,
}

#[derive(Debug, Clone)]
struct Limits {
    max_total: usize,
    max_per_addr: usize,
    max_idle_per_key: usize,
    idle_timeout: Duration,
    queue_depth: usize,
    queue_delay: Duration,
    queue_retries: u32,
}

#[derive(Clone)]
pub struct SessionPool {
    idle: Arc<Mutex<HashMap<PoolKey, VecDeque<PooledSession>>>>,
    counts: Arc<OpenCounts>,
    queued: Arc<DashMap<SocketAddr, usize>>,
    counters: Arc<Counters>,
    limits: Limits,
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl SessionPool {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(&config.origin, config.session.max_idle_per_key, config.session.idle_timeout_secs)
    }

    pub fn new(origin: &OriginConfig, max_idle_per_key: usize, idle_timeout_secs: u64) -> Self {
        Self {
            idle: Arc::new(Mutex::new(HashMap::new())),
            counts: Arc::new(OpenCounts::default()),
            queued: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
            limits: Limits {
                max_total: origin.max_connections,
                max_per_addr: origin.max_connections_per_host,
                max_idle_per_key,
                idle_timeout: Duration::from_secs(idle_timeout_secs),
                queue_depth: origin.queue.max_depth,
                queue_delay: Duration::from_millis(origin.queue.delay_ms),
                queue_retries: origin.queue.max_retries,
            },
        }
    }

    pub fn acquire(&self, key: &PoolKey, policy: &SessionPolicy) -> Acquire {
        if policy.shareable() {
            let (found, expired) = self.take_idle(key, policy.sharing);
            // Expired sessions give their slots back outside the idle lock.
            drop(expired);
            if let Some(mut session) = found {
                session.meta.transaction_count += 1;
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                metrics::record_pool_event("reuse");
                tracing::debug!(session = %session.id(), origin = %key.addr, "Reusing pooled origin session");
                return Acquire::Found(session);
            }
        }

        match Slot::try_new(&self.counts, key.addr, self.limits.max_total, self.limits.max_per_addr) {
            Some(slot) => Acquire::NotFound(ConnectPermit {
                slot,
                key: key.clone(),
                counters: Arc::clone(&self.counters),
            }),
            None => {
                self.counters.throttled.fetch_add(1, Ordering::Relaxed);
                metrics::record_pool_event("throttle");
                tracing::debug!(origin = %key.addr, "Origin connection ceiling reached");
                Acquire::Busy
            }
        }
    }

    fn take_idle(&self, key: &PoolKey, mode: SharingMatch) -> (Option<PooledSession>, Vec<PooledSession>) {
        let now = Instant::now();
        let timeout = self.limits.idle_timeout;
        let mut expired = Vec::new();
        let mut idle = self.idle.lock();

        let candidates: Vec<PoolKey> = idle
            .keys()
            .filter(|k| k.matches(key, mode))
            .cloned()
            .collect();
        let mut found = None;
        for candidate in candidates {
            let Some(queue) = idle.get_mut(&candidate) else {
                continue;
            };
            if let Some(session) = queue.pop_back() {
                if !timeout.is_zero() && now.duration_since(session.meta.idle_since) >= timeout {
                    expired.push(session);
                    // Everything older is expired too.
                    expired.extend(queue.drain(..));
                } else {
                    found = Some(session);
                }
            }
            if queue.is_empty() {
                idle.remove(&candidate);
            }
            if found.is_some() {
                break;
            }
        }
        (found, expired)
    }

    /// Return a session after a transaction. Sessions that cannot be reused
    /// are closed. Returns true when the session went back to the pool.
    pub fn release(&self, mut session: PooledSession) -> bool {
        if !session.meta.keepalive || session.meta.private {
            self.close(session);
            return false;
        }
        let mut idle = self.idle.lock();
        let queue = idle.entry(session.meta.key.clone()).or_default();
        if queue.len() >= self.limits.max_idle_per_key {
            drop(idle);
            self.close(session);
            return false;
        }
        session.meta.idle_since = Instant::now();
        tracing::debug!(session = %session.id(), origin = %session.meta.key.addr, "Origin session pooled");
        queue.push_back(session);
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        metrics::record_pool_event("release");
        true
    }

    pub fn close(&self, session: PooledSession) {
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        metrics::record_pool_event("close");
        tracing::trace!(session = %session.id(), "Origin session closed");
        drop(session);
    }

    /// Account for a session whose stream is already gone, e.g. closed by a
    /// tunnel. Its connection slot is freed.
    pub fn discard(&self, meta: SessionMeta) {
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        metrics::record_pool_event("close");
        tracing::trace!(session = %meta.id, "Origin session discarded");
        drop(meta);
    }

    /// Keep the session bound to its transaction.
    pub fn mark_private(&self, session: &mut PooledSession) {
        if !session.meta.private {
            tracing::debug!(session = %session.id(), "Origin session marked private");
        }
        session.meta.private = true;
    }

    /// Hand a client-bound private session to the client's next
    /// transaction. It never left its owner, so the pool counters stay put.
    pub fn resume_private(&self, mut session: PooledSession) -> PooledSession {
        session.meta.transaction_count += 1;
        tracing::debug!(session = %session.id(), origin = %session.meta.key.addr, "Resuming private origin session");
        session
    }

    /// Join the admission queue for `addr`; `None` when queueing is off or full.
    pub fn enqueue(&self, addr: SocketAddr) -> Option<QueueTicket> {
        if self.limits.queue_depth == 0 {
            return None;
        }
        let mut depth = self.queued.entry(addr).or_insert(0);
        if *depth >= self.limits.queue_depth {
            return None;
        }
        *depth += 1;
        drop(depth);
        Some(QueueTicket {
            depth: Arc::clone(&self.queued),
            addr,
        })
    }

    pub fn queue_delay(&self) -> Duration {
        self.limits.queue_delay
    }

    pub fn queue_retries(&self) -> u32 {
        self.limits.queue_retries
    }

    /// Drop idle sessions past the idle timeout. Returns how many closed.
    pub fn purge_expired(&self) -> usize {
        if self.limits.idle_timeout.is_zero() {
            return 0;
        }
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut idle = self.idle.lock();
            for queue in idle.values_mut() {
                while queue
                    .front()
                    .is_some_and(|s| now.duration_since(s.meta.idle_since) >= self.limits.idle_timeout)
                {
                    if let Some(session) = queue.pop_front() {
                        expired.push(session);
                    }
                }
            }
            idle.retain(|_, q| !q.is_empty());
        }
        let count = expired.len();
        drop(expired);
        count
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().values().map(VecDeque::len).sum()
    }

    pub fn open_count(&self) -> usize {
        self.counts.total.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PoolStats {
        let reused = self.counters.reused.load(Ordering::Relaxed);
        let connected = self.counters.connected.load(Ordering::Relaxed);
        let released = self.counters.released.load(Ordering::Relaxed);
        let closed = self.counters.closed.load(Ordering::Relaxed);
        PoolStats {
            idle: self.idle_count(),
            open: self.open_count(),
            open_per_address: self
                .counts
                .per_addr
                .iter()
                .filter(|e| *e.value() > 0)
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
            queued: self.queued.iter().map(|e| *e.value()).sum(),
            reused,
            connected,
            released,
            closed,
            throttled: self.counters.throttled.load(Ordering::Relaxed),
            checked_out: (reused + connected).saturating_sub(released + closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdmissionQueueConfig;
    use crate::net::io::boxed;

    fn origin(max_total: usize, max_per_host: usize) -> OriginConfig {
        OriginConfig {
            max_connections: max_total,
            max_connections_per_host: max_per_host,
            ..OriginConfig::default()
        }
    }

    fn stream() -> BoxIo {
        let (a, _b) = tokio::io::duplex(64);
        boxed(a)
    }

    fn key(port: u16, host: &str) -> PoolKey {
        PoolKey::new(format!("127.0.0.1:{}", port).parse().unwrap(), host, 80)
    }

    fn connect(pool: &SessionPool, key: &PoolKey) -> PooledSession {
        match pool.acquire(key, &SessionPolicy::default()) {
            Acquire::NotFound(permit) => permit.into_session(stream()),
            other => panic!("expected permit, got {:?}", other),
        }
    }

    #[test]
    fn release_then_acquire_reuses() {
        let pool = SessionPool::new(&OriginConfig::default(), 4, 60);
        let k = key(8080, "a.test");
        let session = connect(&pool, &k);
        let id = session.id();
        assert!(pool.release(session));

        match pool.acquire(&k, &SessionPolicy::default()) {
            Acquire::Found(s) => {
                assert_eq!(s.id(), id);
                assert!(s.is_reused());
                pool.close(s);
            }
            other => panic!("expected reuse, got {:?}", other),
        }
        let stats = pool.stats();
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.open, 0);
    }

    #[test]
    fn sharing_modes_match_differently() {
        let pool = SessionPool::new(&OriginConfig::default(), 4, 60);
        let stored = key(8080, "a.test");
        assert!(pool.release(connect(&pool, &stored)));

        let same_ip_other_host = key(8080, "b.test");
        let ip_only = SessionPolicy {
            sharing: SharingMatch::Ip,
            private: false,
        };
        let both = SessionPolicy::default();
        assert!(matches!(pool.acquire(&same_ip_other_host, &both), Acquire::NotFound(_)));
        assert!(matches!(pool.acquire(&same_ip_other_host, &ip_only), Acquire::Found(_)));
    }

    #[test]
    fn ceilings_make_acquire_busy() {
        let pool = SessionPool::new(&origin(0, 1), 4, 60);
        let k = key(8080, "a.test");
        let first = connect(&pool, &k);
        assert!(matches!(pool.acquire(&k, &SessionPolicy::default()), Acquire::Busy));
        // A different address is unaffected by the per-host ceiling.
        let other = connect(&pool, &key(8081, "a.test"));
        pool.close(first);
        assert!(matches!(pool.acquire(&k, &SessionPolicy::default()), Acquire::NotFound(_)));
        pool.close(other);
        assert_eq!(pool.stats().throttled, 1);
    }

    #[test]
    fn dropped_permit_returns_slot() {
        let pool = SessionPool::new(&origin(1, 0), 4, 60);
        let k = key(8080, "a.test");
        match pool.acquire(&k, &SessionPolicy::default()) {
            Acquire::NotFound(permit) => drop(permit),
            other => panic!("expected permit, got {:?}", other),
        }
        assert_eq!(pool.open_count(), 0);
        assert!(matches!(pool.acquire(&k, &SessionPolicy::default()), Acquire::NotFound(_)));
    }

    #[test]
    fn private_and_closing_sessions_are_not_pooled() {
        let pool = SessionPool::new(&OriginConfig::default(), 4, 60);
        let k = key(8080, "a.test");

        let mut private = connect(&pool, &k);
        pool.mark_private(&mut private);
        assert!(!pool.release(private));

        let mut closing = connect(&pool, &k);
        closing.meta_mut().keepalive = false;
        assert!(!pool.release(closing));

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.stats().closed, 2);
    }

    #[test]
    fn idle_bound_per_key() {
        let pool = SessionPool::new(&OriginConfig::default(), 1, 60);
        let k = key(8080, "a.test");
        let a = connect(&pool, &k);
        let b = connect(&pool, &k);
        assert!(pool.release(a));
        assert!(!pool.release(b));
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn expired_idle_sessions_are_dropped() {
        let pool = SessionPool::new(&OriginConfig::default(), 4, 0);
        let k = key(8080, "a.test");
        assert!(pool.release(connect(&pool, &k)));
        // Zero timeout disables expiry.
        assert_eq!(pool.purge_expired(), 0);
        assert!(matches!(pool.acquire(&k, &SessionPolicy::default()), Acquire::Found(_)));
    }

    #[test]
    fn admission_queue_depth() {
        let config = OriginConfig {
            queue: AdmissionQueueConfig {
                max_depth: 1,
                delay_ms: 5,
                max_retries: 2,
            },
            ..OriginConfig::default()
        };
        let pool = SessionPool::new(&config, 4, 60);
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let ticket = pool.enqueue(addr).unwrap();
        assert!(pool.enqueue(addr).is_none());
        assert_eq!(pool.stats().queued, 1);
        drop(ticket);
        assert!(pool.enqueue(addr).is_some());

        let no_queue = SessionPool::new(&OriginConfig::default(), 4, 60);
        assert!(no_queue.enqueue(addr).is_none());
    }
}
