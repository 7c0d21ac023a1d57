//! Configuration schema definitions.
//!
//! Every section derives Serde traits and carries defaults so a minimal (or
//! empty) TOML file yields a working forward proxy.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Client listener (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Reverse-proxy mapping rules.
    pub remap: RemapConfig,

    /// Timeouts for every suspension point.
    pub timeouts: TimeoutConfig,

    /// Redirect following.
    pub redirect: RedirectConfig,

    /// Origin connection limits, retries and host-down marking.
    pub origin: OriginConfig,

    /// Origin session sharing and pooling.
    pub session: SessionConfig,

    /// HTTP cache.
    pub cache: CacheConfig,

    /// Tunnel buffer sizing.
    pub tunnel: TunnelConfig,

    /// Background fill after client abort.
    pub background_fill: BackgroundFillConfig,

    /// Hook callouts.
    pub hooks: HookConfig,

    /// Header rewriting applied to forwarded messages.
    pub headers: HeaderConfig,

    /// Request/response header size limits.
    pub limits: LimitConfig,

    /// Static host overrides for the resolver.
    pub dns: DnsConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,

    /// Admin API.
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent client connections (backpressure).
    pub max_connections: usize,

    /// Set TCP_NODELAY on accepted sockets.
    pub tcp_nodelay: bool,

    /// Seconds to wait for live client sessions on shutdown.
    pub drain_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
            tcp_nodelay: true,
            drain_secs: 30,
        }
    }
}

/// Reverse proxy remap configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemapConfig {
    /// Reject requests that match no rule (reverse-proxy only mode).
    pub required: bool,

    /// Forward absolute-form requests that match no rule.
    pub allow_forward_proxy: bool,

    /// Ordered rules; higher priority checked first.
    pub rules: Vec<RemapRule>,
}

impl Default for RemapConfig {
    fn default() -> Self {
        Self {
            required: false,
            allow_forward_proxy: true,
            rules: Vec::new(),
        }
    }
}

/// One remap rule: request matcher plus origin replacement.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemapRule {
    /// Rule identifier for logging.
    pub name: String,

    /// Host header to match (exact, case-insensitive).
    pub host: Option<String>,

    /// Path prefix to match.
    pub path_prefix: Option<String>,

    /// Origin URL replacing scheme/host/port (e.g., "http://127.0.0.1:3000").
    pub origin: String,

    /// Keep the client's Host header instead of the origin's.
    #[serde(default)]
    pub preserve_host: bool,

    /// Rule priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,
}

/// Timeout configuration, in seconds unless named otherwise.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed to receive a complete request header.
    pub client_header_secs: u64,

    /// Idle keep-alive time between requests on a client connection.
    pub client_keepalive_secs: u64,

    /// Host resolution.
    pub dns_secs: u64,

    /// Origin TCP connect.
    pub connect_secs: u64,

    /// Time from request sent to complete response header.
    pub origin_response_secs: u64,

    /// No-activity timeout for body transfer in either direction.
    pub activity_secs: u64,

    /// Cache open-read / open-write.
    pub cache_open_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            client_header_secs: 30,
            client_keepalive_secs: 60,
            dns_secs: 5,
            connect_secs: 5,
            origin_response_secs: 30,
            activity_secs: 30,
            cache_open_ms: 1_000,
        }
    }
}

impl TimeoutConfig {
    pub fn client_header(&self) -> Duration {
        Duration::from_secs(self.client_header_secs)
    }

    pub fn client_keepalive(&self) -> Duration {
        Duration::from_secs(self.client_keepalive_secs)
    }

    pub fn dns(&self) -> Duration {
        Duration::from_secs(self.dns_secs)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn origin_response(&self) -> Duration {
        Duration::from_secs(self.origin_response_secs)
    }

    pub fn activity(&self) -> Duration {
        Duration::from_secs(self.activity_secs)
    }

    pub fn cache_open(&self) -> Duration {
        Duration::from_millis(self.cache_open_ms)
    }
}

/// Redirect following configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RedirectConfig {
    /// Maximum redirects followed per transaction (0 disables following).
    pub max_redirects: u32,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self { max_redirects: 0 }
    }
}

/// Origin-side limits and failure handling.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Global ceiling on open origin connections (0 = unlimited).
    pub max_connections: usize,

    /// Per-destination ceiling on open origin connections (0 = unlimited).
    pub max_connections_per_host: usize,

    /// Admission queue used when a ceiling is hit.
    pub queue: AdmissionQueueConfig,

    /// Connect attempts per transaction before giving up.
    pub connect_attempts: u32,

    /// Base delay for connect retry backoff.
    pub retry_base_delay_ms: u64,

    /// Cap for connect retry backoff.
    pub retry_max_delay_ms: u64,

    /// Consecutive failures before an address is marked down.
    pub down_threshold: u32,

    /// Seconds an address stays down before it is tried again.
    pub down_secs: u64,

    /// Accept CONNECT and run a blind tunnel.
    pub allow_connect: bool,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            max_connections: 0,
            max_connections_per_host: 0,
            queue: AdmissionQueueConfig::default(),
            connect_attempts: 3,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 1_000,
            down_threshold: 3,
            down_secs: 30,
            allow_connect: false,
        }
    }
}

/// Admission queue for origin connection ceilings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdmissionQueueConfig {
    /// Transactions allowed to wait per destination (0 disables the queue).
    pub max_depth: usize,

    /// Fixed delay between admission attempts.
    pub delay_ms: u64,

    /// Admission attempts before the transaction is throttled.
    pub max_retries: u32,
}

impl Default for AdmissionQueueConfig {
    fn default() -> Self {
        Self {
            max_depth: 0,
            delay_ms: 100,
            max_retries: 10,
        }
    }
}

/// How an idle origin session is matched to a new transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SharingMatch {
    /// Never share origin sessions.
    None,
    /// Match on the resolved address only.
    Ip,
    /// Match on the requested host name and port only.
    Host,
    /// Match on both address and host name.
    #[default]
    Both,
}

/// Origin session pooling.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session matching mode.
    pub sharing_match: SharingMatch,

    /// Requests carrying Authorization/Proxy-Authorization get a private session.
    pub auth_private: bool,

    /// Idle sessions kept per pool key.
    pub max_idle_per_key: usize,

    /// Seconds an idle session stays pooled.
    pub idle_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sharing_match: SharingMatch::Both,
            auth_private: true,
            max_idle_per_key: 16,
            idle_timeout_secs: 60,
        }
    }
}

/// HTTP cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable cache lookups and writes.
    pub enabled: bool,

    /// Freshness lifetime when the response carries no max-age.
    pub default_ttl_secs: u64,

    /// Largest body stored.
    pub max_object_bytes: u64,

    /// Largest number of objects held by the in-memory store.
    pub max_entries: usize,

    /// Wait for a concurrent writer and read its object instead of going to origin.
    pub read_while_writer: bool,

    /// Open-write attempts while another writer holds the object.
    pub open_write_retries: u32,

    /// Delay between open-write attempts.
    pub open_write_retry_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 60,
            max_object_bytes: 8 * 1024 * 1024,
            max_entries: 10_000,
            read_while_writer: true,
            open_write_retries: 5,
            open_write_retry_ms: 20,
        }
    }
}

/// Tunnel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Read buffer size per producer.
    pub buffer_bytes: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: 32 * 1024,
        }
    }
}

/// Background fill configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackgroundFillConfig {
    /// Allow background fill at all.
    pub enabled: bool,

    /// Fraction of the body already read before the client left (0.0 to 1.0).
    /// The default 0 fills every response with a live cache writer;
    /// unknown-length bodies qualify only at 0.
    pub completed_threshold: f64,

    /// No-activity timeout while filling without a client.
    pub activity_secs: u64,
}

impl Default for BackgroundFillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            completed_threshold: 0.0,
            activity_secs: 60,
        }
    }
}

/// Hook callout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HookConfig {
    /// Time a hook may hold the transaction before it is failed.
    pub callout_timeout_secs: u64,

    /// Fixed delay before retrying a busy hook lock.
    pub lock_retry_ms: u64,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            callout_timeout_secs: 30,
            lock_retry_ms: 10,
        }
    }
}

/// Header rewriting.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeaderConfig {
    /// Pseudonym placed in the Via header (empty disables Via).
    pub via_name: String,

    /// Append the client address to X-Forwarded-For.
    pub forwarded_for: bool,

    /// Add X-Request-Id to forwarded requests that lack one.
    pub request_id: bool,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            via_name: "txn-proxy".to_string(),
            forwarded_for: true,
            request_id: true,
        }
    }
}

/// Header size limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Maximum bytes of a request or response header block.
    pub max_header_bytes: usize,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
        }
    }
}

/// Resolver configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DnsConfig {
    /// Static host table consulted before the system resolver.
    pub hosts: HashMap<String, Vec<String>>,

    /// Order IPv4 addresses before IPv6.
    pub prefer_ipv4: bool,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter when RUST_LOG is unset.
    pub log_level: String,

    /// "pretty" or "json".
    pub log_format: String,

    /// Expose Prometheus metrics.
    pub metrics_enabled: bool,

    /// Metrics listener address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "txn_proxy=info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Serve the admin API.
    pub enabled: bool,

    /// Admin listener address.
    pub bind_address: String,

    /// Bearer key required on every admin request.
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "127.0.0.1:8081".to_string(),
            api_key: "admin-secret-key".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: ProxyConfig = toml::from_str("").unwrap();
        assert_eq!(config.listener.bind_address, "0.0.0.0:8080");
        assert_eq!(config.session.sharing_match, SharingMatch::Both);
        assert_eq!(config.redirect.max_redirects, 0);
        assert!(config.cache.enabled);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [session]
            sharing_match = "ip"

            [[remap.rules]]
            name = "api"
            path_prefix = "/api"
            origin = "http://127.0.0.1:3000"
            "#,
        )
        .unwrap();

        assert_eq!(config.session.sharing_match, SharingMatch::Ip);
        assert_eq!(config.session.max_idle_per_key, 16);
        assert_eq!(config.remap.rules.len(), 1);
        assert_eq!(config.remap.rules[0].priority, 0);
        assert!(!config.remap.rules[0].preserve_host);
    }
}
