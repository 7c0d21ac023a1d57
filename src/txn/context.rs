//! The mutable record of one transaction.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use http::header::LOCATION;
use http::{Method, StatusCode};
use url::Url;

use crate::cache::{CacheHit, CacheKey};
use crate::config::ProxyConfig;
use crate::hooks::HookSet;
use crate::http::{BodyFraming, RequestHead, ResponseHead};
use crate::session::SessionPolicy;
use crate::txn::error::TxnError;
use crate::txn::handle::TxnId;

const REDIRECT_STATUSES: [u16; 7] = [300, 301, 302, 303, 305, 307, 308];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    ReadingClientHeaders,
    ResolvingDestination,
    CacheLookup,
    ServingFromCache,
    ConnectingOrigin,
    SendingOriginRequest,
    ReadingOriginHeaders,
    SendingClientResponse,
    TransferringBody,
    Tunneling,
    Closing,
}

impl TxnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnState::ReadingClientHeaders => "reading_client_headers",
            TxnState::ResolvingDestination => "resolving_destination",
            TxnState::CacheLookup => "cache_lookup",
            TxnState::ServingFromCache => "serving_from_cache",
            TxnState::ConnectingOrigin => "connecting_origin",
            TxnState::SendingOriginRequest => "sending_origin_request",
            TxnState::ReadingOriginHeaders => "reading_origin_headers",
            TxnState::SendingClientResponse => "sending_client_response",
            TxnState::TransferringBody => "transferring_body",
            TxnState::Tunneling => "tunneling",
            TxnState::Closing => "closing",
        }
    }
}

impl std::fmt::Display for TxnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache lookup result as recorded on the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    NotLooked,
    Skipped,
    HitFresh,
    HitStale,
    Miss,
    Error,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::NotLooked => "not_looked",
            CacheStatus::Skipped => "skipped",
            CacheStatus::HitFresh => "hit_fresh",
            CacheStatus::HitStale => "hit_stale",
            CacheStatus::Miss => "miss",
            CacheStatus::Error => "error",
        }
    }
}

/// Where the client response body comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Origin,
    Cache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    ClientAccept,
    RequestRead,
    DnsStart,
    DnsEnd,
    CacheLookupEnd,
    ServerConnect,
    FirstResponseByte,
    ResponseSent,
    Close,
}

impl Milestone {
    const ALL: [Milestone; 9] = [
        Milestone::ClientAccept,
        Milestone::RequestRead,
        Milestone::DnsStart,
        Milestone::DnsEnd,
        Milestone::CacheLookupEnd,
        Milestone::ServerConnect,
        Milestone::FirstResponseByte,
        Milestone::ResponseSent,
        Milestone::Close,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Milestone::ClientAccept => "client_accept",
            Milestone::RequestRead => "request_read",
            Milestone::DnsStart => "dns_start",
            Milestone::DnsEnd => "dns_end",
            Milestone::CacheLookupEnd => "cache_lookup_end",
            Milestone::ServerConnect => "server_connect",
            Milestone::FirstResponseByte => "first_response_byte",
            Milestone::ResponseSent => "response_sent",
            Milestone::Close => "close",
        }
    }
}

/// Named timestamps.
#[derive(Debug, Clone, Default)]
pub struct Milestones {
    marks: [Option<Instant>; 9],
}

impl Milestones {
    pub fn mark(&mut self, milestone: Milestone) {
        self.marks[milestone as usize] = Some(Instant::now());
    }

    /// Keep the first mark; later calls are ignored.
    pub fn mark_once(&mut self, milestone: Milestone) {
        if self.get(milestone).is_none() {
            self.mark(milestone);
        }
    }

    pub fn set(&mut self, milestone: Milestone, at: Instant) {
        self.marks[milestone as usize] = Some(at);
    }

    pub fn get(&self, milestone: Milestone) -> Option<Instant> {
        self.marks[milestone as usize]
    }

    pub fn between(&self, from: Milestone, to: Milestone) -> Option<Duration> {
        Some(self.get(to)?.saturating_duration_since(self.get(from)?))
    }

    /// Time from client accept to each recorded milestone, for the close log.
    pub fn summary(&self) -> String {
        let Some(start) = self.get(Milestone::ClientAccept) else {
            return String::new();
        };
        Milestone::ALL
            .iter()
            .skip(1)
            .filter_map(|m| {
                self.get(*m)
                    .map(|t| format!("{}={}ms", m.as_str(), t.saturating_duration_since(start).as_millis()))
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Per-transaction options fixed when the transaction starts.
#[derive(Debug, Clone)]
pub struct TxnOptions {
    pub redirect_limit: u32,
    pub allow_connect: bool,
    pub max_header_bytes: usize,
}

impl TxnOptions {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            redirect_limit: config.redirect.max_redirects,
            allow_connect: config.origin.allow_connect,
            max_header_bytes: config.limits.max_header_bytes,
        }
    }
}

impl Default for TxnOptions {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

#[derive(Debug)]
pub struct TransactionContext {
    pub id: TxnId,
    pub client_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub state: TxnState,
    pub options: TxnOptions,

    pub client_request: Option<RequestHead>,
    pub request_framing: BodyFraming,
    /// URL the request is sent to after remapping and redirects.
    pub origin_url: Option<Url>,
    pub preserve_host: bool,
    pub remap_rule: Option<String>,
    pub resolved: Vec<SocketAddr>,
    pub origin_addr: Option<SocketAddr>,
    pub origin_connected: bool,
    pub session_reused: bool,
    pub session_policy: SessionPolicy,
    pub private: bool,

    pub cache_key: Option<CacheKey>,
    pub cache_status: CacheStatus,
    pub cache_hit: Option<CacheHit>,
    pub cache_disabled: bool,

    pub server_request: Option<RequestHead>,
    pub server_response: Option<ResponseHead>,
    pub response_framing: BodyFraming,
    pub client_response: Option<ResponseHead>,
    pub response_source: ResponseSource,
    pub response_sent: bool,
    pub client_keep_alive: bool,

    pub redirect_count: u32,
    pub redirect_override: Option<Url>,

    pub hooks_done: HookSet,
    pub error: Option<TxnError>,
    pub error_sent: bool,
    pub close_requested: bool,
    pub client_aborted: bool,
    pub served_stale: bool,
    pub background_fill: bool,

    pub milestones: Milestones,
}

impl TransactionContext {
    pub fn new(id: TxnId, client_addr: SocketAddr, local_addr: SocketAddr, options: TxnOptions) -> Self {
        let mut milestones = Milestones::default();
        milestones.mark(Milestone::ClientAccept);
        Self {
            id,
            client_addr,
            local_addr,
            state: TxnState::ReadingClientHeaders,
            options,
            client_request: None,
            request_framing: BodyFraming::Empty,
            origin_url: None,
            preserve_host: false,
            remap_rule: None,
            resolved: Vec::new(),
            origin_addr: None,
            origin_connected: false,
            session_reused: false,
            session_policy: SessionPolicy::default(),
            private: false,
            cache_key: None,
            cache_status: CacheStatus::NotLooked,
            cache_hit: None,
            cache_disabled: false,
            server_request: None,
            server_response: None,
            response_framing: BodyFraming::Empty,
            client_response: None,
            response_source: ResponseSource::Origin,
            response_sent: false,
            client_keep_alive: false,
            redirect_count: 0,
            redirect_override: None,
            hooks_done: HookSet::new(),
            error: None,
            error_sent: false,
            close_requested: false,
            client_aborted: false,
            served_stale: false,
            background_fill: false,
            milestones,
        }
    }

    pub fn method(&self) -> Option<&Method> {
        self.client_request.as_ref().map(|r| &r.method)
    }

    pub fn is_connect(&self) -> bool {
        self.method() == Some(&Method::CONNECT)
    }

    pub fn request_has_body(&self) -> bool {
        self.request_framing.has_body()
    }

    /// Origin host and port from the mapped URL.
    pub fn origin_host_port(&self) -> Option<(String, u16)> {
        let url = self.origin_url.as_ref()?;
        Some((url.host_str()?.to_string(), url.port_or_known_default()?))
    }

    /// Where the current origin response redirects to, if anywhere.
    pub fn redirect_target(&self) -> Option<Url> {
        if let Some(url) = &self.redirect_override {
            return Some(url.clone());
        }
        let response = self.server_response.as_ref()?;
        if !is_redirect_status(response.status) {
            return None;
        }
        let location = response.headers.get(LOCATION)?.to_str().ok()?;
        match &self.origin_url {
            Some(base) => base.join(location).ok(),
            None => Url::parse(location).ok(),
        }
    }

    pub fn set_error(&mut self, error: TxnError) {
        tracing::debug!(txn_id = %self.id, state = %self.state, error = %error, "Transaction error recorded");
        self.error = Some(error);
    }
}

pub fn is_redirect_status(status: StatusCode) -> bool {
    REDIRECT_STATUSES.contains(&status.as_u16())
}
