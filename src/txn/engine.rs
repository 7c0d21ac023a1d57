//! Transaction engine: one request from header read to teardown.
//!
//! # Data Flow
//! ```text
//! client session loop
//!     → run_transaction(services, snapshot, client)
//!     → read request head through the client VC
//!     → loop { policy.decide(ctx) → perform(action) }
//!           hooks         → HookDispatcher (state published to TxnShared)
//!           async phases  → PendingOp::wait (timeout + client abort watch)
//!           body transfer → Tunnel over the VC table
//!     → teardown: cancel pending, TxnClose hooks, reset tunnel,
//!       pool/close origin, keep or close client, retire_all
//!     → Some(client) for the next request on a keep-alive connection
//! ```
//!
//! # Design Decisions
//! - Every connection the transaction touches lives in its `VcTable`
//! - Errors are recorded in the context and handed to the policy
//! - Teardown runs once, when no action is in progress and the engine is
//!   marked for termination

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderValue, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::Instrument;

use crate::cache::cacheability::{request_cacheable, response_ttl, skip_lookup};
use crate::cache::{CacheKey, CachePipeline, CacheWriter, LookupOutcome, MemoryCache};
use crate::config::{ProxyConfig, SharingMatch};
use crate::hooks::{GlobalHooks, HookDispatcher, HookOutcome, HookPoint, SessionHooks};
use crate::http::headers::{
    append_forwarded_for, append_via, ensure_request_id, set_age, set_connection, strip_hop_by_hop,
};
use crate::http::request::parse_request;
use crate::http::response::{error_response, parse_response};
use crate::http::{read_head, request_framing, response_framing, BodyFraming, ParseError, ResponseHead};
use crate::net::io::boxed;
use crate::net::{BoxIo, ConnectionId};
use crate::observability::metrics;
use crate::resilience::RetrySchedule;
use crate::routing::remap::{RemapOutcome, RemapTable};
use crate::session::{Acquire, PoolError, PoolKey, PooledSession, SessionMeta, SessionPolicy, SessionPool};
use crate::tunnel::{
    BackgroundFillPolicy, BodyLength, ChunkAction, ConsumerOutcome, FinishAction, ProducerOutcome,
    RatioFill, Tunnel, TunnelSettings,
};
use crate::txn::context::{CacheStatus, Milestone, ResponseSource, TransactionContext, TxnOptions, TxnState};
use crate::txn::error::{OriginFailure, TxnError};
use crate::txn::handle::{TxnHandle, TxnShared};
use crate::txn::pending::{Awaited, ClientWatch, PendingKind, PendingOp};
use crate::txn::policy::{DefaultPolicy, NextAction, TransactionPolicy};
use crate::txn::registry::{TxnRegistry, TxnSummary};
use crate::txn::transform::{BodyTransform, TransformVc};
use crate::upstream::{
    AddressSelector, ConnectOptions, Connector, HealthRegistry, ResolveOptions, Resolver,
    StaticResolver, TcpConnector,
};
use crate::vc::{VcHandle, VcHandler, VcIo, VcKind, VcTable};

/// Process-wide collaborators shared by every transaction.
pub struct EngineServices {
    pub resolver: Arc<dyn Resolver>,
    pub connector: Arc<dyn Connector>,
    pub cache: CachePipeline,
    pub pool: SessionPool,
    pub health: Arc<HealthRegistry>,
    pub selector: AddressSelector,
    pub hooks: Arc<GlobalHooks>,
    pub policy: Arc<dyn TransactionPolicy>,
    pub fill: Arc<dyn BackgroundFillPolicy>,
    pub registry: TxnRegistry,
}

impl std::fmt::Debug for EngineServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineServices")
            .field("cache", &self.cache)
            .field("pool", &self.pool)
            .field("live", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl EngineServices {
    /// Default implementations of every collaborator.
    pub fn from_config(config: &ProxyConfig) -> Self {
        let store = Arc::new(MemoryCache::from_config(&config.cache));
        Self {
            resolver: Arc::new(StaticResolver::from_config(&config.dns)),
            connector: Arc::new(TcpConnector),
            cache: CachePipeline::new(store, config.cache.clone()),
            pool: SessionPool::from_config(config),
            health: Arc::new(HealthRegistry::from_config(&config.origin)),
            selector: AddressSelector::new(),
            hooks: Arc::new(GlobalHooks::new()),
            policy: Arc::new(DefaultPolicy),
            fill: Arc::new(RatioFill::from_config(&config.background_fill)),
            registry: TxnRegistry::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_cache(mut self, cache: CachePipeline) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn TransactionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<GlobalHooks>) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Config and remap table a transaction runs against. Taken once at start
/// so a reload never changes a transaction midway.
#[derive(Debug, Clone)]
pub struct TxnSnapshot {
    pub config: Arc<ProxyConfig>,
    pub remap: Arc<RemapTable>,
}

impl TxnSnapshot {
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        let remap = Arc::new(RemapTable::from_config(&config.remap));
        Self { config, remap }
    }
}

/// A client connection between transactions.
pub struct ClientConn {
    pub id: ConnectionId,
    pub stream: BoxIo,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    /// Bytes already read past the previous request.
    pub buffered: BytesMut,
    pub transactions: u32,
    pub hooks: SessionHooks,
    /// Set once a transaction went private; later transactions inherit it.
    pub private: bool,
    /// Origin session kept for this client by a private transaction.
    pub bound_session: Option<PooledSession>,
}

impl ClientConn {
    pub fn new(id: ConnectionId, stream: BoxIo, peer: SocketAddr, local: SocketAddr) -> Self {
        Self {
            id,
            stream,
            peer,
            local,
            buffered: BytesMut::new(),
            transactions: 0,
            hooks: SessionHooks::default(),
            private: false,
            bound_session: None,
        }
    }
}

impl std::fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConn")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("buffered", &self.buffered.len())
            .field("transactions", &self.transactions)
            .field("private", &self.private)
            .field("bound_session", &self.bound_session.as_ref().map(PooledSession::id))
            .finish()
    }
}

/// Run one transaction on `client`. Returns the connection when it can
/// carry another request.
pub async fn run_transaction(
    services: Arc<EngineServices>,
    snapshot: TxnSnapshot,
    client: ClientConn,
) -> Option<ClientConn> {
    let shared = TxnShared::new(Duration::from_millis(snapshot.config.hooks.lock_retry_ms)).handle();
    let span = tracing::debug_span!("txn", txn_id = %shared.id(), connection_id = %client.id);
    async move {
        let mut engine = TransactionEngine::new(services, snapshot, shared, client);
        engine.run().await
    }
    .instrument(span)
    .await
}

struct TransactionEngine {
    services: Arc<EngineServices>,
    config: Arc<ProxyConfig>,
    remap: Arc<RemapTable>,
    ctx: TransactionContext,
    shared: TxnHandle,
    dispatcher: HookDispatcher,
    table: VcTable,
    tunnel: Tunnel,
    pending: PendingOp,

    client_id: ConnectionId,
    client_vc: Option<VcHandle>,
    client_buffer: BytesMut,
    client_transactions: u32,
    session_hooks: SessionHooks,
    request_body_done: bool,
    client_half_closed: bool,

    server_vc: Option<VcHandle>,
    server_session: Option<SessionMeta>,
    server_buffer: BytesMut,
    origin_reusable: bool,
    bound_session: Option<PooledSession>,

    cache_read_vc: Option<VcHandle>,
    cache_writer: Option<Box<dyn CacheWriter>>,
    transform: Option<Box<dyn BodyTransform>>,
    request_id: Option<String>,

    terminate: bool,
    torn_down: bool,
}

enum HeadRead {
    Request,
    /// Clean close or idle timeout before any byte: no transaction.
    Nothing,
}

impl TransactionEngine {
    fn new(services: Arc<EngineServices>, snapshot: TxnSnapshot, shared: TxnHandle, client: ClientConn) -> Self {
        let config = snapshot.config;
        let dispatcher = HookDispatcher::new(
            Arc::clone(&services.hooks),
            Arc::clone(&client.hooks),
            &config.hooks,
        );
        let tunnel = Tunnel::new(TunnelSettings::from_config(&config), Arc::clone(&services.fill));
        let mut ctx = TransactionContext::new(shared.id(), client.peer, client.local, TxnOptions::from_config(&config));
        ctx.private = client.private;

        let mut table = VcTable::new();
        let client_vc = match table.attach(client.id, VcKind::Client, VcIo::Stream(client.stream)) {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::error!(error = %e, "Client connection could not be bound");
                None
            }
        };

        Self {
            services,
            config,
            remap: snapshot.remap,
            ctx,
            shared,
            dispatcher,
            table,
            tunnel,
            pending: PendingOp::new(),
            client_id: client.id,
            client_vc,
            client_buffer: client.buffered,
            client_transactions: client.transactions,
            session_hooks: client.hooks,
            request_body_done: true,
            client_half_closed: false,
            server_vc: None,
            server_session: None,
            server_buffer: BytesMut::new(),
            origin_reusable: false,
            bound_session: client.bound_session,
            cache_read_vc: None,
            cache_writer: None,
            transform: None,
            request_id: None,
            terminate: false,
            torn_down: false,
        }
    }

    async fn run(&mut self) -> Option<ClientConn> {
        match self.read_request().await {
            HeadRead::Nothing => {
                self.table.retire_all();
                self.release_bound_session();
                return None;
            }
            HeadRead::Request => {}
        }

        let (method, target) = match &self.ctx.client_request {
            Some(req) => (req.method.to_string(), req.uri.to_string()),
            None => ("-".to_string(), "-".to_string()),
        };
        self.services
            .registry
            .insert(TxnSummary::new(self.ctx.id, self.ctx.client_addr, &method, &target));
        metrics::set_live_transactions(self.services.registry.len());
        tracing::debug!(method = %method, target = %target, "Transaction started");

        let mut last_state = self.ctx.state;
        loop {
            let action = self.services.policy.decide(&mut self.ctx);
            if self.ctx.state != last_state {
                last_state = self.ctx.state;
                self.services
                    .registry
                    .update(self.ctx.id, self.ctx.state, self.ctx.redirect_count);
            }
            tracing::trace!(state = %self.ctx.state, action = ?action, "Next action");
            if action == NextAction::Done {
                break;
            }

            if let Err(e) = self.perform(action).await {
                if let TxnError::InternalInvariantViolation(detail) = &e {
                    tracing::error!(state = %self.ctx.state, detail = %detail, "Internal invariant violated");
                }
                self.ctx.set_error(e);
            }
        }

        self.terminate = true;
        self.teardown().await
    }

    async fn read_request(&mut self) -> HeadRead {
        let Some(client) = self.client_vc else {
            return HeadRead::Nothing;
        };
        let first = self.client_transactions == 0;
        let idle = if first {
            self.config.timeouts.client_header()
        } else {
            self.config.timeouts.client_keepalive()
        };
        let limit = self.ctx.options.max_header_bytes;

        let entry = match self.table.get_mut(client) {
            Ok(entry) => entry,
            Err(_) => return HeadRead::Nothing,
        };
        entry.set_handler(VcHandler::ClientRequestHeader);
        let Some(reader) = entry.reader_mut() else {
            return HeadRead::Nothing;
        };

        // The transaction starts with its first byte, not with the idle wait before it.
        let arrived = if self.client_buffer.is_empty() {
            self.client_buffer.reserve(4096);
            match tokio::time::timeout(idle, reader.read_buf(&mut self.client_buffer)).await {
                Ok(Ok(n)) => n > 0,
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Client read failed");
                    false
                }
                Err(_) => {
                    tracing::trace!(first, "Client idle, closing");
                    false
                }
            }
        } else {
            true
        };
        let read = if arrived {
            self.ctx.milestones.mark(Milestone::ClientAccept);
            let read = tokio::time::timeout(
                self.config.timeouts.client_header(),
                read_head(reader, &mut self.client_buffer, limit, parse_request),
            )
            .await;
            Some(read)
        } else {
            None
        };
        if let Ok(entry) = self.table.get_mut(client) {
            entry.set_handler(VcHandler::Idle);
        }
        let Some(read) = read else {
            return HeadRead::Nothing;
        };

        match read {
            Err(_) => {
                self.ctx.set_error(TxnError::Parse(ParseError::Incomplete));
                HeadRead::Request
            }
            Ok(Ok(None)) => HeadRead::Nothing,
            Ok(Ok(Some(head))) => {
                self.ctx.milestones.mark(Milestone::RequestRead);
                match request_framing(&head) {
                    Ok(framing) => {
                        self.ctx.request_framing = framing;
                        self.request_body_done = !framing.has_body();
                    }
                    Err(e) => self.ctx.set_error(e.into()),
                }
                self.ctx.client_keep_alive = head.keep_alive();
                self.ctx.client_request = Some(head);
                HeadRead::Request
            }
            Ok(Err(ParseError::Io(e))) => {
                tracing::debug!(error = %e, "Client read failed");
                HeadRead::Nothing
            }
            Ok(Err(e)) => {
                self.ctx.set_error(e.into());
                HeadRead::Request
            }
        }
    }

    async fn perform(&mut self, action: NextAction) -> Result<(), TxnError> {
        match action {
            NextAction::ApiHook(point) => {
                self.run_hook(point).await;
                Ok(())
            }
            NextAction::Remap => self.remap_request(),
            NextAction::Resolve => self.resolve().await,
            NextAction::LookupCache => self.lookup_cache().await,
            NextAction::ServeFromCache => self.serve_from_cache(),
            NextAction::ConnectOrigin => self.connect_origin(false).await,
            NextAction::SendRequest => self.send_request().await,
            NextAction::FollowRedirect => self.follow_redirect(),
            NextAction::PrepareResponse => self.prepare_response().await,
            NextAction::TransferResponse => self.transfer_response().await,
            NextAction::BlindTunnel => self.blind_tunnel().await,
            NextAction::SendError(status) => {
                self.send_error(status).await;
                Ok(())
            }
            NextAction::Done => Ok(()),
        }
    }

    // Hooks

    async fn run_hook(&mut self, point: HookPoint) {
        self.publish().await;
        let outcome = self.dispatcher.run(point, &self.shared).await;
        self.absorb().await;

        match outcome {
            HookOutcome::Continue => self.ctx.hooks_done.insert(point),
            HookOutcome::Error { hook } => {
                self.ctx.hooks_done.insert(point);
                self.ctx.set_error(TxnError::Hook { point, hook });
            }
            HookOutcome::Close => {
                tracing::debug!(point = %point, "Close requested by hook");
                self.ctx.close_requested = true;
            }
        }
        if self.shared.close_requested() {
            self.ctx.close_requested = true;
        }
        if self.shared.error_reported() && self.ctx.error.is_none() {
            self.ctx.set_error(TxnError::Hook {
                point,
                hook: "reported".to_string(),
            });
        }
    }

    async fn publish(&mut self) {
        let ctx = &self.ctx;
        self.shared
            .with(|state| {
                state.client_request = ctx.client_request.clone();
                state.server_request = ctx.server_request.clone();
                state.server_response = ctx.server_response.clone();
                state.client_response = ctx.client_response.clone();
                state.private = ctx.private;
                state.cache_disabled = ctx.cache_disabled;
                state.redirect_count = ctx.redirect_count;
            })
            .await;
    }

    async fn absorb(&mut self) {
        let ctx = &mut self.ctx;
        let transform = &mut self.transform;
        self.shared
            .with(|state| {
                ctx.client_request = state.client_request.clone();
                ctx.server_request = state.server_request.clone();
                ctx.server_response = state.server_response.clone();
                ctx.client_response = state.client_response.clone();
                ctx.private |= state.private;
                ctx.cache_disabled |= state.cache_disabled;
                if let Some(url) = state.redirect_override.take() {
                    ctx.redirect_override = Some(url);
                }
                if let Some(t) = state.transform.take() {
                    *transform = Some(t);
                }
            })
            .await;
    }

    // Remap and resolution

    fn remap_request(&mut self) -> Result<(), TxnError> {
        let request = self
            .ctx
            .client_request
            .as_ref()
            .ok_or_else(|| invariant("remap without a client request"))?;

        if request.method == Method::CONNECT {
            if !self.ctx.options.allow_connect {
                return Err(TxnError::MethodNotAllowed);
            }
            let authority = request
                .uri
                .authority()
                .ok_or_else(|| ParseError::InvalidTarget(request.uri.to_string()))?;
            let url = url::Url::parse(&format!("http://{}/", authority))
                .map_err(|_| ParseError::InvalidTarget(authority.to_string()))?;
            self.ctx.origin_url = Some(url);
            return Ok(());
        }

        match self.remap.map(request) {
            RemapOutcome::Mapped {
                rule,
                url,
                preserve_host,
            } => {
                tracing::debug!(rule = %rule, origin = %url, "Request remapped");
                self.ctx.remap_rule = Some(rule);
                self.ctx.preserve_host = preserve_host;
                self.ctx.origin_url = Some(url);
                Ok(())
            }
            RemapOutcome::Forward(url) => {
                self.ctx.origin_url = Some(url);
                Ok(())
            }
            RemapOutcome::Miss => Err(TxnError::RemapMiss),
        }
    }

    async fn resolve(&mut self) -> Result<(), TxnError> {
        let (host, port) = self
            .ctx
            .origin_host_port()
            .ok_or_else(|| invariant("resolve without an origin URL"))?;
        let resolver = Arc::clone(&self.services.resolver);
        let options = ResolveOptions::default();

        self.ctx.milestones.mark(Milestone::DnsStart);
        let timeout = self.config.timeouts.dns();
        let out = self
            .wait_watched(PendingKind::Dns, timeout, resolver.resolve(&host, port, &options))
            .await;
        self.ctx.milestones.mark(Milestone::DnsEnd);

        match out {
            Awaited::Done(Ok(addrs)) if !addrs.is_empty() => {
                tracing::debug!(origin = %host, addresses = addrs.len(), "Origin resolved");
                self.ctx.resolved = addrs;
                Ok(())
            }
            Awaited::Done(Ok(_)) => Err(TxnError::origin(OriginFailure::Resolve, format!("{host}: no addresses"))),
            Awaited::Done(Err(e)) => Err(TxnError::origin(OriginFailure::Resolve, e.to_string())),
            Awaited::TimedOut => Err(TxnError::origin(OriginFailure::Resolve, format!("{host}: timed out"))),
            Awaited::ClientAborted => Err(self.client_abort()),
            Awaited::Cancelled => Err(invariant("resolve cancelled")),
        }
    }

    // Cache

    async fn lookup_cache(&mut self) -> Result<(), TxnError> {
        let request = self
            .ctx
            .client_request
            .as_ref()
            .ok_or_else(|| invariant("cache lookup without a client request"))?;
        let url = self
            .ctx
            .origin_url
            .as_ref()
            .ok_or_else(|| invariant("cache lookup without an origin URL"))?;

        let cache = self.services.cache.clone();
        let usable = cache.enabled() && !self.ctx.cache_disabled && request_cacheable(request);
        if !usable {
            self.ctx.cache_status = CacheStatus::Skipped;
            self.ctx.milestones.mark(Milestone::CacheLookupEnd);
            return Ok(());
        }
        let key = CacheKey::from_url(url);
        self.ctx.cache_key = Some(key.clone());
        if skip_lookup(request) {
            // Revalidation requested: go to the origin but still refresh the object.
            self.ctx.cache_status = CacheStatus::Skipped;
            self.ctx.milestones.mark(Milestone::CacheLookupEnd);
            return Ok(());
        }

        let timeout = self.config.timeouts.cache_open();
        let out = self
            .wait_watched(PendingKind::CacheOpen, timeout, async move { cache.lookup(&key).await })
            .await;
        self.ctx.milestones.mark(Milestone::CacheLookupEnd);

        match out {
            Awaited::Done(LookupOutcome::Hit(hit)) => {
                self.ctx.cache_status = CacheStatus::HitFresh;
                self.ctx.cache_hit = Some(hit);
            }
            Awaited::Done(LookupOutcome::Stale(hit)) => {
                self.ctx.cache_status = CacheStatus::HitStale;
                self.ctx.cache_hit = Some(hit);
            }
            Awaited::Done(LookupOutcome::Miss) => self.ctx.cache_status = CacheStatus::Miss,
            Awaited::Done(LookupOutcome::Skipped) => self.ctx.cache_status = CacheStatus::Skipped,
            Awaited::Done(LookupOutcome::Error(e)) => {
                tracing::warn!(error = %e, "Cache lookup failed, going to origin");
                self.ctx.cache_status = CacheStatus::Error;
            }
            Awaited::TimedOut => {
                tracing::debug!(timeout = ?timeout, "Cache open timed out, treating as miss");
                self.ctx.cache_status = CacheStatus::Miss;
            }
            Awaited::ClientAborted => return Err(self.client_abort()),
            Awaited::Cancelled => return Err(invariant("cache lookup cancelled")),
        }
        Ok(())
    }

    fn serve_from_cache(&mut self) -> Result<(), TxnError> {
        let hit = self
            .ctx
            .cache_hit
            .clone()
            .ok_or_else(|| invariant("serving from cache without a hit"))?;
        let (keep_alive, is_head) = match &self.ctx.client_request {
            Some(request) => (request.keep_alive(), request.method == Method::HEAD),
            None => return Err(invariant("serving from cache without a client request")),
        };
        let object = hit.object;

        // A stale serve after an origin failure leaves the origin unused.
        self.close_origin();

        let mut head = object.response.clone();
        strip_hop_by_hop(&mut head.headers);
        head.version = Version::HTTP_11;
        head.headers.remove(TRANSFER_ENCODING);
        head.headers.insert(CONTENT_LENGTH, HeaderValue::from(object.body.len()));
        set_age(&mut head.headers, object.age());
        append_via(&mut head.headers, Version::HTTP_11, &self.config.headers.via_name);
        set_connection(&mut head.headers, keep_alive);

        let body_sent = !is_head && !object.body.is_empty();
        if let Some(h) = self.cache_read_vc.take() {
            let _ = self.table.retire(h);
        }
        if body_sent {
            let source = Box::new(Cursor::new(object.body.clone()));
            let h = self
                .table
                .attach(ConnectionId::new(), VcKind::CacheRead, VcIo::Source(source))?;
            self.cache_read_vc = Some(h);
            self.ctx.response_framing = BodyFraming::Length(object.body.len() as u64);
        } else {
            self.ctx.response_framing = BodyFraming::Empty;
        }

        self.ctx.client_keep_alive = keep_alive;
        self.ctx.response_source = ResponseSource::Cache;
        self.ctx.client_response = Some(head);
        Ok(())
    }

    // Origin connection

    async fn connect_origin(&mut self, force_fresh: bool) -> Result<(), TxnError> {
        let (host, port) = self
            .ctx
            .origin_host_port()
            .ok_or_else(|| invariant("connect without an origin URL"))?;
        let request = self
            .ctx
            .client_request
            .as_ref()
            .ok_or_else(|| invariant("connect without a client request"))?;
        self.ctx.session_policy = SessionPolicy::evaluate(&self.config.session, &request.headers, self.ctx.private);
        self.ctx.private |= self.ctx.session_policy.private;

        let order = self.services.selector.order(&self.ctx.resolved, &self.services.health);
        if order.is_empty() {
            return Err(TxnError::origin(
                OriginFailure::AllDown,
                format!("every address of {host} is marked down"),
            ));
        }

        let schedule = RetrySchedule::from_config(&self.config.origin);
        let mut last_error = None;
        let mut session = None;
        for (attempt, addr) in (0..schedule.attempts()).zip(order.iter().cycle()) {
            if attempt > 0 {
                let delay = schedule.delay(attempt);
                tracing::debug!(attempt, origin = %addr, delay = ?delay, "Retrying origin connect");
                let out = self
                    .wait_watched(PendingKind::Retry, delay + Duration::from_secs(1), tokio::time::sleep(delay))
                    .await;
                if let Awaited::ClientAborted = out {
                    return Err(self.client_abort());
                }
            }
            match self.open_session(*addr, &host, port, force_fresh).await {
                Ok(s) => {
                    self.ctx.origin_addr = Some(*addr);
                    session = Some(s);
                    break;
                }
                Err(e) if e.is_origin_failure() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        let Some(mut session) = session else {
            return Err(last_error.unwrap_or_else(|| TxnError::origin(OriginFailure::Connect, host)));
        };

        if !self.ctx.session_policy.shareable() {
            self.services.pool.mark_private(&mut session);
        }
        self.ctx.session_reused = session.is_reused();
        let (meta, stream) = session.into_parts();
        let kind = if self.ctx.is_connect() {
            VcKind::RawServer
        } else {
            VcKind::Origin
        };
        let h = match self.table.attach(ConnectionId::new(), kind, VcIo::Stream(stream)) {
            Ok(h) => h,
            Err(e) => {
                self.services.pool.discard(meta);
                return Err(e.into());
            }
        };
        self.server_vc = Some(h);
        self.server_session = Some(meta);
        self.server_buffer.clear();
        self.ctx.origin_connected = true;
        self.ctx.milestones.mark(Milestone::ServerConnect);
        tracing::debug!(origin = ?self.ctx.origin_addr, reused = self.ctx.session_reused, "Origin connected");

        if !self.ctx.is_connect() && (self.ctx.server_request.is_none() || !force_fresh) {
            self.build_server_request()?;
        }
        Ok(())
    }

    async fn open_session(
        &mut self,
        addr: SocketAddr,
        host: &str,
        port: u16,
        force_fresh: bool,
    ) -> Result<PooledSession, TxnError> {
        let key = PoolKey::new(addr, host, port);
        let policy = if force_fresh {
            SessionPolicy {
                sharing: SharingMatch::None,
                ..self.ctx.session_policy
            }
        } else {
            self.ctx.session_policy
        };
        let pool = self.services.pool.clone();
        if let Some(bound) = self.bound_session.take() {
            if !force_fresh && bound.meta().key == key && bound.meta().keepalive {
                return Ok(pool.resume_private(bound));
            }
            pool.close(bound);
        }
        let mut ticket = None;
        let mut queue_tries = 0u32;

        loop {
            match pool.acquire(&key, &policy) {
                Acquire::Found(session) => return Ok(session),
                Acquire::NotFound(permit) => {
                    let connector = Arc::clone(&self.services.connector);
                    let options = ConnectOptions {
                        timeout: self.config.timeouts.connect(),
                        nodelay: self.config.listener.tcp_nodelay,
                    };
                    // The connector enforces its own timeout; the wait bound is a backstop.
                    let bound = options.timeout + Duration::from_secs(1);
                    let out = self
                        .wait_watched(PendingKind::Connect, bound, connector.connect(addr, &options))
                        .await;
                    return match out {
                        Awaited::Done(Ok(stream)) => {
                            self.services.health.mark_success(addr);
                            Ok(permit.into_session(stream))
                        }
                        Awaited::Done(Err(e)) => {
                            self.origin_failed(addr);
                            Err(TxnError::origin(OriginFailure::Connect, e.to_string()))
                        }
                        Awaited::TimedOut => {
                            self.origin_failed(addr);
                            Err(TxnError::origin(OriginFailure::Connect, format!("{addr}: timed out")))
                        }
                        Awaited::ClientAborted => Err(self.client_abort()),
                        Awaited::Cancelled => Err(invariant("connect cancelled")),
                    };
                }
                Acquire::Busy => {
                    if ticket.is_none() {
                        ticket = pool.enqueue(addr);
                        if ticket.is_none() {
                            return Err(TxnError::Throttle(PoolError::Throttled { addr }));
                        }
                    }
                    if queue_tries >= pool.queue_retries() {
                        return Err(TxnError::Throttle(PoolError::QueueExhausted {
                            addr,
                            retries: queue_tries,
                        }));
                    }
                    queue_tries += 1;
                    let delay = pool.queue_delay();
                    tracing::debug!(origin = %addr, attempt = queue_tries, delay = ?delay, "Waiting in admission queue");
                    let out = self
                        .wait_watched(PendingKind::Retry, delay + Duration::from_secs(1), tokio::time::sleep(delay))
                        .await;
                    if let Awaited::ClientAborted = out {
                        return Err(self.client_abort());
                    }
                }
            }
        }
    }

    fn origin_failed(&self, addr: SocketAddr) {
        if self.services.health.mark_failure(addr) {
            tracing::warn!(origin = %addr, "Origin address marked down");
        }
    }

    fn build_server_request(&mut self) -> Result<(), TxnError> {
        let client = self
            .ctx
            .client_request
            .as_ref()
            .ok_or_else(|| invariant("server request without a client request"))?;
        let url = self
            .ctx
            .origin_url
            .as_ref()
            .ok_or_else(|| invariant("server request without an origin URL"))?;

        let mut request = client.clone();
        let target = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        request.uri = target
            .parse::<Uri>()
            .map_err(|_| ParseError::InvalidTarget(target.clone()))?;
        request.version = Version::HTTP_11;

        strip_hop_by_hop(&mut request.headers);
        if !self.ctx.preserve_host {
            let host = url.host_str().unwrap_or_default();
            let authority = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            let value = HeaderValue::from_str(&authority).map_err(|_| ParseError::InvalidHeader)?;
            request.headers.insert(HOST, value);
        }
        append_via(&mut request.headers, client.version, &self.config.headers.via_name);
        if self.config.headers.forwarded_for {
            append_forwarded_for(&mut request.headers, self.ctx.client_addr.ip());
        }
        if self.config.headers.request_id {
            self.request_id = Some(ensure_request_id(&mut request.headers));
        }
        if self.ctx.request_framing == BodyFraming::Chunked {
            request
                .headers
                .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        }
        set_connection(&mut request.headers, true);
        self.ctx.server_request = Some(request);
        Ok(())
    }

    // Origin request and response

    async fn send_request(&mut self) -> Result<(), TxnError> {
        let mut retried = false;
        loop {
            match self.exchange().await {
                Ok(head) => {
                    if let Some(addr) = self.ctx.origin_addr {
                        self.services.health.mark_success(addr);
                    }
                    self.accept_response(head)?;
                    return Ok(());
                }
                Err(TxnError::OriginConnection {
                    failure: OriginFailure::Closed,
                    detail,
                }) if !retried && self.ctx.session_reused && !self.ctx.request_has_body() => {
                    tracing::debug!(detail = %detail, "Reused origin session failed, retrying on a fresh connection");
                    retried = true;
                    self.close_origin();
                    self.connect_origin(true).await?;
                }
                Err(e) => {
                    if let (Some(addr), true) = (self.ctx.origin_addr, e.is_origin_failure()) {
                        self.origin_failed(addr);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Write the request and body, then read the final response head.
    async fn exchange(&mut self) -> Result<ResponseHead, TxnError> {
        let server = self.server_vc.ok_or_else(|| invariant("send without an origin"))?;
        let encoded = self
            .ctx
            .server_request
            .as_ref()
            .ok_or_else(|| invariant("send without a server request"))?
            .encode_origin_form();

        let activity = self.config.timeouts.activity();
        let writer = self
            .table
            .get_mut(server)?
            .writer_mut()
            .ok_or_else(|| invariant("origin has no write side"))?;
        let written = tokio::time::timeout(activity, async {
            writer.write_all(&encoded).await?;
            writer.flush().await
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(TxnError::origin(OriginFailure::Closed, e.to_string())),
            Err(_) => return Err(TxnError::origin(OriginFailure::Timeout, "request write timed out")),
        }

        if self.ctx.request_has_body() {
            self.send_request_body(server).await?;
        }
        self.read_origin_head(server).await
    }

    async fn send_request_body(&mut self, server: VcHandle) -> Result<(), TxnError> {
        let client = self.client_vc.ok_or_else(|| invariant("request body without a client"))?;
        let (length, action) = match self.ctx.request_framing {
            BodyFraming::Length(n) => (BodyLength::Known(n), ChunkAction::PassThrough),
            BodyFraming::Chunked => (BodyLength::UntilEos, ChunkAction::PassThroughChunked),
            BodyFraming::Empty | BodyFraming::UntilClose => return Ok(()),
        };

        let producer = self.tunnel.add_producer(client, length, action);
        let preread = self.client_buffer.split().freeze();
        if !preread.is_empty() {
            self.tunnel.set_preread(producer, preread)?;
        }
        let consumer = self.tunnel.add_consumer(server, producer, FinishAction::Release)?;
        let report = self.tunnel.run(&mut self.table, Some(producer)).await;
        self.tunnel.reset(&mut self.table);
        let report = report?;

        let produced = report
            .producer(producer)
            .ok_or_else(|| invariant("request body producer missing from report"))?;
        self.client_buffer = BytesMut::from(&produced.leftover[..]);
        let written = report
            .consumer(consumer)
            .map(|c| c.outcome)
            .unwrap_or(ConsumerOutcome::Aborted);

        match produced.outcome {
            ProducerOutcome::Complete => {
                self.request_body_done = true;
                tracing::trace!(bytes = produced.bytes_read, "Request body forwarded");
                Ok(())
            }
            _ if !written.is_success() && written != ConsumerOutcome::Aborted => Err(TxnError::origin(
                OriginFailure::Closed,
                "origin stopped reading the request body",
            )),
            ProducerOutcome::Timeout => Err(self.client_abort()),
            other => {
                tracing::debug!(outcome = ?other, "Client request body incomplete");
                Err(self.client_abort())
            }
        }
    }

    async fn read_origin_head(&mut self, server: VcHandle) -> Result<ResponseHead, TxnError> {
        let limit = self.ctx.options.max_header_bytes;
        let timeout = self.config.timeouts.origin_response();
        loop {
            let mut reader = self.table.lend_read(server, VcHandler::OriginResponseHeader)?;
            let mut buffer = std::mem::take(&mut self.server_buffer);
            let out = self
                .wait_watched(
                    PendingKind::OriginResponse,
                    timeout,
                    read_head(&mut reader, &mut buffer, limit, parse_response),
                )
                .await;
            self.server_buffer = buffer;
            self.table.restore_read(server, reader)?;

            let head = match out {
                Awaited::Done(Ok(Some(head))) => head,
                Awaited::Done(Ok(None)) => {
                    return Err(TxnError::origin(OriginFailure::Closed, "closed before response header"))
                }
                Awaited::Done(Err(ParseError::Io(e))) => {
                    return Err(TxnError::origin(OriginFailure::Closed, e.to_string()))
                }
                Awaited::Done(Err(ParseError::Incomplete)) => {
                    return Err(TxnError::origin(OriginFailure::Closed, "closed mid response header"))
                }
                Awaited::Done(Err(e)) => return Err(TxnError::origin(OriginFailure::Parse, e.to_string())),
                Awaited::TimedOut => {
                    return Err(TxnError::origin(
                        OriginFailure::Timeout,
                        format!("no response header within {timeout:?}"),
                    ))
                }
                Awaited::ClientAborted => return Err(self.client_abort()),
                Awaited::Cancelled => return Err(invariant("origin read cancelled")),
            };
            self.ctx.milestones.mark_once(Milestone::FirstResponseByte);
            if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
                tracing::trace!(status = head.status.as_u16(), "Skipping interim response");
                continue;
            }
            return Ok(head);
        }
    }

    fn accept_response(&mut self, head: ResponseHead) -> Result<(), TxnError> {
        let method = self.ctx.method().cloned().unwrap_or(Method::GET);
        let framing = response_framing(&method, &head)
            .map_err(|e| TxnError::origin(OriginFailure::Parse, e.to_string()))?;
        if let Some(meta) = self.server_session.as_mut() {
            meta.keepalive = head.keep_alive() && framing.is_delimited();
        }
        tracing::debug!(status = head.status.as_u16(), framing = ?framing, "Origin response header");
        self.ctx.response_framing = framing;
        self.ctx.server_response = Some(head);
        Ok(())
    }

    fn follow_redirect(&mut self) -> Result<(), TxnError> {
        let target = self
            .ctx
            .redirect_target()
            .ok_or_else(|| invariant("redirect without a target"))?;
        self.ctx.redirect_count += 1;
        tracing::debug!(target = %target, count = self.ctx.redirect_count, "Following redirect");

        // Only a body-less response leaves the origin session reusable.
        self.origin_reusable = self.ctx.response_framing == BodyFraming::Empty;
        self.finish_origin();

        let ctx = &mut self.ctx;
        ctx.origin_url = Some(target);
        ctx.redirect_override = None;
        ctx.preserve_host = false;
        ctx.resolved.clear();
        ctx.origin_addr = None;
        ctx.origin_connected = false;
        ctx.cache_key = None;
        ctx.cache_hit = None;
        ctx.cache_status = CacheStatus::NotLooked;
        ctx.server_request = None;
        ctx.server_response = None;
        ctx.response_framing = BodyFraming::Empty;
        for point in HookPoint::PER_ORIGIN {
            ctx.hooks_done.remove(point);
        }
        ctx.state = TxnState::ResolvingDestination;
        self.services
            .registry
            .update(ctx.id, ctx.state, ctx.redirect_count);
        Ok(())
    }

    // Client response

    async fn prepare_response(&mut self) -> Result<(), TxnError> {
        let origin = self
            .ctx
            .server_response
            .clone()
            .ok_or_else(|| invariant("preparing a response without an origin response"))?;
        let request = self
            .ctx
            .client_request
            .as_ref()
            .ok_or_else(|| invariant("preparing a response without a client request"))?;
        let client_11 = request.version == Version::HTTP_11;
        let cacheable_request = request_cacheable(request);
        let mut keep_alive = request.keep_alive() && self.request_body_done;
        let transform = self.transform.is_some();
        let framing = self.ctx.response_framing;

        let mut head = origin.clone();
        strip_hop_by_hop(&mut head.headers);
        head.version = Version::HTTP_11;
        match (framing, transform) {
            (BodyFraming::Empty, _) => {}
            (_, true) => {
                head.headers.remove(CONTENT_LENGTH);
                if client_11 {
                    head.headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                } else {
                    keep_alive = false;
                }
            }
            (BodyFraming::Length(_), false) => {}
            (BodyFraming::Chunked, false) | (BodyFraming::UntilClose, false) => {
                if client_11 {
                    head.headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                } else {
                    keep_alive = false;
                }
            }
        }
        append_via(&mut head.headers, origin.version, &self.config.headers.via_name);
        set_connection(&mut head.headers, keep_alive);

        self.ctx.client_keep_alive = keep_alive;
        self.ctx.response_source = ResponseSource::Origin;
        self.ctx.client_response = Some(head);

        let key = match &self.ctx.cache_key {
            Some(key) if cacheable_request && !self.ctx.cache_disabled && !transform => key.clone(),
            _ => return Ok(()),
        };
        let Some(ttl) = response_ttl(&origin, self.services.cache.default_ttl()) else {
            return Ok(());
        };
        let cache = self.services.cache.clone();
        let timeout = self.config.timeouts.cache_open();
        let out = self
            .wait_watched(PendingKind::CacheOpen, timeout, async move { cache.open_writer(&key).await })
            .await;
        match out {
            Awaited::Done(Some(mut writer)) => {
                let mut stored = origin;
                strip_hop_by_hop(&mut stored.headers);
                stored.headers.remove(CONTENT_LENGTH);
                writer.set_response(&stored, ttl);
                self.cache_writer = Some(writer);
                Ok(())
            }
            Awaited::Done(None) | Awaited::TimedOut => Ok(()),
            Awaited::ClientAborted => Err(self.client_abort()),
            Awaited::Cancelled => Err(invariant("cache write open cancelled")),
        }
    }

    async fn transfer_response(&mut self) -> Result<(), TxnError> {
        let head = self
            .ctx
            .client_response
            .clone()
            .ok_or_else(|| invariant("transfer without a client response"))?;
        let client = self.client_vc.ok_or_else(|| invariant("transfer without a client"))?;

        self.write_client(client, head.encode()).await?;
        self.ctx.response_sent = true;
        metrics::record_response(head.status.as_u16());

        match self.ctx.response_source {
            ResponseSource::Cache => self.transfer_cached_body(client).await?,
            ResponseSource::Origin => self.transfer_origin_body(client).await?,
        }
        self.ctx.milestones.mark(Milestone::ResponseSent);
        Ok(())
    }

    async fn transfer_cached_body(&mut self, client: VcHandle) -> Result<(), TxnError> {
        let Some(source) = self.cache_read_vc else {
            return Ok(());
        };
        let BodyFraming::Length(len) = self.ctx.response_framing else {
            return Ok(());
        };
        let finish = self.client_finish();
        let producer = self.tunnel.add_producer(source, BodyLength::Known(len), ChunkAction::PassThrough);
        let consumer = self.tunnel.add_consumer(client, producer, finish)?;
        let report = self.tunnel.run(&mut self.table, Some(producer)).await;
        self.tunnel.reset(&mut self.table);
        let report = report?;

        let delivered = report.consumer(consumer).map(|c| c.outcome);
        if delivered != Some(ConsumerOutcome::Complete) {
            return Err(self.client_abort());
        }
        Ok(())
    }

    async fn transfer_origin_body(&mut self, client: VcHandle) -> Result<(), TxnError> {
        let framing = self.ctx.response_framing;
        if !framing.has_body() {
            if let Some(writer) = self.cache_writer.take() {
                let mut sink = writer.into_sink();
                if let Err(e) = sink.shutdown().await {
                    tracing::debug!(error = %e, "Empty cache object not stored");
                }
            }
            self.origin_reusable = self.server_buffer.is_empty();
            return Ok(());
        }

        let server = self.server_vc.ok_or_else(|| invariant("origin body without an origin"))?;
        let client_11 = self.ctx.client_request.as_ref().map(|r| r.version) == Some(Version::HTTP_11);
        let transform = self.transform.take();
        let (length, action) = match framing {
            BodyFraming::Length(n) => (BodyLength::Known(n), ChunkAction::PassThrough),
            BodyFraming::Chunked if client_11 && transform.is_none() => {
                (BodyLength::UntilEos, ChunkAction::PassThroughChunked)
            }
            BodyFraming::Chunked => (BodyLength::UntilEos, ChunkAction::Dechunk),
            BodyFraming::UntilClose if client_11 && transform.is_none() => {
                (BodyLength::UntilEos, ChunkAction::Chunk)
            }
            BodyFraming::UntilClose | BodyFraming::Empty => (BodyLength::UntilEos, ChunkAction::PassThrough),
        };

        let finish = self.client_finish();
        let origin = self.tunnel.add_producer(server, length, action);
        let preread = self.server_buffer.split().freeze();
        if !preread.is_empty() {
            self.tunnel.set_preread(origin, preread)?;
        }

        let client_consumer = match transform {
            Some(transform) => {
                let vc = TransformVc::new(transform, self.config.tunnel.buffer_bytes);
                let tvc = self
                    .table
                    .attach(ConnectionId::new(), VcKind::Transform, VcIo::Stream(boxed(vc)))?;
                let into_transform = self.tunnel.add_consumer(tvc, origin, FinishAction::Close)?;
                let out_action = if client_11 {
                    ChunkAction::Chunk
                } else {
                    ChunkAction::PassThrough
                };
                let transformed = self.tunnel.add_producer(tvc, BodyLength::UntilEos, out_action);
                self.tunnel.chain(into_transform, transformed)?;
                self.tunnel.add_consumer(client, transformed, finish)?
            }
            None => self.tunnel.add_consumer(client, origin, finish)?,
        };

        if let Some(writer) = self.cache_writer.take() {
            let cw = self
                .table
                .attach(ConnectionId::new(), VcKind::CacheWrite, VcIo::Sink(writer.into_sink()))?;
            self.tunnel.add_consumer(cw, origin, FinishAction::Close)?;
        }

        let report = self.tunnel.run(&mut self.table, None).await;
        self.tunnel.reset(&mut self.table);
        let report = report?;

        let produced = report
            .producer(origin)
            .ok_or_else(|| invariant("origin producer missing from report"))?;
        let delivered = report
            .consumer(client_consumer)
            .map(|c| c.outcome)
            .unwrap_or(ConsumerOutcome::Aborted);
        self.ctx.background_fill = report.background_fill();
        self.origin_reusable = produced.outcome == ProducerOutcome::Complete
            && framing.is_delimited()
            && produced.leftover.is_empty();

        tracing::debug!(
            origin_outcome = ?produced.outcome,
            client_outcome = ?delivered,
            bytes = produced.bytes_read,
            background_fill = self.ctx.background_fill,
            "Response body transferred"
        );

        if !produced.outcome.is_success() {
            self.ctx.client_keep_alive = false;
        }
        match delivered {
            ConsumerOutcome::Complete => Ok(()),
            ConsumerOutcome::WriteError(_) | ConsumerOutcome::Timeout => {
                if self.ctx.background_fill {
                    let result = if produced.outcome.is_success() {
                        "completed"
                    } else {
                        "aborted"
                    };
                    metrics::record_background_fill(result);
                }
                Err(self.client_abort())
            }
            ConsumerOutcome::Aborted => {
                tracing::warn!(origin_outcome = ?produced.outcome, "Origin body ended early, closing client");
                Ok(())
            }
        }
    }

    async fn blind_tunnel(&mut self) -> Result<(), TxnError> {
        let client = self.client_vc.ok_or_else(|| invariant("tunnel without a client"))?;
        let server = self.server_vc.ok_or_else(|| invariant("tunnel without a server"))?;

        let mut head = ResponseHead::new(StatusCode::OK);
        head.reason = Some("Connection Established".to_string());
        self.write_client(client, head.encode()).await?;
        self.ctx.response_sent = true;
        self.ctx.client_response = Some(head);
        self.ctx.client_keep_alive = false;
        metrics::record_response(200);

        let up = self.tunnel.add_producer(client, BodyLength::UntilEos, ChunkAction::PassThrough);
        let pending_up = self.client_buffer.split().freeze();
        if !pending_up.is_empty() {
            self.tunnel.set_preread(up, pending_up)?;
        }
        let up_consumer = self.tunnel.add_consumer(server, up, FinishAction::Close)?;
        let down = self.tunnel.add_producer(server, BodyLength::UntilEos, ChunkAction::PassThrough);
        let pending_down = self.server_buffer.split().freeze();
        if !pending_down.is_empty() {
            self.tunnel.set_preread(down, pending_down)?;
        }
        let down_consumer = self.tunnel.add_consumer(client, down, FinishAction::Close)?;
        self.tunnel.chain(up_consumer, down)?;
        self.tunnel.chain(down_consumer, up)?;

        let report = self.tunnel.run(&mut self.table, Some(up)).await;
        self.tunnel.reset(&mut self.table);
        let report = report?;
        tracing::debug!(
            client_bytes = report.producer(up).map(|p| p.bytes_read).unwrap_or(0),
            server_bytes = report.producer(down).map(|p| p.bytes_read).unwrap_or(0),
            "Blind tunnel closed"
        );
        self.ctx.milestones.mark(Milestone::ResponseSent);
        Ok(())
    }

    async fn send_error(&mut self, status: StatusCode) {
        let detail = match &self.ctx.error {
            Some(TxnError::OriginConnection { failure, .. }) => {
                format!("Could not reach the origin ({}).", failure.as_str())
            }
            Some(e) => e.to_string(),
            None => String::new(),
        };
        let (head, body) = error_response(status, &detail);
        self.ctx.error_sent = true;
        self.ctx.client_keep_alive = false;
        self.ctx.response_source = ResponseSource::Origin;
        metrics::record_response(status.as_u16());
        tracing::debug!(status = status.as_u16(), "Sending error response");

        if let Some(client) = self.client_vc {
            let mut out = BytesMut::with_capacity(256 + body.len());
            out.extend_from_slice(&head.encode());
            out.extend_from_slice(&body);
            if let Err(e) = self.write_client(client, out.freeze()).await {
                tracing::debug!(error = %e, "Error response not delivered");
            }
        }
        self.ctx.response_sent = true;
        self.ctx.client_response = Some(head);
        self.ctx.state = TxnState::Closing;
    }

    // Helpers

    async fn wait_watched<F>(&mut self, kind: PendingKind, timeout: Duration, fut: F) -> Awaited<F::Output>
    where
        F: std::future::Future,
    {
        let watch = match self.client_vc.and_then(|h| self.table.get_mut(h).ok()) {
            Some(entry) => {
                entry.set_handler(VcHandler::ClientAbortWatch);
                entry.reader_mut().map(|reader| ClientWatch {
                    reader,
                    buffer: &mut self.client_buffer,
                    half_closed: &mut self.client_half_closed,
                })
            }
            None => None,
        };
        let out = self.pending.wait(kind, timeout, fut, watch).await;
        if let Some(entry) = self.client_vc.and_then(|h| self.table.get_mut(h).ok()) {
            entry.set_handler(VcHandler::Idle);
        }
        out
    }

    async fn write_client(&mut self, client: VcHandle, data: Bytes) -> Result<(), TxnError> {
        let activity = self.config.timeouts.activity();
        let writer = self
            .table
            .get_mut(client)?
            .writer_mut()
            .ok_or_else(|| invariant("client has no write side"))?;
        let written = tokio::time::timeout(activity, async {
            writer.write_all(&data).await?;
            writer.flush().await
        })
        .await;
        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(self.client_abort()),
        }
    }

    fn client_finish(&self) -> FinishAction {
        if self.ctx.client_keep_alive {
            FinishAction::Release
        } else {
            FinishAction::Close
        }
    }

    fn client_abort(&mut self) -> TxnError {
        if !self.ctx.client_aborted {
            self.ctx.client_aborted = true;
            metrics::record_client_abort();
            tracing::debug!(state = %self.ctx.state, "Client aborted");
        }
        TxnError::ClientAbort
    }

    /// Close the origin connection without pooling it.
    fn close_origin(&mut self) {
        self.origin_reusable = false;
        self.finish_origin();
    }

    /// Pool the origin session when reusable, otherwise close it.
    fn finish_origin(&mut self) {
        let Some(h) = self.server_vc.take() else {
            return;
        };
        let entry = match self.table.release(h) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(vc = %h, error = %e, "Origin connection still owned at release");
                None
            }
        };
        let Some(meta) = self.server_session.take() else {
            return;
        };
        let reusable = self.origin_reusable && self.server_buffer.is_empty() && meta.keepalive;
        self.origin_reusable = false;
        self.server_buffer.clear();
        self.ctx.origin_connected = false;

        let pool = &self.services.pool;
        match entry.and_then(|e| e.into_stream()) {
            Some(stream) if reusable && self.ctx.private => {
                tracing::debug!(session = %meta.id, "Private origin session kept with the client");
                if let Some(old) = self.bound_session.replace(PooledSession::from_parts(meta, stream)) {
                    pool.close(old);
                }
            }
            Some(stream) if reusable => {
                pool.release(PooledSession::from_parts(meta, stream));
            }
            Some(stream) => pool.close(PooledSession::from_parts(meta, stream)),
            None => pool.discard(meta),
        }
    }

    async fn teardown(&mut self) -> Option<ClientConn> {
        if !self.terminate || self.torn_down {
            return None;
        }
        self.torn_down = true;
        self.ctx.state = TxnState::Closing;
        self.pending.cancel();

        if self.ctx.hooks_done.contains(HookPoint::TxnStart) {
            self.publish().await;
            let outcome = self.dispatcher.run(HookPoint::TxnClose, &self.shared).await;
            if outcome != HookOutcome::Continue {
                tracing::debug!(outcome = ?outcome, "Transaction close hook did not continue");
            }
        }

        self.tunnel.reset(&mut self.table);
        if let Some(h) = self.cache_read_vc.take() {
            let _ = self.table.retire(h);
        }
        self.finish_origin();
        let client = self.client_disposition();
        self.release_bound_session();
        let closed = self.table.retire_all();
        self.ctx.milestones.mark(Milestone::Close);

        let outcome = self.outcome();
        let registry = &self.services.registry;
        registry.remove(self.ctx.id);
        metrics::set_live_transactions(registry.len());
        let duration = self
            .ctx
            .milestones
            .between(Milestone::ClientAccept, Milestone::Close)
            .unwrap_or_default();
        metrics::record_transaction(outcome, duration);

        let status = self.ctx.client_response.as_ref().map(|r| r.status.as_u16());
        tracing::debug!(
            outcome,
            status = ?status,
            cache = self.ctx.cache_status.as_str(),
            redirects = self.ctx.redirect_count,
            request_id = ?self.request_id,
            keep_alive = client.is_some(),
            closed,
            milestones = %self.ctx.milestones.summary(),
            "Transaction closed"
        );
        client
    }

    fn client_disposition(&mut self) -> Option<ClientConn> {
        let h = self.client_vc.take()?;
        let keep = self.ctx.client_keep_alive
            && self.request_body_done
            && !self.client_half_closed
            && !self.ctx.client_aborted
            && !self.ctx.close_requested
            && !self.ctx.error_sent
            && self.ctx.response_sent
            && !matches!(self.ctx.error, Some(TxnError::InternalInvariantViolation(_)));
        if !keep {
            let _ = self.table.retire(h);
            return None;
        }
        let entry = self.table.release(h).ok()??;
        let stream = entry.into_stream()?;
        Some(ClientConn {
            id: self.client_id,
            stream,
            peer: self.ctx.client_addr,
            local: self.ctx.local_addr,
            buffered: std::mem::take(&mut self.client_buffer),
            transactions: self.client_transactions + 1,
            hooks: Arc::clone(&self.session_hooks),
            private: self.ctx.private,
            bound_session: self.bound_session.take(),
        })
    }

    /// Close the client-bound origin session once the client is gone.
    fn release_bound_session(&mut self) {
        if let Some(session) = self.bound_session.take() {
            tracing::debug!(session = %session.id(), "Closing private origin session with its client");
            self.services.pool.close(session);
        }
    }

    fn outcome(&self) -> &'static str {
        if let Some(e) = &self.ctx.error {
            return e.outcome();
        }
        if self.ctx.client_aborted {
            return "client_abort";
        }
        if self.ctx.close_requested {
            return "closed";
        }
        if self.ctx.served_stale {
            return "served_stale";
        }
        match self.ctx.cache_status {
            CacheStatus::HitFresh => "cache_hit",
            _ => "completed",
        }
    }
}

fn invariant(detail: &str) -> TxnError {
    TxnError::InternalInvariantViolation(detail.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn engine(transactions: u32) -> (TransactionEngine, DuplexStream) {
        let config = Arc::new(ProxyConfig::default());
        let services = Arc::new(EngineServices::from_config(&config));
        let shared = TxnShared::new(Duration::from_millis(1)).handle();
        let (ours, theirs) = tokio::io::duplex(4096);
        let mut client = ClientConn::new(
            ConnectionId::new(),
            boxed(ours),
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:8080".parse().unwrap(),
        );
        client.transactions = transactions;
        (TransactionEngine::new(services, TxnSnapshot::new(config), shared, client), theirs)
    }

    #[tokio::test]
    async fn keepalive_idle_time_is_not_part_of_the_transaction() {
        let (mut engine, mut peer) = engine(1);
        let waiting_since = std::time::Instant::now();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            peer.write_all(b"GET / HTTP/1.1\r\nHost: site.test\r\n\r\n")
                .await
                .unwrap();
            peer
        });

        assert!(matches!(engine.read_request().await, HeadRead::Request));
        let _peer = writer.await.unwrap();
        let started = engine.ctx.milestones.get(Milestone::ClientAccept).unwrap();
        assert!(started.duration_since(waiting_since) >= Duration::from_millis(150));
        let header_time = engine
            .ctx
            .milestones
            .between(Milestone::ClientAccept, Milestone::RequestRead)
            .unwrap();
        assert!(header_time < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn teardown_waits_for_termination_and_runs_once() {
        let (mut engine, _peer) = engine(0);
        assert!(engine.teardown().await.is_none());
        assert!(!engine.torn_down);
        assert_eq!(engine.table.live_count(), 1);

        engine.terminate = true;
        // No response went out, so the client is not kept.
        assert!(engine.teardown().await.is_none());
        assert!(engine.torn_down);
        assert_eq!(engine.table.live_count(), 0);
        assert_eq!(engine.ctx.state, TxnState::Closing);

        assert!(engine.teardown().await.is_none());
        assert_eq!(engine.table.live_count(), 0);
    }
}
