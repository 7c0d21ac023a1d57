//! Transaction policy: decides the next step from the transaction context.
//!
//! # Data Flow
//! ```text
//! engine loop
//!     → policy.decide(&mut ctx)          (may advance ctx.state)
//!     → NextAction                       (hook, async phase, tunnel run)
//!     → engine performs it, records the result in ctx
//!     → back to decide until Done
//! ```
//!
//! # Design Decisions
//! - The policy never performs I/O; everything it needs is in the context
//! - Errors are an input: the policy chooses between serve-stale, an error
//!   response and an abrupt close

use http::StatusCode;

use crate::hooks::HookPoint;
use crate::txn::context::{CacheStatus, ResponseSource, TransactionContext, TxnState};
use crate::txn::error::TxnError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    ApiHook(HookPoint),
    /// Map the request to an origin URL.
    Remap,
    Resolve,
    LookupCache,
    /// Build the client response from the cached object.
    ServeFromCache,
    ConnectOrigin,
    /// Send the request (and body) and read the response header.
    SendRequest,
    FollowRedirect,
    /// Build the client response from the origin response.
    PrepareResponse,
    TransferResponse,
    BlindTunnel,
    SendError(StatusCode),
    Done,
}

pub trait TransactionPolicy: Send + Sync {
    fn decide(&self, ctx: &mut TransactionContext) -> NextAction;
}

/// Standard proxy flow: hooks at every phase boundary, cache before origin,
/// redirects followed up to the configured limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl DefaultPolicy {
    fn hook(ctx: &TransactionContext, point: HookPoint) -> Option<NextAction> {
        (!ctx.hooks_done.contains(point)).then_some(NextAction::ApiHook(point))
    }

    fn on_error(&self, ctx: &mut TransactionContext) -> NextAction {
        let Some(error) = ctx.error.as_ref() else {
            return NextAction::Done;
        };
        if ctx.response_sent {
            return NextAction::Done;
        }
        match error {
            TxnError::ClientAbort | TxnError::InternalInvariantViolation(_) => NextAction::Done,
            e if e.is_origin_failure() && ctx.cache_hit.is_some() && !ctx.served_stale => {
                tracing::warn!(txn_id = %ctx.id, error = %e, "Origin failed, serving stale object");
                ctx.served_stale = true;
                ctx.error = None;
                ctx.cache_status = CacheStatus::HitStale;
                ctx.client_response = None;
                ctx.state = TxnState::ServingFromCache;
                NextAction::ServeFromCache
            }
            e if !ctx.error_sent => NextAction::SendError(e.status()),
            _ => NextAction::Done,
        }
    }
}

impl TransactionPolicy for DefaultPolicy {
    fn decide(&self, ctx: &mut TransactionContext) -> NextAction {
        if ctx.close_requested || ctx.client_aborted {
            return NextAction::Done;
        }
        if ctx.error.is_some() {
            return self.on_error(ctx);
        }

        loop {
            match ctx.state {
                TxnState::ReadingClientHeaders => {
                    if let Some(hook) = Self::hook(ctx, HookPoint::TxnStart)
                        .or_else(|| Self::hook(ctx, HookPoint::ReadRequestHeaders))
                    {
                        return hook;
                    }
                    if ctx.origin_url.is_none() {
                        return NextAction::Remap;
                    }
                    ctx.state = TxnState::ResolvingDestination;
                }
                TxnState::ResolvingDestination => {
                    if let Some(hook) = Self::hook(ctx, HookPoint::PreResolve) {
                        return hook;
                    }
                    if ctx.resolved.is_empty() {
                        return NextAction::Resolve;
                    }
                    if let Some(hook) = Self::hook(ctx, HookPoint::OsResolve)
                        .or_else(|| Self::hook(ctx, HookPoint::PostResolve))
                    {
                        return hook;
                    }
                    ctx.state = if ctx.is_connect() {
                        TxnState::ConnectingOrigin
                    } else {
                        TxnState::CacheLookup
                    };
                }
                TxnState::CacheLookup => {
                    if ctx.cache_status == CacheStatus::NotLooked {
                        return NextAction::LookupCache;
                    }
                    if let Some(hook) = Self::hook(ctx, HookPoint::CacheLookupComplete) {
                        return hook;
                    }
                    ctx.state = if ctx.cache_status == CacheStatus::HitFresh {
                        TxnState::ServingFromCache
                    } else {
                        TxnState::ConnectingOrigin
                    };
                }
                TxnState::ServingFromCache => {
                    if let Some(hook) = Self::hook(ctx, HookPoint::ReadCacheHeaders) {
                        return hook;
                    }
                    if ctx.client_response.is_none() || ctx.response_source != ResponseSource::Cache {
                        return NextAction::ServeFromCache;
                    }
                    ctx.state = TxnState::SendingClientResponse;
                }
                TxnState::ConnectingOrigin => {
                    if !ctx.origin_connected {
                        return NextAction::ConnectOrigin;
                    }
                    if ctx.is_connect() {
                        ctx.state = TxnState::Tunneling;
                        return NextAction::BlindTunnel;
                    }
                    ctx.state = TxnState::SendingOriginRequest;
                }
                TxnState::SendingOriginRequest => {
                    if let Some(hook) = Self::hook(ctx, HookPoint::SendRequestHeaders) {
                        return hook;
                    }
                    if ctx.server_response.is_none() {
                        return NextAction::SendRequest;
                    }
                    ctx.state = TxnState::ReadingOriginHeaders;
                }
                TxnState::ReadingOriginHeaders => {
                    if let Some(hook) = Self::hook(ctx, HookPoint::ReadResponseHeaders) {
                        return hook;
                    }
                    if ctx.redirect_target().is_some() && !ctx.request_has_body() {
                        if ctx.redirect_count < ctx.options.redirect_limit {
                            return NextAction::FollowRedirect;
                        }
                        tracing::debug!(
                            txn_id = %ctx.id,
                            limit = ctx.options.redirect_limit,
                            "Redirect limit reached, returning response as is"
                        );
                    }
                    ctx.state = TxnState::SendingClientResponse;
                }
                TxnState::SendingClientResponse => {
                    if ctx.client_response.is_none() {
                        return NextAction::PrepareResponse;
                    }
                    if let Some(hook) = Self::hook(ctx, HookPoint::SendResponseHeaders) {
                        return hook;
                    }
                    if !ctx.response_sent {
                        return NextAction::TransferResponse;
                    }
                    ctx.state = TxnState::TransferringBody;
                }
                TxnState::TransferringBody | TxnState::Tunneling => {
                    ctx.state = TxnState::Closing;
                }
                TxnState::Closing => return NextAction::Done,
            }
        }
    }
}
