//! Transaction errors and the status of the response generated for them.

use http::StatusCode;
use thiserror::Error;

use crate::cache::CacheError;
use crate::hooks::HookPoint;
use crate::http::ParseError;
use crate::session::PoolError;
use crate::tunnel::TunnelError;
use crate::vc::VcTableError;

/// What went wrong talking to the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginFailure {
    Resolve,
    Connect,
    /// No response header within the origin response timeout.
    Timeout,
    /// Response header could not be parsed.
    Parse,
    /// Connection closed or reset before a response header.
    Closed,
    /// Every resolved address is marked down.
    AllDown,
}

impl OriginFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginFailure::Resolve => "resolve",
            OriginFailure::Connect => "connect",
            OriginFailure::Timeout => "timeout",
            OriginFailure::Parse => "parse",
            OriginFailure::Closed => "closed",
            OriginFailure::AllDown => "all_down",
        }
    }
}

#[derive(Debug, Error)]
pub enum TxnError {
    #[error("client aborted the transaction")]
    ClientAbort,

    #[error("origin {}: {detail}", failure.as_str())]
    OriginConnection {
        failure: OriginFailure,
        detail: String,
    },

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("throttled: {0}")]
    Throttle(#[from] PoolError),

    #[error("redirect limit of {limit} reached")]
    RedirectLimitExceeded { limit: u32 },

    #[error("internal invariant violated: {0}")]
    InternalInvariantViolation(String),

    #[error("hook {hook} failed at {point}")]
    Hook { point: HookPoint, hook: String },

    #[error("no remap rule matches the request")]
    RemapMiss,

    #[error("CONNECT is not allowed")]
    MethodNotAllowed,
}

impl TxnError {
    pub fn origin(failure: OriginFailure, detail: impl Into<String>) -> Self {
        TxnError::OriginConnection {
            failure,
            detail: detail.into(),
        }
    }

    /// Status of the generated error response.
    pub fn status(&self) -> StatusCode {
        match self {
            TxnError::Parse(e) => e.status(),
            TxnError::RemapMiss => StatusCode::NOT_FOUND,
            TxnError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            TxnError::OriginConnection { failure, .. } => match failure {
                OriginFailure::Timeout => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            },
            TxnError::Throttle(_) => StatusCode::SERVICE_UNAVAILABLE,
            TxnError::Hook { .. }
            | TxnError::Cache(_)
            | TxnError::InternalInvariantViolation(_)
            | TxnError::ClientAbort => StatusCode::INTERNAL_SERVER_ERROR,
            TxnError::RedirectLimitExceeded { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn is_origin_failure(&self) -> bool {
        matches!(self, TxnError::OriginConnection { .. })
    }

    /// Label for the transaction outcome metric.
    pub fn outcome(&self) -> &'static str {
        match self {
            TxnError::ClientAbort => "client_abort",
            TxnError::OriginConnection { .. } => "origin_error",
            TxnError::Parse(_) => "parse_error",
            TxnError::Cache(_) => "cache_error",
            TxnError::Throttle(_) => "throttled",
            TxnError::RedirectLimitExceeded { .. } => "redirect_limit",
            TxnError::InternalInvariantViolation(_) => "internal_error",
            TxnError::Hook { .. } => "hook_error",
            TxnError::RemapMiss => "remap_miss",
            TxnError::MethodNotAllowed => "method_not_allowed",
        }
    }
}

impl From<VcTableError> for TxnError {
    fn from(e: VcTableError) -> Self {
        TxnError::InternalInvariantViolation(e.to_string())
    }
}

impl From<TunnelError> for TxnError {
    fn from(e: TunnelError) -> Self {
        TxnError::InternalInvariantViolation(e.to_string())
    }
}
