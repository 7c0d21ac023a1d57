//! Transaction state shared with hooks.
//!
//! The engine owns the transaction. Hooks see it through a `TxnHandle`:
//! before each callout the engine publishes the heads into `SharedState`,
//! and afterwards takes back whatever the hooks changed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use url::Url;

use crate::hooks::HookChain;
use crate::http::{RequestHead, ResponseHead};
use crate::txn::transform::BodyTransform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TxnId(u64);

impl TxnId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Callout bookkeeping of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalloutState {
    #[default]
    None,
    InCallout,
    /// Close requested while a hook held the transaction.
    DeferredClose,
    /// Error reported while a hook held the transaction.
    DeferredError,
}

/// Fields hooks may read and change.
#[derive(Default)]
pub struct SharedState {
    pub client_request: Option<RequestHead>,
    pub server_request: Option<RequestHead>,
    pub server_response: Option<ResponseHead>,
    pub client_response: Option<ResponseHead>,
    /// Follow a redirect to this URL regardless of the response status.
    pub redirect_override: Option<Url>,
    /// Rewrites the response body on its way to the client.
    pub transform: Option<Box<dyn BodyTransform>>,
    /// Never share the origin session of this transaction.
    pub private: bool,
    pub cache_disabled: bool,
    /// Redirects followed so far. Changing it has no effect.
    pub redirect_count: u32,
    /// Hooks for the rest of this transaction.
    pub hooks: HookChain,
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("client_request", &self.client_request)
            .field("server_request", &self.server_request)
            .field("server_response", &self.server_response)
            .field("client_response", &self.client_response)
            .field("redirect_override", &self.redirect_override)
            .field("transform", &self.transform.is_some())
            .field("private", &self.private)
            .field("cache_disabled", &self.cache_disabled)
            .field("redirect_count", &self.redirect_count)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

pub struct TxnShared {
    id: TxnId,
    state: Mutex<SharedState>,
    callout: Mutex<CalloutState>,
    close_requested: AtomicBool,
    error_reported: AtomicBool,
    lock_retry: Duration,
}

impl TxnShared {
    pub fn new(lock_retry: Duration) -> Self {
        Self {
            id: TxnId::next(),
            state: Mutex::new(SharedState::default()),
            callout: Mutex::new(CalloutState::None),
            close_requested: AtomicBool::new(false),
            error_reported: AtomicBool::new(false),
            lock_retry,
        }
    }

    pub fn handle(self) -> TxnHandle {
        TxnHandle(Arc::new(self))
    }
}

/// Shared, cloneable reference to a live transaction.
#[derive(Clone)]
pub struct TxnHandle(Arc<TxnShared>);

impl std::fmt::Debug for TxnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TxnHandle").field(&self.0.id).finish()
    }
}

impl TxnHandle {
    pub fn id(&self) -> TxnId {
        self.0.id
    }

    /// Run `f` under the transaction lock if it is free right now.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut SharedState) -> R) -> Option<R> {
        let mut state = self.0.state.try_lock()?;
        Some(f(&mut state))
    }

    /// Run `f` under the transaction lock, retrying after a fixed delay
    /// while someone else holds it.
    pub async fn with<R>(&self, f: impl FnOnce(&mut SharedState) -> R) -> R {
        loop {
            if let Some(mut state) = self.0.state.try_lock() {
                return f(&mut state);
            }
            tokio::time::sleep(self.0.lock_retry).await;
        }
    }

    /// Ask the engine to close the transaction. Inside a callout the close
    /// waits until the callout finishes.
    pub fn request_close(&self) {
        let mut callout = self.0.callout.lock();
        match *callout {
            CalloutState::InCallout | CalloutState::DeferredError => {
                *callout = CalloutState::DeferredClose
            }
            CalloutState::DeferredClose => {}
            CalloutState::None => self.0.close_requested.store(true, Ordering::Release),
        }
    }

    /// Fail the transaction from outside the callout that owns it.
    pub fn report_error(&self) {
        let mut callout = self.0.callout.lock();
        match *callout {
            CalloutState::InCallout => *callout = CalloutState::DeferredError,
            CalloutState::DeferredClose | CalloutState::DeferredError => {}
            CalloutState::None => self.0.error_reported.store(true, Ordering::Release),
        }
    }

    pub fn close_requested(&self) -> bool {
        self.0.close_requested.load(Ordering::Acquire)
    }

    pub fn error_reported(&self) -> bool {
        self.0.error_reported.load(Ordering::Acquire)
    }

    pub fn callout_state(&self) -> CalloutState {
        *self.0.callout.lock()
    }

    pub(crate) fn begin_callout(&self) {
        *self.0.callout.lock() = CalloutState::InCallout;
    }

    /// Leave the callout, returning what was deferred during it.
    pub(crate) fn end_callout(&self) -> CalloutState {
        std::mem::take(&mut *self.0.callout.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Uri};

    fn handle() -> TxnHandle {
        TxnShared::new(Duration::from_millis(1)).handle()
    }

    #[test]
    fn ids_increase() {
        let a = TxnId::next();
        let b = TxnId::next();
        assert!(b > a);
        assert!(a.to_string().starts_with("txn-"));
    }

    #[test]
    fn try_with_fails_while_locked() {
        let txn = handle();
        let clone = txn.clone();
        txn.try_with(|_| {
            assert!(clone.try_with(|_| ()).is_none());
        })
        .unwrap();
        assert!(clone.try_with(|_| ()).is_some());
    }

    #[tokio::test]
    async fn with_waits_for_the_lock() {
        let txn = handle();
        let holder = txn.clone();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let guard_task = std::thread::spawn(move || {
            let mut state = holder.0.state.lock();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(20));
            state.private = true;
        });
        locked_rx.recv().unwrap();
        let private = txn.with(|s| s.private).await;
        guard_task.join().unwrap();
        assert!(private);
    }

    #[test]
    fn heads_are_shared_between_clones() {
        let txn = handle();
        let other = txn.clone();
        txn.try_with(|s| s.client_request = Some(RequestHead::new(Method::GET, Uri::from_static("/"))))
            .unwrap();
        let seen = other
            .try_with(|s| s.client_request.as_ref().map(|r| r.method.clone()))
            .unwrap();
        assert_eq!(seen, Some(Method::GET));
    }

    #[test]
    fn close_outside_callout_is_immediate() {
        let txn = handle();
        txn.request_close();
        assert!(txn.close_requested());

        let txn = handle();
        txn.begin_callout();
        txn.request_close();
        assert!(!txn.close_requested());
        assert_eq!(txn.end_callout(), CalloutState::DeferredClose);
        assert_eq!(txn.callout_state(), CalloutState::None);
    }

    #[test]
    fn error_during_callout_is_deferred() {
        let txn = handle();
        txn.begin_callout();
        txn.report_error();
        assert!(!txn.error_reported());
        assert_eq!(txn.end_callout(), CalloutState::DeferredError);
    }
}
