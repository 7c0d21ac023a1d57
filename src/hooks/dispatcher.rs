//! Walks the hooks of one extension point.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::HookConfig;
use crate::hooks::{
    GlobalHooks, HookCall, HookPoint, HookRegistration, Reenable, Resume, SessionHooks,
};
use crate::observability::metrics::record_hook_callout;
use crate::txn::{CalloutState, TxnHandle};

/// Result of running every hook at one point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Continue,
    /// A hook failed, timed out, or dropped its `Reenable`.
    Error { hook: String },
    /// A close was requested during a callout.
    Close,
}

#[derive(Clone)]
pub struct HookDispatcher {
    global: Arc<GlobalHooks>,
    session: SessionHooks,
    callout_timeout: Duration,
    lock_retry: Duration,
}

impl std::fmt::Debug for HookDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookDispatcher")
            .field("callout_timeout", &self.callout_timeout)
            .field("lock_retry", &self.lock_retry)
            .finish_non_exhaustive()
    }
}

impl HookDispatcher {
    pub fn new(global: Arc<GlobalHooks>, session: SessionHooks, config: &HookConfig) -> Self {
        Self {
            global,
            session,
            callout_timeout: Duration::from_secs(config.callout_timeout_secs),
            lock_retry: Duration::from_millis(config.lock_retry_ms),
        }
    }

    pub fn with_timeouts(mut self, callout_timeout: Duration, lock_retry: Duration) -> Self {
        self.callout_timeout = callout_timeout;
        self.lock_retry = lock_retry;
        self
    }

    /// Global, then session, then transaction hooks. The transaction chain
    /// is read after the others so hooks registered by them at this same
    /// point still run.
    pub async fn run(&self, point: HookPoint, txn: &TxnHandle) -> HookOutcome {
        let global = self.global.snapshot();
        let session = self.session.lock().get(point).to_vec();

        for registration in global.get(point).iter().chain(session.iter()) {
            let outcome = self.callout(point, registration, txn).await;
            if outcome != HookOutcome::Continue {
                return outcome;
            }
        }

        let local = txn.with(|state| state.hooks.get(point).to_vec()).await;
        for registration in &local {
            let outcome = self.callout(point, registration, txn).await;
            if outcome != HookOutcome::Continue {
                return outcome;
            }
        }
        HookOutcome::Continue
    }

    async fn callout(
        &self,
        point: HookPoint,
        registration: &HookRegistration,
        txn: &TxnHandle,
    ) -> HookOutcome {
        let deadline = Instant::now() + self.callout_timeout;
        let (reenable, mut rx) = Reenable::new();
        let mut reenable = Some(reenable);

        while !try_invoke(point, registration, txn, &mut reenable) {
            if Instant::now() >= deadline {
                tracing::warn!(point = %point, hook = %registration.name, "Hook lock stayed busy past callout timeout");
                record_hook_callout(point.as_str(), "timeout");
                return HookOutcome::Error {
                    hook: registration.name.clone(),
                };
            }
            tokio::time::sleep(self.lock_retry).await;
        }

        let (resume, label) = match rx.try_recv() {
            Ok(resume) => (Some(resume), "continue"),
            Err(tokio::sync::oneshot::error::TryRecvError::Closed) => (None, "error"),
            Err(tokio::sync::oneshot::error::TryRecvError::Empty) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, rx).await {
                    Ok(Ok(resume)) => (Some(resume), "deferred"),
                    Ok(Err(_)) => (None, "error"),
                    Err(_) => {
                        tracing::warn!(point = %point, hook = %registration.name, timeout = ?self.callout_timeout, "Hook callout timed out");
                        (None, "timeout")
                    }
                }
            }
        };

        let state = txn.end_callout();
        let outcome = match (resume, state) {
            (_, CalloutState::DeferredClose) => HookOutcome::Close,
            (Some(Resume::Continue), CalloutState::DeferredError) | (Some(Resume::Error), _) | (None, _) => {
                HookOutcome::Error {
                    hook: registration.name.clone(),
                }
            }
            (Some(Resume::Continue), _) => HookOutcome::Continue,
        };

        let label = match &outcome {
            HookOutcome::Close => "close",
            HookOutcome::Error { .. } if label == "continue" || label == "deferred" => "error",
            _ => label,
        };
        record_hook_callout(point.as_str(), label);
        tracing::debug!(point = %point, hook = %registration.name, outcome = label, "Hook callout finished");
        outcome
    }
}

/// Invoke under the hook's own lock. False when the lock is busy.
fn try_invoke(
    point: HookPoint,
    registration: &HookRegistration,
    txn: &TxnHandle,
    reenable: &mut Option<Reenable>,
) -> bool {
    let _guard = match &registration.lock {
        Some(lock) => match lock.try_lock() {
            Some(guard) => Some(guard),
            None => return false,
        },
        None => None,
    };
    let Some(reenable) = reenable.take() else {
        return true;
    };
    txn.begin_callout();
    registration.hook.invoke(
        point,
        HookCall {
            txn: txn.clone(),
            reenable,
        },
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookChain;
    use crate::txn::TxnShared;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher(global: Arc<GlobalHooks>, session: SessionHooks) -> HookDispatcher {
        HookDispatcher::new(global, session, &HookConfig::default())
            .with_timeouts(Duration::from_millis(200), Duration::from_millis(5))
    }

    fn txn() -> TxnHandle {
        TxnShared::new(Duration::from_millis(1)).handle()
    }

    fn counting(name: &str, hits: Arc<AtomicUsize>) -> HookRegistration {
        HookRegistration::from_fn(name.to_string(), move |_, call: HookCall| {
            hits.fetch_add(1, Ordering::SeqCst);
            call.reenable.resume();
        })
    }

    #[tokio::test]
    async fn runs_global_session_then_transaction_hooks() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let record = |tag: &'static str| {
            let order = Arc::clone(&order);
            HookRegistration::from_fn(tag, move |_, call: HookCall| {
                order.lock().push(tag);
                call.reenable.resume();
            })
        };

        let global = Arc::new(GlobalHooks::new());
        global.register(HookPoint::PreResolve, record("global"));
        let session: SessionHooks = Arc::new(Mutex::new(HookChain::new()));
        session.lock().add(HookPoint::PreResolve, record("session"));
        let txn = txn();
        txn.with(|s| s.hooks.add(HookPoint::PreResolve, record("txn"))).await;

        let outcome = dispatcher(global, session).run(HookPoint::PreResolve, &txn).await;
        assert_eq!(outcome, HookOutcome::Continue);
        assert_eq!(*order.lock(), vec!["global", "session", "txn"]);
    }

    #[tokio::test]
    async fn error_short_circuits_the_chain() {
        let hits = Arc::new(AtomicUsize::new(0));
        let global = Arc::new(GlobalHooks::new());
        global.register(
            HookPoint::ReadRequestHeaders,
            HookRegistration::from_fn("deny", |_, call: HookCall| call.reenable.error()),
        );
        global.register(HookPoint::ReadRequestHeaders, counting("after", Arc::clone(&hits)));

        let outcome = dispatcher(global, SessionHooks::default())
            .run(HookPoint::ReadRequestHeaders, &txn())
            .await;
        assert_eq!(outcome, HookOutcome::Error { hook: "deny".into() });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deferred_reenable_continues() {
        let global = Arc::new(GlobalHooks::new());
        global.register(
            HookPoint::SendRequestHeaders,
            HookRegistration::from_fn("later", |_, call: HookCall| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    call.reenable.resume();
                });
            }),
        );
        let outcome = dispatcher(global, SessionHooks::default())
            .run(HookPoint::SendRequestHeaders, &txn())
            .await;
        assert_eq!(outcome, HookOutcome::Continue);
    }

    #[tokio::test]
    async fn dropped_reenable_and_timeouts_are_errors() {
        let global = Arc::new(GlobalHooks::new());
        global.register(
            HookPoint::TxnStart,
            HookRegistration::from_fn("forgetful", |_, call: HookCall| drop(call)),
        );
        let outcome = dispatcher(Arc::clone(&global), SessionHooks::default())
            .run(HookPoint::TxnStart, &txn())
            .await;
        assert!(matches!(outcome, HookOutcome::Error { .. }));

        let stash = Arc::new(Mutex::new(Vec::new()));
        let keep = Arc::clone(&stash);
        let global = Arc::new(GlobalHooks::new());
        global.register(
            HookPoint::TxnStart,
            HookRegistration::from_fn("stuck", move |_, call: HookCall| keep.lock().push(call)),
        );
        let outcome = dispatcher(global, SessionHooks::default())
            .run(HookPoint::TxnStart, &txn())
            .await;
        assert!(matches!(outcome, HookOutcome::Error { .. }));
    }

    #[tokio::test]
    async fn close_during_callout_is_deferred() {
        let global = Arc::new(GlobalHooks::new());
        global.register(
            HookPoint::ReadResponseHeaders,
            HookRegistration::from_fn("closer", |_, call: HookCall| {
                call.txn.request_close();
                call.reenable.resume();
            }),
        );
        let txn = txn();
        let outcome = dispatcher(global, SessionHooks::default())
            .run(HookPoint::ReadResponseHeaders, &txn)
            .await;
        assert_eq!(outcome, HookOutcome::Close);
        assert!(!txn.close_requested());
    }

    #[tokio::test]
    async fn busy_owning_lock_is_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let lock = Arc::new(Mutex::new(()));
        let global = Arc::new(GlobalHooks::new());
        global.register(
            HookPoint::PostResolve,
            counting("locked", Arc::clone(&hits)).with_lock(Arc::clone(&lock)),
        );

        let held = lock.lock();
        let dispatcher = dispatcher(global, SessionHooks::default());
        let txn = txn();
        let run = tokio::spawn(async move { dispatcher.run(HookPoint::PostResolve, &txn).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        drop(held);

        assert_eq!(run.await.unwrap(), HookOutcome::Continue);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
