//! Extension hooks.
//!
//! # Data Flow
//! ```text
//! Engine reaches an extension point
//!     → dispatcher.rs run(point, txn handle)
//!         → global hooks (process-wide, ArcSwap snapshot)
//!         → session hooks (registered for the client connection)
//!         → transaction hooks (registered by earlier hooks through the handle)
//!     → each callout gets a TxnHandle and a Reenable
//!         → resume() continues, error() fails the transaction with 500
//!         → a Reenable dropped without either counts as an error
//!     → a close requested during a callout is applied once it finishes
//! ```
//!
//! # Design Decisions
//! - `Hook::invoke` is synchronous; a hook that needs to wait keeps the
//!   `Reenable` and finishes later from its own task
//! - A hook's owning lock is only held while `invoke` runs

pub mod dispatcher;
pub mod point;

pub use dispatcher::{HookDispatcher, HookOutcome};
pub use point::{HookPoint, HookSet};

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::txn::TxnHandle;

/// How a callout ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resume {
    Continue,
    Error,
}

/// Continuation signal handed to every callout.
#[derive(Debug)]
pub struct Reenable {
    tx: oneshot::Sender<Resume>,
}

impl Reenable {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Resume>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Let the transaction continue.
    pub fn resume(self) {
        let _ = self.tx.send(Resume::Continue);
    }

    /// Fail the transaction.
    pub fn error(self) {
        let _ = self.tx.send(Resume::Error);
    }
}

/// Arguments of one callout.
#[derive(Debug)]
pub struct HookCall {
    pub txn: TxnHandle,
    pub reenable: Reenable,
}

pub trait Hook: Send + Sync {
    fn invoke(&self, point: HookPoint, call: HookCall);
}

impl<F> Hook for F
where
    F: Fn(HookPoint, HookCall) + Send + Sync,
{
    fn invoke(&self, point: HookPoint, call: HookCall) {
        self(point, call)
    }
}

/// A hook plus the lock guarding its own state.
#[derive(Clone)]
pub struct HookRegistration {
    pub name: String,
    pub hook: Arc<dyn Hook>,
    pub lock: Option<Arc<Mutex<()>>>,
}

impl HookRegistration {
    pub fn new(name: impl Into<String>, hook: Arc<dyn Hook>) -> Self {
        Self {
            name: name.into(),
            hook,
            lock: None,
        }
    }

    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(HookPoint, HookCall) + Send + Sync + 'static,
    {
        Self::new(name, Arc::new(f))
    }

    /// Callouts wait while `lock` is held elsewhere.
    pub fn with_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.lock = Some(lock);
        self
    }
}

impl std::fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistration")
            .field("name", &self.name)
            .field("locked", &self.lock.is_some())
            .finish()
    }
}

/// Ordered hooks per extension point.
#[derive(Debug, Clone)]
pub struct HookChain {
    points: [Vec<HookRegistration>; HookPoint::COUNT],
}

impl Default for HookChain {
    fn default() -> Self {
        Self {
            points: std::array::from_fn(|_| Vec::new()),
        }
    }
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, point: HookPoint, registration: HookRegistration) {
        self.points[point.index()].push(registration);
    }

    pub fn get(&self, point: HookPoint) -> &[HookRegistration] {
        &self.points[point.index()]
    }

    pub fn len(&self) -> usize {
        self.points.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hooks registered for one client connection.
pub type SessionHooks = Arc<Mutex<HookChain>>;

/// Process-wide hooks. Registration swaps in a new chain; running
/// transactions keep the snapshot they started with.
#[derive(Debug, Default)]
pub struct GlobalHooks {
    chain: ArcSwap<HookChain>,
}

impl GlobalHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, point: HookPoint, registration: HookRegistration) {
        tracing::info!(point = %point, hook = %registration.name, "Global hook registered");
        self.chain.rcu(|current| {
            let mut next = HookChain::clone(current);
            next.add(point, registration.clone());
            next
        });
    }

    pub fn snapshot(&self) -> Arc<HookChain> {
        self.chain.load_full()
    }

    pub fn len(&self) -> usize {
        self.chain.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> HookRegistration {
        HookRegistration::from_fn("noop", |_, call: HookCall| call.reenable.resume())
    }

    #[test]
    fn chain_keeps_registration_order() {
        let mut chain = HookChain::new();
        chain.add(HookPoint::PreResolve, HookRegistration { name: "a".into(), ..noop() });
        chain.add(HookPoint::PreResolve, HookRegistration { name: "b".into(), ..noop() });
        chain.add(HookPoint::TxnClose, noop());

        let names: Vec<_> = chain
            .get(HookPoint::PreResolve)
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(chain.len(), 3);
        assert!(chain.get(HookPoint::OsResolve).is_empty());
    }

    #[test]
    fn global_registration_does_not_touch_snapshots() {
        let global = GlobalHooks::new();
        let before = global.snapshot();
        global.register(HookPoint::TxnStart, noop());
        assert!(before.is_empty());
        assert_eq!(global.snapshot().get(HookPoint::TxnStart).len(), 1);
    }
}
