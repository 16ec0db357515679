//! Lifecycle callbacks
//!
//! Callbacks are tagged with a [`CallbackMode`] built from four independent
//! parts:
//!
//! - [`Phase`]: fire before or after the status change.
//! - [`Outcome`]: which status change (commit, rollback, save) or any of them.
//! - [`Relative`]: resolved against the transaction itself or against its
//!   master. Master-relative callbacks of a nested transaction fire when the
//!   master finishes, whatever happened to the nested transaction.
//! - [`Deferral`]: master-relative "after" callbacks can be handed to a worker
//!   thread, the end of the enclosing request, or process shutdown.
//!
//! Every registered entry fires at most once.

use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};
use tracing::Span;

use crate::error::{TransactionError, TransactionResult};
use crate::status::TransactionStatus;
use crate::transaction::Transaction;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Phase {
    Before,
    After,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Outcome {
    Any,
    Commit,
    Rollback,
    Save,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Relative {
    Local,
    Master,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Deferral {
    Immediate,
    /// Run on the rayon global thread pool.
    InWorker,
    /// Run when the registry's controller-deferred queue is drained.
    AfterController,
    /// Run when the registry shuts down.
    InShutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackMode {
    pub phase: Phase,
    pub outcome: Outcome,
    pub relative: Relative,
    pub deferral: Deferral,
}

impl CallbackMode {
    pub const AFTER: Self = Self::local(Phase::After, Outcome::Any);
    pub const AFTER_COMMIT: Self = Self::local(Phase::After, Outcome::Commit);
    pub const AFTER_MASTER: Self = Self::master(Phase::After, Outcome::Any);
    pub const AFTER_MASTER_COMMIT: Self = Self::master(Phase::After, Outcome::Commit);
    pub const AFTER_MASTER_ROLLBACK: Self = Self::master(Phase::After, Outcome::Rollback);
    pub const AFTER_ROLLBACK: Self = Self::local(Phase::After, Outcome::Rollback);
    pub const AFTER_SAVE: Self = Self::local(Phase::After, Outcome::Save);
    pub const BEFORE: Self = Self::local(Phase::Before, Outcome::Any);
    pub const BEFORE_COMMIT: Self = Self::local(Phase::Before, Outcome::Commit);
    pub const BEFORE_MASTER: Self = Self::master(Phase::Before, Outcome::Any);
    pub const BEFORE_MASTER_COMMIT: Self = Self::master(Phase::Before, Outcome::Commit);
    pub const BEFORE_MASTER_ROLLBACK: Self = Self::master(Phase::Before, Outcome::Rollback);
    pub const BEFORE_ROLLBACK: Self = Self::local(Phase::Before, Outcome::Rollback);
    pub const BEFORE_SAVE: Self = Self::local(Phase::Before, Outcome::Save);

    pub const fn new(phase: Phase, outcome: Outcome, relative: Relative) -> Self {
        Self {
            phase,
            outcome,
            relative,
            deferral: Deferral::Immediate,
        }
    }

    const fn local(phase: Phase, outcome: Outcome) -> Self {
        Self::new(phase, outcome, Relative::Local)
    }

    const fn master(phase: Phase, outcome: Outcome) -> Self {
        Self::new(phase, outcome, Relative::Master)
    }

    pub const fn deferred(self, deferral: Deferral) -> Self {
        Self { deferral, ..self }
    }

    pub const fn in_worker(self) -> Self {
        self.deferred(Deferral::InWorker)
    }

    pub const fn after_controller(self) -> Self {
        self.deferred(Deferral::AfterController)
    }

    pub const fn in_shutdown(self) -> Self {
        self.deferred(Deferral::InShutdown)
    }

    pub fn is_deferred(&self) -> bool {
        self.deferral != Deferral::Immediate
    }

    /// Rejects combinations that can never fire: masters never save, and only
    /// master-relative "after" callbacks can be deferred.
    pub fn validate(&self) -> TransactionResult<()> {
        let valid = match (self.relative, self.outcome) {
            (Relative::Master, Outcome::Save) => false,
            _ => !self.is_deferred() || (self.phase, self.relative) == (Phase::After, Relative::Master),
        };
        if valid {
            Ok(())
        } else {
            Err(TransactionError::InvalidMode(*self))
        }
    }

    /// Returns true if a transaction currently in `local` status, whose master
    /// is in `master` status, can still reach the status change this mode
    /// waits for.
    pub fn reachable_from(&self, local: TransactionStatus, master: TransactionStatus) -> bool {
        match self.relative {
            Relative::Local => match self.outcome {
                Outcome::Save => local.can_transition_to(TransactionStatus::Saved),
                Outcome::Commit => local.can_transition_to(TransactionStatus::Committed),
                Outcome::Rollback => local.can_transition_to(TransactionStatus::RolledBack),
                Outcome::Any => local.is_open(),
            },
            Relative::Master => master.is_open(),
        }
    }
}

impl fmt::Display for CallbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.phase)?;
        if self.relative == Relative::Master {
            write!(f, "-master")?;
        }
        if self.outcome != Outcome::Any {
            write!(f, "-{}", self.outcome)?;
        }
        if self.is_deferred() {
            write!(f, " ({})", self.deferral)?;
        }
        Ok(())
    }
}

pub type CallbackFn = dyn Fn(&Transaction) + Send + Sync;

/// A shareable lifecycle callback.
#[derive(Clone)]
pub struct Callback(Arc<CallbackFn>);

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Transaction) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, txn: &Transaction) {
        (self.0)(txn)
    }

    /// Two callbacks are the same if they share the same allocation.
    pub fn ptr_eq(&self, other: &Callback) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Callback").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackOptions {
    /// Re-enter the tracing span that was current at registration time when
    /// the callback runs.
    pub preserve_context: bool,
    /// Do not register the same callback twice for the same mode.
    pub only_once: bool,
}

impl Default for CallbackOptions {
    fn default() -> Self {
        Self {
            preserve_context: true,
            only_once: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle {
    id: u64,
    mode: CallbackMode,
}

impl CallbackHandle {
    pub fn mode(&self) -> CallbackMode {
        self.mode
    }
}

struct CallbackEntry {
    id: u64,
    callback: Callback,
    mode: CallbackMode,
    executed: bool,
    span: Option<Span>,
    location: &'static Location<'static>,
}

/// A callback that has been claimed for execution.
pub(crate) struct PendingCallback {
    callback: Callback,
    mode: CallbackMode,
    span: Option<Span>,
    location: &'static Location<'static>,
}

impl PendingCallback {
    pub(crate) fn mode(&self) -> CallbackMode {
        self.mode
    }

    pub(crate) fn invoke(&self, txn: &Transaction) {
        tracing::trace!(
            txn = %txn.id(),
            mode = %self.mode,
            registered_at = %self.location,
            "running callback"
        );
        match &self.span {
            Some(span) => span.in_scope(|| self.callback.call(txn)),
            None => self.callback.call(txn),
        }
    }
}

/// Per-transaction store of lifecycle callbacks.
#[derive(Default)]
pub struct CallbackScheduler {
    entries: Mutex<Vec<CallbackEntry>>,
    next_id: AtomicU64,
}

impl CallbackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for `mode`. Reachability is checked by the owning
    /// transaction, this only stores the entry.
    #[track_caller]
    pub(crate) fn add(
        &self,
        callback: Callback,
        mode: CallbackMode,
        options: CallbackOptions,
    ) -> CallbackHandle {
        let mut entries = self.entries.lock();
        if options.only_once {
            if let Some(existing) = entries
                .iter()
                .find(|e| e.mode == mode && e.callback.ptr_eq(&callback))
            {
                return CallbackHandle {
                    id: existing.id,
                    mode,
                };
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.push(CallbackEntry {
            id,
            callback,
            mode,
            executed: false,
            span: options.preserve_context.then(Span::current),
            location: Location::caller(),
        });
        CallbackHandle { id, mode }
    }

    /// Returns the callbacks registered for `mode` that have not run yet.
    pub fn get(&self, mode: CallbackMode) -> Vec<Callback> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.mode == mode && !e.executed)
            .map(|e| e.callback.clone())
            .collect()
    }

    pub fn remove(&self, handle: CallbackHandle) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != handle.id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns where the callback behind `handle` was registered.
    pub fn registered_at(&self, handle: CallbackHandle) -> Option<&'static Location<'static>> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.id == handle.id)
            .map(|e| e.location)
    }

    /// Claims every pending entry of `mode`, marking it executed.
    pub(crate) fn take_pending(&self, mode: CallbackMode) -> Vec<PendingCallback> {
        self.entries
            .lock()
            .iter_mut()
            .filter(|e| e.mode == mode && !e.executed)
            .map(|e| {
                e.executed = true;
                PendingCallback {
                    callback: e.callback.clone(),
                    mode: e.mode,
                    span: e.span.clone(),
                    location: e.location,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;
    use crate::status::TransactionStatus::*;

    fn noop() -> Callback {
        Callback::new(|_| {})
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(CallbackMode::BEFORE.to_string(), "before");
        assert_eq!(CallbackMode::AFTER_COMMIT.to_string(), "after-commit");
        assert_eq!(
            CallbackMode::AFTER_MASTER_COMMIT.in_worker().to_string(),
            "after-master-commit (in-worker)"
        );
    }

    #[test]
    fn test_mode_validation() {
        assert!(CallbackMode::AFTER_MASTER.in_shutdown().validate().is_ok());
        assert!(CallbackMode::AFTER_COMMIT.in_worker().validate().is_err());
        assert!(CallbackMode::BEFORE_MASTER.after_controller().validate().is_err());
        assert!(
            CallbackMode::new(Phase::After, Outcome::Save, Relative::Master)
                .validate()
                .is_err()
        );
        for phase in Phase::iter() {
            for outcome in Outcome::iter() {
                assert!(CallbackMode::new(phase, outcome, Relative::Local).validate().is_ok());
            }
        }
    }

    #[test]
    fn test_reachability() {
        assert!(CallbackMode::AFTER_SAVE.reachable_from(Started, Started));
        assert!(!CallbackMode::AFTER_SAVE.reachable_from(Saved, Started));
        assert!(CallbackMode::AFTER_COMMIT.reachable_from(Saved, Started));
        assert!(!CallbackMode::AFTER_COMMIT.reachable_from(RolledBack, Started));
        assert!(!CallbackMode::AFTER.reachable_from(Committed, Committed));
        // master-relative modes only care about the master
        assert!(CallbackMode::AFTER_MASTER_COMMIT.reachable_from(RolledBack, Started));
        assert!(!CallbackMode::AFTER_MASTER.reachable_from(Started, RolledBack));
    }

    #[test]
    fn test_take_pending_is_at_most_once() {
        let scheduler = CallbackScheduler::new();
        scheduler.add(noop(), CallbackMode::AFTER_COMMIT, CallbackOptions::default());
        scheduler.add(noop(), CallbackMode::AFTER, CallbackOptions::default());

        assert_eq!(scheduler.take_pending(CallbackMode::AFTER_COMMIT).len(), 1);
        assert!(scheduler.take_pending(CallbackMode::AFTER_COMMIT).is_empty());
        assert!(scheduler.get(CallbackMode::AFTER_COMMIT).is_empty());
        assert_eq!(scheduler.get(CallbackMode::AFTER).len(), 1);
        assert_eq!(scheduler.len(), 2);
    }

    #[test]
    fn test_only_once_deduplicates_same_callback() {
        let scheduler = CallbackScheduler::new();
        let cb = noop();
        let once = CallbackOptions {
            only_once: true,
            ..Default::default()
        };
        let h1 = scheduler.add(cb.clone(), CallbackMode::AFTER, once);
        let h2 = scheduler.add(cb.clone(), CallbackMode::AFTER, once);
        assert_eq!(h1, h2);
        assert_eq!(scheduler.len(), 1);

        // a different mode is a different entry
        scheduler.add(cb.clone(), CallbackMode::BEFORE, once);
        // without only_once the same callback is stored again
        scheduler.add(cb, CallbackMode::AFTER, CallbackOptions::default());
        assert_eq!(scheduler.len(), 3);
    }

    #[test]
    fn test_remove_and_location() {
        let scheduler = CallbackScheduler::new();
        let handle = scheduler.add(noop(), CallbackMode::BEFORE, CallbackOptions::default());
        let location = scheduler.registered_at(handle).unwrap();
        assert!(location.file().ends_with("callback.rs"));
        assert!(scheduler.remove(handle));
        assert!(!scheduler.remove(handle));
        assert!(scheduler.is_empty());
    }
}
