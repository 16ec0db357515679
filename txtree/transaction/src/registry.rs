//! Transaction registry
//!
//! The registry tracks "the current transaction of kind K" for every
//! execution unit, the savepoints created in each unit, and the callbacks
//! deferred past the end of a transaction. It is passed explicitly to whoever
//! begins transactions; nothing here is process-global.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use smol_str::SmolStr;

use crate::callback::{Deferral, PendingCallback};
use crate::config::TransactionConfig;
use crate::distributed::{CompositeResource, DistributedTransaction};
use crate::error::{Retryable, TransactionError, TransactionResult};
use crate::guard::ScopeGuard;
use crate::id::{ExecutionUnitId, KindId, next_kind_id};
use crate::resource::TransactionalResource;
use crate::status::TransactionStatus;
use crate::transaction::{Backend, StartOptions, Transaction, TransactionInner};

const DISTRIBUTED_KIND_NAME: &str = "distributed";

/// A transaction type: which resource its masters begin on.
#[derive(Clone)]
pub struct TransactionKind {
    id: KindId,
    name: SmolStr,
    resource: Arc<dyn TransactionalResource>,
}

impl TransactionKind {
    /// Creates a kind with a fresh id.
    pub fn new(
        name: impl Into<SmolStr>,
        resource: Arc<dyn TransactionalResource>,
    ) -> TransactionResult<Self> {
        Ok(Self {
            id: next_kind_id()?,
            name: name.into(),
            resource,
        })
    }

    /// Returns the kind id.
    pub fn id(&self) -> KindId {
        self.id
    }

    /// Returns the kind name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the resource masters of this kind begin on.
    pub fn resource(&self) -> &Arc<dyn TransactionalResource> {
        &self.resource
    }
}

impl fmt::Debug for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionKind")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("resource", &self.resource.name())
            .finish()
    }
}

type Deferred = (PendingCallback, Transaction);

pub(crate) struct RegistryShared {
    config: TransactionConfig,
    current: Mutex<HashMap<(KindId, ExecutionUnitId), Transaction>>,
    savepoints: DashMap<(ExecutionUnitId, String), Weak<TransactionInner>>,
    controller_queue: Mutex<Vec<Deferred>>,
    shutdown_queue: Mutex<Vec<Deferred>>,
}

impl RegistryShared {
    pub(crate) fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub(crate) fn current(&self, kind: KindId, unit: ExecutionUnitId) -> Option<Transaction> {
        self.current.lock().get(&(kind, unit)).cloned()
    }

    pub(crate) fn set_current(&self, kind: KindId, unit: ExecutionUnitId, txn: Transaction) {
        self.current.lock().insert((kind, unit), txn);
    }

    /// Moves the current pointer from `from` to `to`. Does nothing if `from`
    /// is not current.
    pub(crate) fn repoint(
        &self,
        kind: KindId,
        unit: ExecutionUnitId,
        from: &Transaction,
        to: Option<Transaction>,
    ) {
        let mut current = self.current.lock();
        let key = (kind, unit);
        if !current.get(&key).is_some_and(|c| c.ptr_eq(from)) {
            return;
        }
        match to {
            Some(to) => current.insert(key, to),
            None => current.remove(&key),
        };
    }

    pub(crate) fn register_savepoint(&self, unit: ExecutionUnitId, name: &str, owner: &Transaction) {
        self.savepoints
            .insert((unit, name.to_string()), owner.downgrade());
    }

    /// Resolves the transaction whose resource scope holds `name`. Only
    /// started owners are eligible.
    pub(crate) fn savepoint_owner(
        &self,
        unit: ExecutionUnitId,
        name: &str,
    ) -> TransactionResult<Transaction> {
        self.savepoints
            .get(&(unit, name.to_string()))
            .and_then(|owner| Transaction::upgrade(owner.value()))
            .filter(|owner| owner.status() == TransactionStatus::Started)
            .ok_or_else(|| TransactionError::UnknownSavepoint(name.to_string()))
    }

    pub(crate) fn rollback_to_savepoint(
        &self,
        unit: ExecutionUnitId,
        name: &str,
    ) -> TransactionResult<()> {
        self.savepoint_owner(unit, name)?
            .rollback_to_own_savepoint(name)
    }

    pub(crate) fn release_savepoint(&self, unit: ExecutionUnitId, name: &str) -> TransactionResult<()> {
        self.savepoint_owner(unit, name)?.release_own_savepoint(name)?;
        self.forget_savepoint(unit, name);
        Ok(())
    }

    pub(crate) fn forget_savepoint(&self, unit: ExecutionUnitId, name: &str) {
        self.savepoints.remove(&(unit, name.to_string()));
    }

    /// Drops the savepoints of `unit` whose owner is gone or no longer
    /// started.
    pub(crate) fn prune_savepoints(&self, unit: ExecutionUnitId) {
        self.savepoints.retain(|(u, _), owner| {
            *u != unit
                || Transaction::upgrade(owner)
                    .is_some_and(|owner| owner.status() == TransactionStatus::Started)
        });
    }

    pub(crate) fn defer(&self, pending: PendingCallback, txn: Transaction) {
        match pending.mode().deferral {
            Deferral::Immediate => pending.invoke(&txn),
            Deferral::InWorker => rayon::spawn(move || pending.invoke(&txn)),
            Deferral::AfterController => self.controller_queue.lock().push((pending, txn)),
            Deferral::InShutdown => self.shutdown_queue.lock().push((pending, txn)),
        }
    }

    fn drain(queue: &Mutex<Vec<Deferred>>) -> usize {
        let mut ran = 0;
        loop {
            // callbacks may defer more work, keep going until the queue stays empty
            let batch = std::mem::take(&mut *queue.lock());
            if batch.is_empty() {
                return ran;
            }
            for (pending, txn) in batch {
                pending.invoke(&txn);
                ran += 1;
            }
        }
    }
}

/// Handle to a transaction registry. Clones share the same state.
#[derive(Clone)]
pub struct TransactionRegistry {
    shared: Arc<RegistryShared>,
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new(TransactionConfig::default())
    }
}

impl TransactionRegistry {
    /// Creates an empty registry.
    pub fn new(config: TransactionConfig) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                config,
                current: Mutex::new(HashMap::new()),
                savepoints: DashMap::new(),
                controller_queue: Mutex::new(Vec::new()),
                shutdown_queue: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns the registry configuration.
    pub fn config(&self) -> &TransactionConfig {
        &self.shared.config
    }

    /// Begins a transaction of `kind`, nested under the current one of the
    /// same kind if there is one.
    pub fn begin(&self, kind: &TransactionKind) -> TransactionResult<(Transaction, ScopeGuard)> {
        self.begin_with(kind, false)
    }

    fn begin_with(
        &self,
        kind: &TransactionKind,
        runnable: bool,
    ) -> TransactionResult<(Transaction, ScopeGuard)> {
        let txn = Transaction::start(&self.shared, StartOptions {
            kind: kind.id,
            kind_name: kind.name.clone(),
            backend: || Backend::Resource(kind.resource.clone()),
            runnable,
        })?;
        Ok((txn.clone(), ScopeGuard::new(txn)))
    }

    /// Begins a distributed transaction. Member transactions are attached
    /// with [`DistributedTransaction::attach`].
    pub fn begin_distributed(&self) -> TransactionResult<(DistributedTransaction, ScopeGuard)> {
        let txn = Transaction::start(&self.shared, StartOptions {
            kind: KindId::DISTRIBUTED,
            kind_name: SmolStr::new_static(DISTRIBUTED_KIND_NAME),
            backend: || Backend::Composite(Arc::new(CompositeResource::new())),
            runnable: false,
        })?;
        let guard = ScopeGuard::new(txn.clone());
        let distributed = DistributedTransaction::from_transaction(txn)
            .ok_or_else(|| TransactionError::ParentMismatch("not a distributed transaction".into()))?;
        Ok((distributed, guard))
    }

    /// Returns the current transaction of `kind` on the calling execution unit.
    pub fn current(&self, kind: &TransactionKind) -> Option<Transaction> {
        self.shared.current(kind.id, ExecutionUnitId::current())
    }

    /// Returns the current distributed transaction of the calling execution unit.
    pub fn current_distributed(&self) -> Option<DistributedTransaction> {
        self.shared
            .current(KindId::DISTRIBUTED, ExecutionUnitId::current())
            .and_then(DistributedTransaction::from_transaction)
    }

    /// Commits the guard's transaction. Any failure rolls the transaction back
    /// with reason `EXCEPTION` before the error is returned.
    pub fn commit(&self, mut guard: ScopeGuard) -> TransactionResult<()> {
        let result = self.guarded(&guard).and_then(|txn| txn.commit());
        if result.is_err() {
            guard.fail();
        }
        result
    }

    /// Rolls the guard's transaction back with reason `EXPLICIT`.
    pub fn rollback(&self, mut guard: ScopeGuard) -> TransactionResult<()> {
        let result = self.guarded(&guard).and_then(|txn| txn.rollback());
        if result.is_err() {
            guard.fail();
        }
        result
    }

    fn guarded(&self, guard: &ScopeGuard) -> TransactionResult<Transaction> {
        let txn = guard.transaction().cloned().ok_or(TransactionError::Detached)?;
        let current = self.shared.current(txn.kind(), txn.unit());
        if !txn.belongs_to(&self.shared) || !current.as_ref().is_some_and(|c| c.ptr_eq(&txn)) {
            return Err(TransactionError::ScopeMismatch {
                found: txn.id(),
                expected: current.map(|c| c.id()),
            });
        }
        Ok(txn)
    }

    /// Runs `work` inside a transaction of `kind`: commits when it returns
    /// `Ok`, rolls back with reason `EXCEPTION` when it returns `Err`.
    ///
    /// If this call opened a master and the failure is transient, the whole
    /// unit of work is retried up to `max_retries` times with an incremental
    /// backoff. A nested run never retries, the enclosing transaction has to.
    pub fn run<T, E, F>(&self, kind: &TransactionKind, mut work: F) -> Result<T, E>
    where
        F: FnMut(&Transaction) -> Result<T, E>,
        E: From<TransactionError> + Retryable + fmt::Display,
    {
        let mut attempt = 0;
        loop {
            let opens_master = self.current(kind).is_none();
            match self.run_once(kind, &mut work) {
                Err(err)
                    if opens_master
                        && err.is_transient()
                        && attempt < self.shared.config.max_retries =>
                {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    tracing::debug!(
                        kind = %kind.name(),
                        attempt,
                        max_retries = self.shared.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient error, retrying transaction after backoff"
                    );
                    thread::sleep(delay);
                }
                Err(err) => {
                    if attempt > 0 && err.is_transient() {
                        tracing::warn!(kind = %kind.name(), attempt, "transaction retries exhausted");
                    }
                    return Err(err);
                }
                Ok(value) => return Ok(value),
            }
        }
    }

    fn run_once<T, E, F>(&self, kind: &TransactionKind, work: &mut F) -> Result<T, E>
    where
        F: FnMut(&Transaction) -> Result<T, E>,
        E: From<TransactionError>,
    {
        let (txn, mut guard) = self.begin_with(kind, true)?;
        match work(&txn) {
            Ok(value) => {
                self.commit(guard)?;
                Ok(value)
            }
            Err(err) => {
                guard.fail();
                drop(guard);
                Err(err)
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let config = &self.shared.config;
        let delay = config
            .retry_backoff
            .saturating_mul(attempt)
            .min(config.max_retry_backoff);
        let jitter_range = delay.as_millis() as u64 / 2;
        if config.retry_jitter && jitter_range > 0 {
            delay + Duration::from_millis(rand::rng().random_range(0..=jitter_range))
        } else {
            delay
        }
    }

    /// Runs the callbacks deferred until the end of the enclosing request.
    /// Returns how many ran.
    pub fn run_controller_deferred(&self) -> usize {
        RegistryShared::drain(&self.shared.controller_queue)
    }

    /// Runs the callbacks deferred to shutdown. Returns how many ran.
    pub fn shutdown(&self) -> usize {
        let ran = RegistryShared::drain(&self.shared.shutdown_queue);
        tracing::debug!(callbacks = ran, "transaction registry shut down");
        ran
    }

    /// Number of (kind, execution unit) slots holding an open transaction.
    pub fn active_count(&self) -> usize {
        self.shared.current.lock().len()
    }

    /// Number of savepoints that can still be rolled back to.
    pub fn savepoint_count(&self) -> usize {
        self.shared
            .savepoints
            .iter()
            .filter(|e| {
                Transaction::upgrade(e.value())
                    .is_some_and(|owner| owner.status() == TransactionStatus::Started)
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::ResourceError;
    use crate::status::RollbackReason;
    use crate::testutil::{Op, RecordingResource};

    fn setup(config: TransactionConfig) -> (TransactionRegistry, TransactionKind, Arc<RecordingResource>) {
        let resource = Arc::new(RecordingResource::new("sql"));
        let kind = TransactionKind::new("sql", resource.clone()).unwrap();
        (TransactionRegistry::new(config), kind, resource)
    }

    fn fast_retries(max_retries: u32) -> TransactionConfig {
        TransactionConfig {
            max_retries,
            retry_backoff: Duration::ZERO,
            retry_jitter: false,
            ..TransactionConfig::default()
        }
    }

    #[test]
    fn test_current_follows_nesting() {
        let (registry, kind, _resource) = setup(TransactionConfig::default());
        assert!(registry.current(&kind).is_none());

        let (master, master_guard) = registry.begin(&kind).unwrap();
        let (nested, nested_guard) = registry.begin(&kind).unwrap();
        assert_eq!(registry.current(&kind), Some(nested));

        registry.commit(nested_guard).unwrap();
        assert_eq!(registry.current(&kind), Some(master));
        assert_eq!(registry.active_count(), 1);

        registry.commit(master_guard).unwrap();
        assert!(registry.current(&kind).is_none());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_kinds_are_independent() {
        let (registry, sql, _) = setup(TransactionConfig::default());
        let other = TransactionKind::new("sql-replica", sql.resource().clone()).unwrap();

        let (a, _ga) = registry.begin(&sql).unwrap();
        let (b, _gb) = registry.begin(&other).unwrap();
        assert!(a.is_master());
        assert!(b.is_master());
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn test_out_of_order_commit_is_scope_mismatch() {
        let (registry, kind, resource) = setup(TransactionConfig::default());
        let (master, master_guard) = registry.begin(&kind).unwrap();
        let (nested, _nested_guard) = registry.begin(&kind).unwrap();

        let err = registry.commit(master_guard).unwrap_err();
        assert_eq!(err, TransactionError::ScopeMismatch {
            found: master.id(),
            expected: Some(nested.id()),
        });
        // the failed guard still rolls the whole tree back
        assert_eq!(master.status(), TransactionStatus::RolledBack);
        assert_eq!(master.rollback_reason(), Some(RollbackReason::Exception));
        assert_eq!(nested.rollback_reason(), Some(RollbackReason::Parent));
        assert_eq!(resource.count(&Op::Commit), 0);
    }

    #[test]
    fn test_guard_from_other_registry_is_rejected() {
        let (registry, kind, _) = setup(TransactionConfig::default());
        let other = TransactionRegistry::default();
        let (_txn, guard) = registry.begin(&kind).unwrap();
        assert!(matches!(
            other.commit(guard),
            Err(TransactionError::ScopeMismatch { .. })
        ));
    }

    #[test]
    fn test_run_commits_on_ok() {
        let (registry, kind, resource) = setup(TransactionConfig::default());
        let value = registry
            .run(&kind, |txn| {
                assert!(txn.is_runnable());
                Ok::<_, TransactionError>(7)
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(resource.ops(), vec![Op::Begin, Op::Commit]);
    }

    #[test]
    fn test_run_rolls_back_with_exception_on_err() {
        let (registry, kind, resource) = setup(TransactionConfig::default());
        let mut seen = None;
        let err = registry
            .run(&kind, |txn| {
                seen = Some(txn.clone());
                Err::<(), _>(TransactionError::ParentMismatch("boom".into()))
            })
            .unwrap_err();
        assert!(matches!(err, TransactionError::ParentMismatch(_)));
        let txn = seen.unwrap();
        assert_eq!(txn.rollback_reason(), Some(RollbackReason::Exception));
        assert_eq!(resource.ops(), vec![Op::Begin, Op::Rollback]);
    }

    #[test]
    fn test_run_retries_transient_errors() {
        let (registry, kind, resource) = setup(fast_retries(3));
        let attempts = AtomicU32::new(0);
        let value = registry
            .run(&kind, |_txn| {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TransactionError::from(ResourceError::transient("deadlock")))
                } else {
                    Ok("done")
                }
            })
            .unwrap();
        assert_eq!(value, "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(resource.count(&Op::Begin), 3);
        assert_eq!(resource.count(&Op::Rollback), 2);
        assert_eq!(resource.count(&Op::Commit), 1);
    }

    #[test]
    fn test_run_retries_transient_commit_failure() {
        let (registry, kind, resource) = setup(fast_retries(1));
        resource.fail_next(Op::Commit, ResourceError::transient("serialization failure"));
        registry.run(&kind, |_| Ok::<_, TransactionError>(())).unwrap();
        assert_eq!(resource.ops(), vec![
            Op::Begin,
            Op::Commit,
            Op::Rollback,
            Op::Begin,
            Op::Commit
        ]);
    }

    #[test]
    fn test_run_gives_up_after_max_retries() {
        let (registry, kind, resource) = setup(fast_retries(2));
        let attempts = AtomicU32::new(0);
        let err = registry
            .run(&kind, |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TransactionError::from(ResourceError::transient("deadlock")))
            })
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(resource.count(&Op::Rollback), 3);
    }

    #[test]
    fn test_run_does_not_retry_fatal_or_nested() {
        let (registry, kind, resource) = setup(fast_retries(5));
        let attempts = AtomicU32::new(0);
        let _ = registry.run(&kind, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(TransactionError::from(ResourceError::failed("constraint")))
        });
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        let (_master, _guard) = registry.begin(&kind).unwrap();
        attempts.store(0, Ordering::SeqCst);
        let _ = registry.run(&kind, |txn| {
            assert!(!txn.is_master());
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(TransactionError::from(ResourceError::transient("deadlock")))
        });
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(resource.count_matching(|op| matches!(op, Op::RollbackToSavepoint(_))), 1);
    }

    #[test]
    fn test_backoff_is_incremental_and_capped() {
        let registry = TransactionRegistry::new(TransactionConfig {
            retry_backoff: Duration::from_millis(100),
            max_retry_backoff: Duration::from_millis(250),
            retry_jitter: false,
            ..TransactionConfig::default()
        });
        assert_eq!(registry.backoff(1), Duration::from_millis(100));
        assert_eq!(registry.backoff(2), Duration::from_millis(200));
        assert_eq!(registry.backoff(3), Duration::from_millis(250));
    }

    #[test]
    fn test_backoff_jitter_stays_within_half() {
        let registry = TransactionRegistry::new(TransactionConfig {
            retry_backoff: Duration::from_millis(100),
            ..TransactionConfig::default()
        });
        for _ in 0..50 {
            let delay = registry.backoff(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
