//! The transaction state machine
//!
//! A [`Transaction`] is one resource-bound unit of work. The first transaction
//! of a kind on an execution unit is the *master* and opens the resource-level
//! transaction; transactions begun while another one of the same kind is
//! current become its children and are scoped by a savepoint on the parent.
//!
//! Status changes follow the table in [`TransactionStatus`]. Callbacks are
//! claimed before they run, so re-entrant calls from inside a callback never
//! execute the same entry twice.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::callback::{
    Callback, CallbackHandle, CallbackMode, CallbackOptions, CallbackScheduler, Deferral, Outcome,
    Relative,
};
use crate::distributed::CompositeResource;
use crate::error::{TransactionError, TransactionResult};
use crate::id::{ExecutionUnitId, KindId, TransactionId, global_transaction_id_generator};
use crate::registry::RegistryShared;
use crate::resource::TransactionalResource;
use crate::status::{RollbackReason, TransactionStatus};

/// What a transaction issues its resource-level operations against.
#[derive(Clone)]
pub(crate) enum Backend {
    Resource(Arc<dyn TransactionalResource>),
    Composite(Arc<CompositeResource>),
}

impl Backend {
    fn name(&self) -> &str {
        match self {
            Backend::Resource(r) => r.name(),
            Backend::Composite(_) => "distributed",
        }
    }

    fn priority(&self) -> i32 {
        match self {
            Backend::Resource(r) => r.priority(),
            Backend::Composite(c) => c.priority(),
        }
    }

    fn begin(&self) -> TransactionResult<()> {
        match self {
            Backend::Resource(r) => Ok(r.execute_begin()?),
            // members are begun before they are attached
            Backend::Composite(_) => Ok(()),
        }
    }

    fn commit(&self) -> TransactionResult<()> {
        match self {
            Backend::Resource(r) => Ok(r.execute_commit()?),
            Backend::Composite(c) => c.commit(),
        }
    }

    fn rollback(&self) -> TransactionResult<()> {
        match self {
            Backend::Resource(r) => Ok(r.execute_rollback()?),
            Backend::Composite(c) => c.rollback(),
        }
    }

    fn create_savepoint(&self, name: &str) -> TransactionResult<()> {
        match self {
            Backend::Resource(r) => Ok(r.execute_create_savepoint(name)?),
            Backend::Composite(c) => c.create_savepoint(name),
        }
    }

    fn rollback_to_savepoint(&self, name: &str) -> TransactionResult<()> {
        match self {
            Backend::Resource(r) => Ok(r.execute_rollback_to_savepoint(name)?),
            Backend::Composite(c) => c.rollback_to_savepoint(name),
        }
    }

    fn release_savepoint(&self, name: &str) -> TransactionResult<()> {
        match self {
            Backend::Resource(r) => Ok(r.execute_release_savepoint(name)?),
            Backend::Composite(c) => c.release_savepoint(name),
        }
    }
}

/// Everything [`Transaction::start`] needs to know about the kind being begun.
pub(crate) struct StartOptions<F> {
    pub(crate) kind: KindId,
    pub(crate) kind_name: SmolStr,
    /// Only called when the new transaction is a master.
    pub(crate) backend: F,
    pub(crate) runnable: bool,
}

struct TransactionState {
    status: TransactionStatus,
    rollback_reason: Option<RollbackReason>,
    children: Vec<Transaction>,
    rollback_on_release: bool,
    rollback_only: bool,
    failed: bool,
}

pub(crate) struct TransactionInner {
    id: TransactionId,
    kind: KindId,
    kind_name: SmolStr,
    unit: ExecutionUnitId,
    backend: Backend,
    parent: Option<Transaction>,
    depth: usize,
    runnable: bool,
    registry: Arc<RegistryShared>,
    callbacks: CallbackScheduler,
    state: Mutex<TransactionState>,
}

/// Handle to a transaction. Cloning the handle does not clone the transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    /// Begins a transaction of `options.kind` on the current execution unit.
    ///
    /// If a transaction of the same kind is already current it becomes the
    /// parent: a savepoint named after the new transaction is created on it
    /// and no resource-level begin is issued.
    pub(crate) fn start<F>(
        registry: &Arc<RegistryShared>,
        options: StartOptions<F>,
    ) -> TransactionResult<Self>
    where
        F: FnOnce() -> Backend,
    {
        let unit = ExecutionUnitId::current();
        let parent = registry.current(options.kind, unit);
        if let Some(parent) = &parent {
            parent.ensure_status("begin a nested transaction in", |s| {
                s == TransactionStatus::Started
            })?;
        }

        let id = global_transaction_id_generator().next()?;
        let backend = match &parent {
            Some(parent) => parent.inner.backend.clone(),
            None => (options.backend)(),
        };
        let txn = Transaction {
            inner: Arc::new(TransactionInner {
                id,
                kind: options.kind,
                kind_name: options.kind_name,
                unit,
                backend,
                parent: parent.clone(),
                depth: parent.as_ref().map_or(0, |p| p.depth() + 1),
                runnable: options.runnable,
                registry: registry.clone(),
                callbacks: CallbackScheduler::new(),
                state: Mutex::new(TransactionState {
                    status: TransactionStatus::Started,
                    rollback_reason: None,
                    children: Vec::new(),
                    rollback_on_release: true,
                    rollback_only: false,
                    failed: false,
                }),
            }),
        };

        match &parent {
            Some(parent) => {
                parent.create_savepoint(&txn.savepoint_id())?;
                parent.inner.state.lock().children.push(txn.clone());
            }
            None => txn.inner.backend.begin()?,
        }
        registry.set_current(options.kind, unit, txn.clone());

        tracing::debug!(
            txn = %txn.id(),
            kind = %txn.kind_name(),
            parent = ?parent.as_ref().map(Transaction::id),
            depth = txn.depth(),
            "transaction started"
        );
        Ok(txn)
    }

    /// Returns the transaction id.
    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    /// Returns the id of the kind this transaction was begun for.
    pub fn kind(&self) -> KindId {
        self.inner.kind
    }

    /// Returns the name of the transaction kind.
    pub fn kind_name(&self) -> &str {
        &self.inner.kind_name
    }

    /// Returns the name of the resource behind this transaction.
    pub fn resource_name(&self) -> &str {
        self.inner.backend.name()
    }

    /// Returns the current lifecycle status.
    pub fn status(&self) -> TransactionStatus {
        self.inner.state.lock().status
    }

    /// `None` until the transaction is rolled back.
    pub fn rollback_reason(&self) -> Option<RollbackReason> {
        self.inner.state.lock().rollback_reason
    }

    /// Name of the savepoint this transaction creates on its parent.
    pub fn savepoint_id(&self) -> String {
        self.inner.id.savepoint_id()
    }

    /// Returns the resource priority used to order distributed commits.
    pub fn priority(&self) -> i32 {
        self.inner.backend.priority()
    }

    /// Returns the nesting depth, 0 for a master.
    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    /// Returns true if the transaction has no parent.
    pub fn is_master(&self) -> bool {
        self.inner.parent.is_none()
    }

    /// Returns true if the transaction was begun by a retrying `run`.
    pub fn is_runnable(&self) -> bool {
        self.inner.runnable
    }

    /// Returns true once an implicitly rolled back child has poisoned this transaction.
    pub fn is_rollback_only(&self) -> bool {
        self.inner.state.lock().rollback_only
    }

    /// Returns the enclosing transaction, `None` for a master.
    pub fn parent(&self) -> Option<Transaction> {
        self.inner.parent.clone()
    }

    /// Returns the outermost ancestor, or `self` for a master.
    pub fn master(&self) -> Transaction {
        let mut master = self.clone();
        while let Some(parent) = master.parent() {
            master = parent;
        }
        master
    }

    /// Nested transactions begun while this one was current, in creation
    /// order. Emptied once a master reaches a terminal status.
    pub fn children(&self) -> Vec<Transaction> {
        self.inner.state.lock().children.clone()
    }

    /// Returns the callbacks registered on this transaction.
    pub fn callbacks(&self) -> &CallbackScheduler {
        &self.inner.callbacks
    }

    /// Returns true if both handles point to the same transaction.
    pub fn ptr_eq(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<TransactionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<TransactionInner>) -> Option<Transaction> {
        weak.upgrade().map(|inner| Transaction { inner })
    }

    pub(crate) fn unit(&self) -> ExecutionUnitId {
        self.inner.unit
    }

    pub(crate) fn belongs_to(&self, registry: &Arc<RegistryShared>) -> bool {
        Arc::ptr_eq(&self.inner.registry, registry)
    }

    pub(crate) fn composite(&self) -> Option<Arc<CompositeResource>> {
        match &self.inner.backend {
            Backend::Composite(c) => Some(c.clone()),
            Backend::Resource(_) => None,
        }
    }

    pub(crate) fn rollback_on_release(&self) -> bool {
        self.inner.state.lock().rollback_on_release
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.inner.state.lock().failed
    }

    /// Records that an error is propagating through this transaction's scope.
    pub(crate) fn mark_failed(&self) {
        self.inner.state.lock().failed = true;
    }

    /// Registers `callback` for `mode`.
    ///
    /// Fails if the status change `mode` waits for can no longer happen, e.g.
    /// an after-commit callback on a rolled back transaction.
    #[track_caller]
    pub fn add_callback(
        &self,
        callback: Callback,
        mode: CallbackMode,
        options: CallbackOptions,
    ) -> TransactionResult<CallbackHandle> {
        mode.validate()?;
        let local = self.status();
        let master = self.master().status();
        let status = match mode.relative {
            Relative::Local => local,
            Relative::Master => master,
        };
        let saves = mode.relative == Relative::Local && mode.outcome == Outcome::Save;
        if !mode.reachable_from(local, master) || (saves && self.is_master()) {
            return Err(TransactionError::UnreachableMode { mode, status });
        }
        Ok(self.inner.callbacks.add(callback, mode, options))
    }

    /// Shorthand for [`add_callback`](Self::add_callback) with default options.
    #[track_caller]
    pub fn on<F>(&self, mode: CallbackMode, f: F) -> TransactionResult<CallbackHandle>
    where
        F: Fn(&Transaction) + Send + Sync + 'static,
    {
        self.add_callback(Callback::new(f), mode, CallbackOptions::default())
    }

    /// Commits the transaction.
    ///
    /// A nested transaction only moves to `SAVED` and the parent becomes
    /// current again. Its savepoint stays valid until the parent finishes. A master issues the
    /// resource-level commit and promotes every saved descendant to
    /// `COMMITTED`.
    pub fn commit(&self) -> TransactionResult<()> {
        let result = self.commit_checked();
        if result.is_err() && self.status().is_open() {
            self.mark_failed();
        }
        result
    }

    fn commit_checked(&self) -> TransactionResult<()> {
        let target = if self.is_master() {
            TransactionStatus::Committed
        } else {
            TransactionStatus::Saved
        };
        self.ensure_status("commit", |s| s.can_transition_to(target))?;
        if self.is_rollback_only() {
            return Err(self.illegal_status("commit rollback-only"));
        }
        self.ensure_current()?;
        match self.parent() {
            Some(parent) => self.commit_nested(&parent),
            None => self.commit_master(),
        }
    }

    fn commit_nested(&self, parent: &Transaction) -> TransactionResult<()> {
        self.fire(CallbackMode::BEFORE);
        self.fire(CallbackMode::BEFORE_SAVE);
        self.ensure_status("commit", |s| s == TransactionStatus::Started)?;

        {
            let mut state = self.inner.state.lock();
            state.status = TransactionStatus::Saved;
            state.rollback_on_release = false;
        }
        self.inner
            .registry
            .repoint(self.inner.kind, self.inner.unit, self, Some(parent.clone()));
        tracing::debug!(txn = %self.id(), parent = %parent.id(), "nested transaction saved");

        self.fire(CallbackMode::AFTER_SAVE);
        self.fire(CallbackMode::AFTER);
        Ok(())
    }

    fn commit_master(&self) -> TransactionResult<()> {
        self.fire(CallbackMode::BEFORE);
        self.fire_local_tree(CallbackMode::BEFORE_COMMIT, TransactionStatus::Saved);
        self.fire_master_tree(CallbackMode::BEFORE_MASTER);
        self.fire_master_tree(CallbackMode::BEFORE_MASTER_COMMIT);
        // a callback may have finished the transaction already
        self.ensure_status("commit", |s| s == TransactionStatus::Started)?;
        if self.is_rollback_only() {
            return Err(self.illegal_status("commit rollback-only"));
        }

        // Statuses only change once the resource has accepted the commit, a
        // failure leaves the whole tree open for the scope guard to roll back.
        self.inner.backend.commit()?;
        self.promote_saved();
        {
            let mut state = self.inner.state.lock();
            state.status = TransactionStatus::Committed;
            state.rollback_on_release = false;
        }
        self.finish_master();
        tracing::debug!(txn = %self.id(), kind = %self.kind_name(), "transaction committed");

        self.fire_local_tree(CallbackMode::AFTER_COMMIT, TransactionStatus::Committed);
        self.fire_master_tree(CallbackMode::AFTER_MASTER_COMMIT);
        self.fire_master_tree(CallbackMode::AFTER_MASTER);
        self.defer_master_tree(CallbackMode::AFTER_MASTER_COMMIT);
        self.defer_master_tree(CallbackMode::AFTER_MASTER);
        self.fire(CallbackMode::AFTER);
        self.release_children();
        Ok(())
    }

    /// Rolls the transaction back on the caller's request.
    pub fn rollback(&self) -> TransactionResult<()> {
        self.rollback_with(RollbackReason::Explicit)
    }

    /// Rolls the transaction back, recording `reason` unless a reason was
    /// already recorded. Open descendants are rolled back first with reason
    /// `PARENT`.
    pub fn rollback_with(&self, reason: RollbackReason) -> TransactionResult<()> {
        self.ensure_status("rollback", |s| {
            s.can_transition_to(TransactionStatus::RolledBack)
        })?;
        self.ensure_current()?;
        self.rollback_unchecked(reason)
    }

    /// Rollback used by scope guards and cascades: no current-transaction
    /// check, no-op on a terminal transaction.
    pub(crate) fn force_rollback(&self, reason: RollbackReason) -> TransactionResult<()> {
        if self.status().is_terminal() {
            return Ok(());
        }
        self.rollback_unchecked(reason)
    }

    fn rollback_unchecked(&self, reason: RollbackReason) -> TransactionResult<()> {
        self.inner
            .state
            .lock()
            .rollback_reason
            .get_or_insert(reason);

        let mut first_err = None;
        let open_children: Vec<_> = self
            .children()
            .into_iter()
            .rev()
            .filter(|c| c.status().is_open())
            .collect();
        for child in open_children {
            if let Err(err) = child.force_rollback(RollbackReason::Parent) {
                tracing::warn!(txn = %child.id(), error = %err, "cascaded rollback failed");
                first_err.get_or_insert(err);
            }
        }

        let result = match self.parent() {
            Some(parent) => self.rollback_nested(&parent, reason),
            None => self.rollback_master(),
        };
        match (result, first_err) {
            (Err(err), _) | (Ok(()), Some(err)) => Err(err),
            (Ok(()), None) => Ok(()),
        }
    }

    fn rollback_nested(&self, parent: &Transaction, reason: RollbackReason) -> TransactionResult<()> {
        self.fire(CallbackMode::BEFORE);
        self.fire(CallbackMode::BEFORE_ROLLBACK);
        let was = self.status();
        if was.is_terminal() {
            return Ok(());
        }

        let savepoint = self.savepoint_id();
        // Saved work and cascaded rollbacks are undone by the ancestor.
        let result = if was == TransactionStatus::Started && reason != RollbackReason::Parent {
            self.inner
                .registry
                .rollback_to_savepoint(self.inner.unit, &savepoint)
        } else {
            Ok(())
        };
        self.inner.registry.forget_savepoint(self.inner.unit, &savepoint);
        self.finish_rollback();
        self.inner
            .registry
            .repoint(self.inner.kind, self.inner.unit, self, Some(parent.clone()));

        let poison = self.inner.registry.config().poison_parent_on_implicit_rollback;
        if reason == RollbackReason::Implicit && poison {
            parent.inner.state.lock().rollback_only = true;
            tracing::debug!(txn = %parent.id(), "transaction marked rollback-only");
        }
        tracing::debug!(txn = %self.id(), %reason, "nested transaction rolled back");

        self.fire(CallbackMode::AFTER_ROLLBACK);
        self.fire(CallbackMode::AFTER);
        result
    }

    fn rollback_master(&self) -> TransactionResult<()> {
        self.fire(CallbackMode::BEFORE);
        self.fire(CallbackMode::BEFORE_ROLLBACK);
        self.fire_master_tree(CallbackMode::BEFORE_MASTER);
        self.fire_master_tree(CallbackMode::BEFORE_MASTER_ROLLBACK);
        if self.status().is_terminal() {
            return Ok(());
        }

        let result = self.inner.backend.rollback();
        if let Err(err) = &result {
            tracing::error!(txn = %self.id(), error = %err, "resource rollback failed");
        }
        self.finish_rollback();
        self.finish_master();
        tracing::debug!(
            txn = %self.id(),
            kind = %self.kind_name(),
            reason = ?self.rollback_reason(),
            "transaction rolled back"
        );

        self.fire(CallbackMode::AFTER_ROLLBACK);
        self.fire_master_tree(CallbackMode::AFTER_MASTER_ROLLBACK);
        self.fire_master_tree(CallbackMode::AFTER_MASTER);
        self.defer_master_tree(CallbackMode::AFTER_MASTER_ROLLBACK);
        self.defer_master_tree(CallbackMode::AFTER_MASTER);
        self.fire(CallbackMode::AFTER);
        self.release_children();
        result
    }

    /// Creates a savepoint named `name` on this transaction's resource scope
    /// and records this transaction as its owner.
    pub fn create_savepoint(&self, name: &str) -> TransactionResult<()> {
        self.ensure_status("create a savepoint in", |s| {
            s == TransactionStatus::Started
        })?;
        self.inner.backend.create_savepoint(name)?;
        self.inner
            .registry
            .register_savepoint(self.inner.unit, name, self);
        Ok(())
    }

    /// Rolls back to the savepoint `name`, wherever in this execution unit's
    /// transaction trees it lives.
    pub fn rollback_to_savepoint(&self, name: &str) -> TransactionResult<()> {
        self.inner
            .registry
            .rollback_to_savepoint(self.inner.unit, name)
    }

    /// Releases the savepoint `name`, keeping the work done since it was
    /// created.
    pub fn release_savepoint(&self, name: &str) -> TransactionResult<()> {
        self.inner.registry.release_savepoint(self.inner.unit, name)
    }

    /// Resource-level savepoint rollback on this transaction's scope.
    ///
    /// If `name` is the savepoint of a saved child, that child and the saved
    /// siblings after it lose their work and are rolled back with `PARENT`.
    pub(crate) fn rollback_to_own_savepoint(&self, name: &str) -> TransactionResult<()> {
        self.inner.backend.rollback_to_savepoint(name)?;
        let undone: Vec<_> = self
            .children()
            .into_iter()
            .skip_while(|c| c.savepoint_id() != name)
            .filter(|c| c.status() == TransactionStatus::Saved)
            .collect();
        for child in undone {
            child.force_rollback(RollbackReason::Parent)?;
        }
        Ok(())
    }

    pub(crate) fn release_own_savepoint(&self, name: &str) -> TransactionResult<()> {
        self.inner.backend.release_savepoint(name)
    }

    fn finish_rollback(&self) {
        let mut state = self.inner.state.lock();
        state.status = TransactionStatus::RolledBack;
        state.rollback_on_release = false;
    }

    /// Clears the current pointer and every stale savepoint of a finished
    /// master.
    fn finish_master(&self) {
        let registry = &self.inner.registry;
        registry.repoint(self.inner.kind, self.inner.unit, self, None);
        registry.prune_savepoints(self.inner.unit);
    }

    /// Drops the parent -> child links of a finished tree. Children keep
    /// their link to the parent, so this breaks every reference cycle.
    fn release_children(&self) {
        let children = std::mem::take(&mut self.inner.state.lock().children);
        for child in &children {
            child.release_children();
        }
    }

    fn promote_saved(&self) {
        for child in self.children() {
            child.promote_saved();
            let mut state = child.inner.state.lock();
            if state.status == TransactionStatus::Saved {
                state.status = TransactionStatus::Committed;
                state.rollback_on_release = false;
            }
        }
    }

    fn ensure_status(
        &self,
        operation: &'static str,
        allowed: impl FnOnce(TransactionStatus) -> bool,
    ) -> TransactionResult<()> {
        if allowed(self.status()) {
            Ok(())
        } else {
            Err(self.illegal_status(operation))
        }
    }

    fn illegal_status(&self, operation: &'static str) -> TransactionError {
        TransactionError::IllegalStatus {
            id: self.id(),
            status: self.status(),
            operation,
        }
    }

    fn ensure_current(&self) -> TransactionResult<()> {
        match self.inner.registry.current(self.inner.kind, self.inner.unit) {
            Some(current) if current.ptr_eq(self) => Ok(()),
            current => Err(TransactionError::ScopeMismatch {
                found: self.id(),
                expected: current.map(|c| c.id()),
            }),
        }
    }

    fn fire(&self, mode: CallbackMode) {
        for pending in self.inner.callbacks.take_pending(mode) {
            pending.invoke(self);
        }
    }

    /// Fires `mode` on every descendant currently in `status` (children
    /// first), then on `self`.
    fn fire_local_tree(&self, mode: CallbackMode, status: TransactionStatus) {
        self.fire_descendants(mode, status);
        self.fire(mode);
    }

    fn fire_descendants(&self, mode: CallbackMode, status: TransactionStatus) {
        for child in self.children() {
            child.fire_descendants(mode, status);
            if child.status() == status {
                child.fire(mode);
            }
        }
    }

    /// Fires a master-relative `mode` on the whole tree, children first.
    fn fire_master_tree(&self, mode: CallbackMode) {
        for child in self.children() {
            child.fire_master_tree(mode);
        }
        self.fire(mode);
    }

    /// Hands the deferred variants of `mode` to the registry, children first.
    fn defer_master_tree(&self, mode: CallbackMode) {
        for deferral in [
            Deferral::InWorker,
            Deferral::AfterController,
            Deferral::InShutdown,
        ] {
            self.defer_tree(mode.deferred(deferral));
        }
    }

    fn defer_tree(&self, mode: CallbackMode) {
        for child in self.children() {
            child.defer_tree(mode);
        }
        for pending in self.inner.callbacks.take_pending(mode) {
            self.inner.registry.defer(pending, self.clone());
        }
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Transaction {}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind_name)
            .field("depth", &self.inner.depth)
            .field("status", &state.status)
            .field("rollback_reason", &state.rollback_reason)
            .finish()
    }
}
