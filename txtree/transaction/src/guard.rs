use std::thread;

use crate::status::RollbackReason;
use crate::transaction::Transaction;

/// Scope guard returned by every begin.
///
/// Dropping the guard while its transaction is still open rolls the
/// transaction back: with reason `EXCEPTION` when an error or a panic is
/// unwinding through the scope, `IMPLICIT` otherwise.
#[must_use = "dropping the guard rolls the transaction back"]
pub struct ScopeGuard {
    txn: Option<Transaction>,
}

impl ScopeGuard {
    pub(crate) fn new(txn: Transaction) -> Self {
        Self { txn: Some(txn) }
    }

    /// The guarded transaction, `None` once detached.
    pub fn transaction(&self) -> Option<&Transaction> {
        self.txn.as_ref()
    }

    /// Returns true until the guard is detached.
    pub fn is_attached(&self) -> bool {
        self.txn.is_some()
    }

    /// Hands the transaction's lifetime over to someone else. The guard does
    /// nothing on drop afterwards.
    pub fn detach(&mut self) -> Option<Transaction> {
        self.txn.take()
    }

    /// Records that the scope is being left with an error, so the rollback on
    /// drop uses reason `EXCEPTION`.
    pub fn fail(&mut self) {
        if let Some(txn) = &self.txn {
            txn.mark_failed();
        }
    }

    /// Ends the scope now. Same as dropping the guard.
    pub fn release(self) {}
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let Some(txn) = self.txn.take() else {
            return;
        };
        if !txn.rollback_on_release() || !txn.status().is_open() {
            return;
        }
        let reason = if txn.has_failed() || thread::panicking() {
            RollbackReason::Exception
        } else {
            RollbackReason::Implicit
        };
        if let Err(err) = txn.force_rollback(reason) {
            tracing::error!(txn = %txn.id(), %reason, error = %err, "rollback on scope exit failed");
        }
    }
}

impl std::fmt::Debug for ScopeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeGuard")
            .field("txn", &self.txn.as_ref().map(Transaction::id))
            .finish()
    }
}
