//! Distributed transactions
//!
//! A distributed transaction coordinates master transactions of several kinds
//! through a [`CompositeResource`]: committing it commits every member in
//! ascending priority order, rolling it back rolls back every member that is
//! still open, and savepoints fan out to the members under derived names.
//!
//! There is no prepare phase. A member that fails to commit leaves the members
//! after it open, and the ones before it committed.

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{TransactionError, TransactionResult};
use crate::guard::ScopeGuard;
use crate::status::{RollbackReason, TransactionStatus};
use crate::transaction::Transaction;

#[derive(Debug, Default)]
struct CompositeState {
    members: Vec<Transaction>,
    /// Savepoint name and the number of members attached when it was taken.
    savepoints: Vec<(String, usize)>,
}

/// The resource behind a distributed transaction.
#[derive(Debug, Default)]
pub struct CompositeResource {
    state: Mutex<CompositeState>,
}

fn member_savepoint(name: &str, member: &Transaction) -> String {
    format!("{name}_{}", member.id().raw())
}

impl CompositeResource {
    /// Creates a composite without members.
    pub fn new() -> Self {
        Self::default()
    }

    /// Member transactions in attach order.
    pub fn members(&self) -> Vec<Transaction> {
        self.state.lock().members.clone()
    }

    /// Highest priority among the members, 0 without members.
    pub fn priority(&self) -> i32 {
        self.state
            .lock()
            .members
            .iter()
            .map(Transaction::priority)
            .max()
            .unwrap_or(0)
    }

    /// Members sorted by ascending priority. The sort is stable, so equal
    /// priorities keep their attach order.
    fn ordered_members(&self) -> Vec<Transaction> {
        let mut members = self.members();
        members.sort_by_key(Transaction::priority);
        members
    }

    pub(crate) fn attach(&self, member: Transaction) {
        self.state.lock().members.push(member);
    }

    fn contains(&self, txn: &Transaction) -> bool {
        self.state.lock().members.iter().any(|m| m.ptr_eq(txn))
    }

    pub(crate) fn commit(&self) -> TransactionResult<()> {
        for member in self.ordered_members() {
            if member.status() == TransactionStatus::Committed {
                continue;
            }
            tracing::debug!(
                member = %member.id(),
                kind = %member.kind_name(),
                priority = member.priority(),
                "committing distributed member"
            );
            member.commit()?;
        }
        Ok(())
    }

    pub(crate) fn rollback(&self) -> TransactionResult<()> {
        let mut first_err = None;
        for member in self.ordered_members() {
            match member.status() {
                TransactionStatus::RolledBack => {}
                TransactionStatus::Committed => {
                    tracing::warn!(
                        member = %member.id(),
                        kind = %member.kind_name(),
                        "distributed member already committed, cannot roll it back"
                    );
                }
                _ => {
                    if let Err(err) = member.force_rollback(RollbackReason::Parent) {
                        tracing::error!(member = %member.id(), error = %err, "member rollback failed");
                        first_err.get_or_insert(err);
                    }
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub(crate) fn create_savepoint(&self, name: &str) -> TransactionResult<()> {
        let members = self.members();
        for member in members.iter().filter(|m| m.status() == TransactionStatus::Started) {
            member.create_savepoint(&member_savepoint(name, member))?;
        }
        self.state
            .lock()
            .savepoints
            .push((name.to_string(), members.len()));
        Ok(())
    }

    fn find_savepoint(&self, name: &str) -> TransactionResult<(usize, usize)> {
        let state = self.state.lock();
        state
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .map(|pos| (pos, state.savepoints[pos].1))
            .ok_or_else(|| TransactionError::UnknownSavepoint(name.to_string()))
    }

    /// Rolls every member back to its part of `name`. Members attached after
    /// the savepoint was taken are rolled back entirely and detached.
    pub(crate) fn rollback_to_savepoint(&self, name: &str) -> TransactionResult<()> {
        let (pos, count) = self.find_savepoint(name)?;
        let (kept, late) = {
            let mut state = self.state.lock();
            state.savepoints.truncate(pos + 1);
            let len = state.members.len();
            let late = state.members.split_off(count.min(len));
            (state.members.clone(), late)
        };

        let mut first_err = None;
        for member in late.into_iter().rev() {
            if let Err(err) = member.force_rollback(RollbackReason::Parent) {
                first_err.get_or_insert(err);
            }
        }
        for member in kept.iter().filter(|m| m.status() == TransactionStatus::Started) {
            if let Err(err) = member.rollback_to_savepoint(&member_savepoint(name, member)) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub(crate) fn release_savepoint(&self, name: &str) -> TransactionResult<()> {
        let (pos, count) = self.find_savepoint(name)?;
        let members = {
            let mut state = self.state.lock();
            state.savepoints.truncate(pos);
            state.members.iter().take(count).cloned().collect::<Vec<_>>()
        };
        for member in members.iter().filter(|m| m.status() == TransactionStatus::Started) {
            member.release_savepoint(&member_savepoint(name, member))?;
        }
        Ok(())
    }
}

/// A transaction whose resource is a [`CompositeResource`].
///
/// Dereferences to the underlying [`Transaction`], so commit, rollback,
/// savepoints and callbacks work the same way as for any other kind.
#[derive(Clone, Debug)]
pub struct DistributedTransaction {
    txn: Transaction,
    composite: Arc<CompositeResource>,
}

impl DistributedTransaction {
    pub(crate) fn from_transaction(txn: Transaction) -> Option<Self> {
        let composite = txn.composite()?;
        Some(Self { txn, composite })
    }

    /// Returns the underlying transaction.
    pub fn transaction(&self) -> &Transaction {
        &self.txn
    }

    /// Returns the attached members in attach order.
    pub fn members(&self) -> Vec<Transaction> {
        self.composite.members()
    }

    /// Attaches the master transaction behind `guard` as a member.
    ///
    /// On success the guard is detached: from now on the member is committed
    /// or rolled back with this transaction.
    pub fn attach(&self, guard: &mut ScopeGuard) -> TransactionResult<Transaction> {
        let member = guard.transaction().cloned().ok_or(TransactionError::Detached)?;
        let status = self.txn.status();
        if status != TransactionStatus::Started {
            return Err(TransactionError::IllegalStatus {
                id: self.txn.id(),
                status,
                operation: "attach a member to",
            });
        }
        if member.composite().is_some_and(|c| Arc::ptr_eq(&c, &self.composite)) {
            return Err(TransactionError::ParentMismatch(format!(
                "transaction {} cannot be attached to itself",
                member.id()
            )));
        }
        if !member.is_master() {
            return Err(TransactionError::ParentMismatch(format!(
                "transaction {} is nested, only masters can be attached",
                member.id()
            )));
        }
        if self.composite.contains(&member) {
            return Err(TransactionError::ParentMismatch(format!(
                "transaction {} is already attached to {}",
                member.id(),
                self.txn.id()
            )));
        }
        let member_status = member.status();
        if member_status != TransactionStatus::Started {
            return Err(TransactionError::ParentMismatch(format!(
                "transaction {} is {member_status}, only started transactions can be attached",
                member.id()
            )));
        }

        self.composite.attach(member.clone());
        guard.detach();
        tracing::debug!(
            txn = %self.txn.id(),
            member = %member.id(),
            kind = %member.kind_name(),
            "member attached to distributed transaction"
        );
        Ok(member)
    }
}

impl Deref for DistributedTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        &self.txn
    }
}
