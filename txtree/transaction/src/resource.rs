//! The contract between the coordination core and concrete resources
//!
//! A resource adapter (SQL connection, object store, remote-call proxy) only
//! has to know how to open, close and checkpoint its own transaction scope.
//! Deciding *when* these primitives are issued is the job of
//! [`Transaction`](crate::Transaction).

use crate::error::ResourceError;

pub type ResourceResult = Result<(), ResourceError>;

/// Trait implemented by every resource that can take part in a transaction.
///
/// All methods are synchronous. Blocking I/O performed by an implementation is
/// outside the coordination core's concurrency contract.
pub trait TransactionalResource: Send + Sync {
    /// Human readable name used in diagnostics.
    fn name(&self) -> &str;

    /// Orders resources inside a distributed transaction. Resources with a
    /// lower priority are committed first, so the ones most likely to fail
    /// should report the lowest value.
    fn priority(&self) -> i32 {
        0
    }

    /// Open the resource-level transaction scope. Only issued for masters.
    fn execute_begin(&self) -> ResourceResult;

    /// Make the master's work durable.
    fn execute_commit(&self) -> ResourceResult;

    /// Discard the master's work.
    fn execute_rollback(&self) -> ResourceResult;

    fn execute_create_savepoint(&self, name: &str) -> ResourceResult;

    fn execute_rollback_to_savepoint(&self, name: &str) -> ResourceResult;

    fn execute_release_savepoint(&self, name: &str) -> ResourceResult;
}
