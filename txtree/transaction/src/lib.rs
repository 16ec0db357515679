//! Nested and distributed transaction coordination.
//!
//! This crate decides *when* resource-level transaction primitives are issued.
//! Resources implement [`TransactionalResource`]; a [`TransactionRegistry`]
//! tracks the current transaction of each kind per execution unit, turns
//! nested begins into savepoints on the enclosing transaction, runs lifecycle
//! callbacks and coordinates [`DistributedTransaction`]s spanning several
//! resources.

pub mod callback;
pub mod config;
pub mod distributed;
pub mod error;
pub mod guard;
pub mod id;
pub mod registry;
pub mod resource;
pub mod status;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
pub mod transaction;

pub use callback::{
    Callback, CallbackHandle, CallbackMode, CallbackOptions, CallbackScheduler, Deferral, Outcome,
    Phase, Relative,
};
pub use config::TransactionConfig;
pub use distributed::{CompositeResource, DistributedTransaction};
pub use error::{IdError, ResourceError, Retryable, TransactionError, TransactionResult};
pub use guard::ScopeGuard;
pub use id::{
    ExecutionUnitId, KindId, TransactionId, TransactionIdGenerator,
    global_transaction_id_generator, init_global_transaction_id_generator,
};
pub use registry::{TransactionKind, TransactionRegistry};
pub use resource::{ResourceResult, TransactionalResource};
pub use status::{RollbackReason, TransactionStatus};
pub use transaction::Transaction;
