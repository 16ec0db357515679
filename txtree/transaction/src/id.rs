//! Identity management for transactions
//!
//! This module provides the identifiers a transaction tree is keyed by: the
//! process-unique [`TransactionId`] (which also names savepoints), the
//! [`KindId`] distinguishing transaction types, and the [`ExecutionUnitId`]
//! that scopes "current transaction" lookups.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use serde::{Deserialize, Serialize};

use crate::error::IdError;

/// Process-unique identifier of a transaction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Prefix of the savepoint names derived from transaction ids.
    pub const SAVEPOINT_PREFIX: &'static str = "SP";

    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value of the id.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Returns the name of the savepoint a nested transaction with this id
    /// creates on its parent.
    pub fn savepoint_id(&self) -> String {
        format!("{}{}", Self::SAVEPOINT_PREFIX, self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a transaction type. Two kinds backed by the same resource are
/// still distinct types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KindId(u64);

impl KindId {
    /// Reserved for distributed transactions.
    pub const DISTRIBUTED: KindId = KindId(0);

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The execution unit a transaction tree belongs to. Every OS thread is its
/// own unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionUnitId(ThreadId);

impl ExecutionUnitId {
    pub fn current() -> Self {
        Self(thread::current().id())
    }
}

/// Monotonic generator for [`TransactionId`]s.
pub struct TransactionIdGenerator {
    counter: AtomicU64,
}

impl TransactionIdGenerator {
    /// Create a new transaction id generator
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    /// Create a new transaction id generator with a starting value
    pub fn with_start(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
        }
    }

    /// Generate the next transaction id
    pub fn next(&self) -> Result<TransactionId, IdError> {
        next_raw(&self.counter)
            .map(TransactionId)
            .map_err(IdError::TransactionIdOverflow)
    }

    /// Get the next id without incrementing
    pub fn current(&self) -> TransactionId {
        TransactionId(self.counter.load(Ordering::SeqCst))
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn next_raw(counter: &AtomicU64) -> Result<u64, u64> {
    let mut cur = counter.load(Ordering::SeqCst);
    loop {
        if cur == u64::MAX {
            return Err(cur);
        }
        match counter.compare_exchange_weak(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return Ok(cur),
            Err(actual) => cur = actual,
        }
    }
}

static GLOBAL_TRANSACTION_ID_GENERATOR: OnceLock<Arc<TransactionIdGenerator>> = OnceLock::new();
// Starts at 1, 0 is `KindId::DISTRIBUTED`.
static KIND_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Get the global transaction id generator instance
pub fn global_transaction_id_generator() -> Arc<TransactionIdGenerator> {
    GLOBAL_TRANSACTION_ID_GENERATOR
        .get_or_init(|| Arc::new(TransactionIdGenerator::new()))
        .clone()
}

/// Initialize the global transaction id generator with a specific starting value.
/// This should only be called once during system initialization
pub fn init_global_transaction_id_generator(start: u64) -> Result<(), &'static str> {
    GLOBAL_TRANSACTION_ID_GENERATOR
        .set(Arc::new(TransactionIdGenerator::with_start(start)))
        .map_err(|_| "Global transaction id generator already initialized")
}

pub(crate) fn next_kind_id() -> Result<KindId, IdError> {
    next_raw(&KIND_ID_COUNTER)
        .map(KindId)
        .map_err(IdError::KindIdOverflow)
}
