//! In-memory transactional storage.
//!
//! [`MemoryStore`] is a key-value store implementing
//! [`TransactionalResource`](txtree_transaction::TransactionalResource): a
//! master transaction opens a write scope on it, nested transactions and
//! manual savepoints become marks in its undo log.

pub mod error;
pub mod memory;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
