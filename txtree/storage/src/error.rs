use miette::Diagnostic;
use thiserror::Error;
use txtree_transaction::{Retryable, TransactionError};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum StorageError {
    #[error("no transaction is active on store {0}")]
    #[diagnostic(help("writes must happen inside a transaction begun on this store"))]
    NoActiveTransaction(String),

    #[error("key {0} not found")]
    KeyNotFound(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transaction(#[from] TransactionError),
}

impl Retryable for StorageError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transaction(e) if e.is_transient())
    }
}
