use miette::Diagnostic;
use thiserror::Error;

use crate::callback::CallbackMode;
use crate::id::TransactionId;
use crate::status::TransactionStatus;

pub type TransactionResult<T> = std::result::Result<T, TransactionError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("transaction id overflow, reached {0}")]
    TransactionIdOverflow(u64),

    #[error("kind id overflow, reached {0}")]
    KindIdOverflow(u64),
}

/// Errors reported by a [`TransactionalResource`](crate::TransactionalResource).
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum ResourceError {
    /// A recoverable condition such as a deadlock or a lock wait timeout.
    #[error("transient resource error: {0}")]
    #[diagnostic(help("the unit of work may be retried"))]
    Transient(String),

    #[error("resource error: {0}")]
    Failed(String),
}

impl ResourceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum TransactionError {
    #[error("cannot {operation} transaction {id} in status {status}")]
    IllegalStatus {
        id: TransactionId,
        status: TransactionStatus,
        operation: &'static str,
    },

    #[error("unknown savepoint {0}")]
    UnknownSavepoint(String),

    #[error("parent mismatch: {0}")]
    ParentMismatch(String),

    #[error("transaction {found} is not the current transaction (current: {expected:?})")]
    #[diagnostic(help("transactions must be closed in the reverse order they were opened"))]
    ScopeMismatch {
        found: TransactionId,
        expected: Option<TransactionId>,
    },

    #[error("callback mode {mode} is not reachable from status {status}")]
    UnreachableMode {
        mode: CallbackMode,
        status: TransactionStatus,
    },

    #[error("invalid callback mode {0}")]
    InvalidMode(CallbackMode),

    #[error("scope guard is detached")]
    Detached,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Resource(#[from] ResourceError),

    #[error("id error: {0}")]
    Id(#[from] IdError),
}

/// Errors that can tell whether the failed unit of work is worth retrying.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for TransactionError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Resource(e) if e.is_transient())
    }
}

impl Retryable for ResourceError {
    fn is_transient(&self) -> bool {
        ResourceError::is_transient(self)
    }
}
