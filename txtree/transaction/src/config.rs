use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);
const DEFAULT_MAX_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Configuration of a [`TransactionRegistry`](crate::TransactionRegistry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// How many times a runnable transaction is retried after a transient
    /// resource error (0 disables retries).
    pub max_retries: u32,

    /// Backoff before retry `n` is `retry_backoff * n`.
    pub retry_backoff: Duration,

    /// Upper bound of a single backoff.
    pub max_retry_backoff: Duration,

    /// Add up to 50% random jitter to each backoff.
    pub retry_jitter: bool,

    /// Mark the parent rollback-only when a nested transaction is rolled back
    /// implicitly by its scope guard. Committing a rollback-only transaction
    /// fails with an illegal status error.
    pub poison_parent_on_implicit_rollback: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_retry_backoff: DEFAULT_MAX_RETRY_BACKOFF,
            retry_jitter: true,
            poison_parent_on_implicit_rollback: true,
        }
    }
}

impl TransactionConfig {
    /// A configuration without retries, for callers that handle transient
    /// errors themselves.
    pub fn without_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}
