use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

/// Lifecycle status of a transaction.
///
/// `Committed` and `RolledBack` are terminal. `Saved` is only ever reached by
/// nested transactions: the nested unit finished cleanly and the outcome is
/// decided by the enclosing transaction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Started,
    Saved,
    Committed,
    RolledBack,
}

impl TransactionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Started | Self::Saved)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }

    /// Returns true if `self -> target` is in the transition table.
    pub fn can_transition_to(&self, target: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, target),
            (Started, Saved | Committed | RolledBack) | (Saved, Committed | RolledBack)
        )
    }
}

/// Why a transaction was rolled back. Recorded once, by the first rollback.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackReason {
    Unknown,
    /// An error was propagating through the transaction's scope.
    Exception,
    /// The caller asked for the rollback.
    Explicit,
    /// The scope guard was released without a decision.
    Implicit,
    /// Cascaded from an ancestor's rollback.
    Parent,
}
