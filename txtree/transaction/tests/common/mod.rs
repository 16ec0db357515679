#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use txtree_transaction::testutil::{Journal, RecordingResource};
use txtree_transaction::{Transaction, TransactionConfig, TransactionKind, TransactionRegistry};

pub struct Fixture {
    pub registry: TransactionRegistry,
    pub kind: TransactionKind,
    pub resource: Arc<RecordingResource>,
}

pub fn fixture() -> Fixture {
    fixture_with(TransactionConfig::without_retries())
}

pub fn fixture_with(config: TransactionConfig) -> Fixture {
    let resource = Arc::new(RecordingResource::new("sql"));
    let kind = TransactionKind::new("sql", resource.clone()).unwrap();
    Fixture {
        registry: TransactionRegistry::new(config),
        kind,
        resource,
    }
}

/// A kind whose resource writes into a shared journal.
pub fn journaled_kind(
    name: &str,
    priority: i32,
    journal: &Journal,
) -> (TransactionKind, Arc<RecordingResource>) {
    let resource = Arc::new(
        RecordingResource::new(name)
            .with_priority(priority)
            .with_journal(journal.clone()),
    );
    (TransactionKind::new(name, resource.clone()).unwrap(), resource)
}

pub fn fast_retries(max_retries: u32) -> TransactionConfig {
    TransactionConfig {
        max_retries,
        retry_backoff: Duration::ZERO,
        retry_jitter: false,
        ..TransactionConfig::default()
    }
}

/// Shared event log for callback ordering assertions.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// A callback appending `"{label}:{txn id}"`.
    pub fn recorder(&self, label: &'static str) -> impl Fn(&Transaction) + Send + Sync + 'static {
        let log = self.clone();
        move |txn| log.push(format!("{label}:{}", txn.id()))
    }
}
