//! In-memory resources for tests.

use std::mem::discriminant;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ResourceError;
use crate::resource::{ResourceResult, TransactionalResource};

/// A resource-level operation as seen by a [`RecordingResource`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    Begin,
    Commit,
    Rollback,
    CreateSavepoint(String),
    RollbackToSavepoint(String),
    ReleaseSavepoint(String),
}

/// Operations of several resources in the order they were issued.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<(String, Op)>>>);

impl Journal {
    pub fn entries(&self) -> Vec<(String, Op)> {
        self.0.lock().clone()
    }

    fn push(&self, resource: &str, op: Op) {
        self.0.lock().push((resource.to_string(), op));
    }
}

/// A resource that records every operation it receives.
///
/// Failures are injected with [`fail_next`](Self::fail_next). A failing
/// operation is still recorded.
#[derive(Debug)]
pub struct RecordingResource {
    name: String,
    priority: i32,
    ops: Mutex<Vec<Op>>,
    failures: Mutex<Vec<(Op, ResourceError)>>,
    journal: Option<Journal>,
}

impl RecordingResource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            ops: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            journal: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    pub fn count(&self, op: &Op) -> usize {
        self.ops.lock().iter().filter(|o| *o == op).count()
    }

    pub fn count_matching(&self, f: impl Fn(&Op) -> bool) -> usize {
        self.ops.lock().iter().filter(|o| f(o)).count()
    }

    pub fn clear(&self) {
        self.ops.lock().clear();
    }

    /// Makes the next operation of the same variant as `op` fail with
    /// `error`. Savepoint names are ignored.
    pub fn fail_next(&self, op: Op, error: ResourceError) {
        self.failures.lock().push((op, error));
    }

    fn record(&self, op: Op) -> ResourceResult {
        let failure = {
            let mut failures = self.failures.lock();
            failures
                .iter()
                .position(|(f, _)| discriminant(f) == discriminant(&op))
                .map(|pos| failures.remove(pos).1)
        };
        if let Some(journal) = &self.journal {
            journal.push(&self.name, op.clone());
        }
        self.ops.lock().push(op);
        failure.map_or(Ok(()), Err)
    }
}

impl TransactionalResource for RecordingResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn execute_begin(&self) -> ResourceResult {
        self.record(Op::Begin)
    }

    fn execute_commit(&self) -> ResourceResult {
        self.record(Op::Commit)
    }

    fn execute_rollback(&self) -> ResourceResult {
        self.record(Op::Rollback)
    }

    fn execute_create_savepoint(&self, name: &str) -> ResourceResult {
        self.record(Op::CreateSavepoint(name.to_string()))
    }

    fn execute_rollback_to_savepoint(&self, name: &str) -> ResourceResult {
        self.record(Op::RollbackToSavepoint(name.to_string()))
    }

    fn execute_release_savepoint(&self, name: &str) -> ResourceResult {
        self.record(Op::ReleaseSavepoint(name.to_string()))
    }
}
