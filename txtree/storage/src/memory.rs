use dashmap::DashMap;
use parking_lot::Mutex;
use txtree_transaction::{ExecutionUnitId, ResourceError, ResourceResult, TransactionalResource};

use crate::error::{StorageError, StorageResult};

/// Restores one key to the value it had before a write.
#[derive(Debug, Clone)]
struct UndoEntry {
    key: String,
    previous: Option<String>,
}

/// The open write scope of a store, owned by one execution unit.
#[derive(Debug)]
struct WriteScope {
    owner: ExecutionUnitId,
    undo_buffer: Vec<UndoEntry>,
    /// Savepoint name and the undo buffer length when it was created.
    savepoints: Vec<(String, usize)>,
}

/// An in-memory key-value store with undo-log based transactions.
///
/// One execution unit writes at a time: beginning a transaction while another
/// unit holds the write scope fails with a transient error, so a retrying
/// caller simply waits its turn. Reads are not isolated and see uncommitted
/// writes.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    priority: i32,
    data: DashMap<String, String>,
    scope: Mutex<Option<WriteScope>>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            data: DashMap::new(),
            scope: Mutex::new(None),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).map(|v| v.value().clone())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true while a transaction holds the write scope.
    pub fn in_transaction(&self) -> bool {
        self.scope.lock().is_some()
    }

    /// Writes `value` under `key`, returning the previous value.
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) -> StorageResult<Option<String>> {
        let key = key.into();
        self.write(|data| {
            let previous = data.insert(key.clone(), value.into());
            (UndoEntry { key, previous: previous.clone() }, previous)
        })
    }

    /// Removes `key`, returning its value.
    pub fn delete(&self, key: &str) -> StorageResult<String> {
        if !self.data.contains_key(key) {
            return Err(StorageError::KeyNotFound(key.to_string()));
        }
        self.write(|data| {
            let previous = data.remove(key).map(|(_, v)| v);
            (
                UndoEntry {
                    key: key.to_string(),
                    previous: previous.clone(),
                },
                previous.unwrap_or_default(),
            )
        })
    }

    fn write<T>(&self, op: impl FnOnce(&DashMap<String, String>) -> (UndoEntry, T)) -> StorageResult<T> {
        let mut scope = self.scope.lock();
        let scope = scope
            .as_mut()
            .filter(|s| s.owner == ExecutionUnitId::current())
            .ok_or_else(|| StorageError::NoActiveTransaction(self.name.clone()))?;
        let (undo, result) = op(&self.data);
        scope.undo_buffer.push(undo);
        Ok(result)
    }

    /// Applies `entries` newest first.
    fn undo(&self, entries: Vec<UndoEntry>) -> usize {
        let count = entries.len();
        for entry in entries.into_iter().rev() {
            match entry.previous {
                Some(value) => {
                    self.data.insert(entry.key, value);
                }
                None => {
                    self.data.remove(&entry.key);
                }
            }
        }
        count
    }

    fn take_scope(&self) -> Result<WriteScope, ResourceError> {
        self.scope
            .lock()
            .take()
            .ok_or_else(|| ResourceError::failed(format!("no transaction is active on {}", self.name)))
    }

    fn with_savepoint<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut WriteScope, usize) -> T,
    ) -> Result<T, ResourceError> {
        let mut scope = self.scope.lock();
        let scope = scope
            .as_mut()
            .ok_or_else(|| ResourceError::failed(format!("no transaction is active on {}", self.name)))?;
        let pos = scope
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| ResourceError::failed(format!("unknown savepoint {name}")))?;
        Ok(f(scope, pos))
    }
}

impl TransactionalResource for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn execute_begin(&self) -> ResourceResult {
        let mut scope = self.scope.lock();
        if scope.is_some() {
            return Err(ResourceError::transient(format!(
                "store {} is locked by another transaction",
                self.name
            )));
        }
        *scope = Some(WriteScope {
            owner: ExecutionUnitId::current(),
            undo_buffer: Vec::new(),
            savepoints: Vec::new(),
        });
        tracing::trace!(store = %self.name, "write scope opened");
        Ok(())
    }

    fn execute_commit(&self) -> ResourceResult {
        let scope = self.take_scope()?;
        tracing::trace!(store = %self.name, writes = scope.undo_buffer.len(), "write scope committed");
        Ok(())
    }

    fn execute_rollback(&self) -> ResourceResult {
        let scope = self.take_scope()?;
        let undone = self.undo(scope.undo_buffer);
        tracing::debug!(store = %self.name, undone, "write scope rolled back");
        Ok(())
    }

    fn execute_create_savepoint(&self, name: &str) -> ResourceResult {
        let mut scope = self.scope.lock();
        let scope = scope
            .as_mut()
            .ok_or_else(|| ResourceError::failed(format!("no transaction is active on {}", self.name)))?;
        let mark = scope.undo_buffer.len();
        scope.savepoints.push((name.to_string(), mark));
        Ok(())
    }

    fn execute_rollback_to_savepoint(&self, name: &str) -> ResourceResult {
        let undone = self.with_savepoint(name, |scope, pos| {
            let mark = scope.savepoints[pos].1;
            // later savepoints are gone, this one survives
            scope.savepoints.truncate(pos + 1);
            scope.undo_buffer.split_off(mark)
        })?;
        let undone = self.undo(undone);
        tracing::debug!(store = %self.name, savepoint = name, undone, "rolled back to savepoint");
        Ok(())
    }

    fn execute_release_savepoint(&self, name: &str) -> ResourceResult {
        self.with_savepoint(name, |scope, pos| scope.savepoints.truncate(pos))
    }
}
