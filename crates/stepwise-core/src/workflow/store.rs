//! Live-execution table keyed by idempotency key.
//!
//! `ExecutionStore` is the seam for a durable backing store; the engine ships
//! with `InMemoryExecutionStore` only.

use std::future::Future;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use stepwise_types::error::StoreError;

use super::execution::Execution;

/// Outcome of an insert-if-absent.
#[derive(Debug, Clone)]
pub enum Registration {
    /// The caller now owns the execution under this key.
    Registered,
    /// Another caller got there first; a snapshot of its execution.
    Existing(Execution),
}

/// Storage for in-flight and recently finished executions.
///
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
/// `insert_if_absent` must be atomic: two concurrent calls with the same key
/// must not both see `Registered`.
pub trait ExecutionStore: Send + Sync {
    /// Snapshot of the execution registered under `key`.
    fn find(&self, key: &str) -> impl Future<Output = Result<Option<Execution>, StoreError>> + Send;

    fn insert_if_absent(
        &self,
        key: &str,
        execution: Execution,
    ) -> impl Future<Output = Result<Registration, StoreError>> + Send;

    /// Replace the stored snapshot. Fails with `NotFound` if the key was evicted.
    fn update(&self, key: &str, execution: &Execution) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove the entry. Returns whether one existed.
    fn remove(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Number of live entries.
    fn len(&self) -> impl Future<Output = Result<usize, StoreError>> + Send;
}

/// Process-local store backed by a concurrent hash map.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    entries: DashMap<String, Execution>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    async fn find(&self, key: &str) -> Result<Option<Execution>, StoreError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn insert_if_absent(&self, key: &str, execution: Execution) -> Result<Registration, StoreError> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(existing) => Ok(Registration::Existing(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(execution);
                Ok(Registration::Registered)
            }
        }
    }

    async fn update(&self, key: &str, execution: &Execution) -> Result<(), StoreError> {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                *entry = execution.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries.len())
    }
}
