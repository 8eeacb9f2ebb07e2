//! Key-value store collaborator and the `kv.write` handler.
//!
//! `kv.write` takes `{"key": "...", "value": <json>}`. A `null` value deletes
//! the key. The step output records the previous value, so compensation can
//! restore it: undoing a write restores or deletes, undoing a delete rewrites.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{Value, json};
use stepwise_core::handler::{HandlerCapabilities, StepError, StepHandler};
use stepwise_core::workflow::context::ExecutionContext;
use stepwise_types::error::StoreError;

// ---------------------------------------------------------------------------
// KvStore
// ---------------------------------------------------------------------------

/// Key-value storage for JSON values.
///
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key does not exist.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send;

    /// Set a value for a key (upsert). Returns the previous value.
    fn set(&self, key: &str, value: Value) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send;

    /// Delete a key. Returns the removed value; no-op if absent.
    fn delete(&self, key: &str) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send;

    /// List all keys, sorted.
    fn list_keys(&self) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;
}

/// Process-local [`KvStore`].
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: DashMap<String, Value>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.insert(key.to_string(), value))
    }

    async fn delete(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.remove(key).map(|(_, v)| v))
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort_unstable();
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// kv.write
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WriteInput {
    key: String,
    #[serde(default)]
    value: Value,
}

/// Stored output of a write, also the compensation input.
#[derive(Debug, Deserialize)]
struct WriteRecord {
    key: String,
    #[serde(default)]
    previous: Value,
}

/// Writes (or, for `null`, deletes) a key in a [`KvStore`].
pub struct KvWriteHandler<S> {
    store: Arc<S>,
}

impl<S: KvStore> KvWriteHandler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Write `value`, or delete the key when `value` is `null`.
    async fn put(&self, key: &str, value: Value) -> Result<Option<Value>, StepError> {
        let previous = if value.is_null() {
            self.store.delete(key).await
        } else {
            self.store.set(key, value).await
        };
        previous.map_err(|e| StepError::new("StoreUnavailable", e.to_string()))
    }
}

impl<S: KvStore> StepHandler for KvWriteHandler<S> {
    fn name(&self) -> &str {
        "kv.write"
    }

    fn capabilities(&self) -> HandlerCapabilities {
        HandlerCapabilities {
            compensate: true,
            validate: true,
        }
    }

    async fn execute(&self, input: &Value, _ctx: &ExecutionContext) -> Result<Value, StepError> {
        let WriteInput { key, value } = serde_json::from_value(input.clone())
            .map_err(|e| StepError::fatal("InvalidInput", e.to_string()))?;

        let previous = self.put(&key, value.clone()).await?;
        tracing::debug!(key = key.as_str(), deleted = value.is_null(), "kv write");

        Ok(json!({
            "key": key,
            "value": value,
            "previous": previous.unwrap_or(Value::Null),
        }))
    }

    async fn compensate(&self, input: &Value, _ctx: &ExecutionContext) -> Result<(), StepError> {
        let WriteRecord { key, previous } = serde_json::from_value(input.clone())
            .map_err(|e| StepError::fatal("InvalidCompensationInput", e.to_string()))?;

        self.put(&key, previous).await?;
        tracing::debug!(key = key.as_str(), "kv write rolled back");
        Ok(())
    }

    fn validate(&self, input: &Value) -> bool {
        input
            .get("key")
            .and_then(Value::as_str)
            .is_some_and(|k| !k.is_empty())
    }
}
