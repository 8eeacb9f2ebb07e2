//! Idempotency resolver: maps a caller key to at most one execution.
//!
//! A second caller with a key that is already registered never starts a new
//! execution. It either observes the finished one or polls until the owner
//! reaches a terminal state.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use stepwise_types::config::EngineConfig;
use stepwise_types::error::StoreError;

use super::execution::Execution;
use super::store::{ExecutionStore, Registration};

/// Errors from waiting on another caller's execution.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdempotencyError {
    #[error("timed out after {waited_ms}ms waiting for execution with key '{key}'")]
    WaitTimeout { key: String, waited_ms: u64 },

    #[error("execution with key '{key}' was evicted before it finished")]
    Evicted { key: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Floor for the wait loop's sleep between store reads.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Lookup, registration and wait-for-terminal over an [`ExecutionStore`].
#[derive(Debug)]
pub struct IdempotencyResolver<S> {
    store: Arc<S>,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl<S: ExecutionStore> IdempotencyResolver<S> {
    /// A zero `poll_interval` is raised to [`MIN_POLL_INTERVAL`].
    pub fn new(store: Arc<S>, poll_interval: Duration, wait_timeout: Duration) -> Self {
        Self {
            store,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            wait_timeout,
        }
    }

    pub fn from_config(store: Arc<S>, config: &EngineConfig) -> Self {
        Self::new(
            store,
            Duration::from_millis(config.idempotency_poll_interval_ms),
            Duration::from_millis(config.idempotency_wait_timeout_ms),
        )
    }

    /// A fresh key for callers that do not supply one.
    ///
    /// Generated keys are unique, so runs started with them never deduplicate.
    pub fn generate_key(definition_id: &str, session_id: &str) -> String {
        format!("{definition_id}:{session_id}:{}", Uuid::now_v7())
    }

    pub async fn find(&self, key: &str) -> Result<Option<Execution>, StoreError> {
        self.store.find(key).await
    }

    /// Atomically claim `key` for `execution`.
    pub async fn register(&self, key: &str, execution: Execution) -> Result<Registration, StoreError> {
        let registration = self.store.insert_if_absent(key, execution).await?;
        if let Registration::Existing(ref existing) = registration {
            tracing::debug!(key, execution_id = %existing.id, "lost registration race to existing execution");
        }
        Ok(registration)
    }

    /// Poll until the execution under `key` is terminal and its outcome is
    /// recorded.
    pub async fn await_terminal(&self, key: &str) -> Result<Execution, IdempotencyError> {
        let start = Instant::now();
        loop {
            match self.store.find(key).await? {
                Some(execution) if execution.is_settled() => return Ok(execution),
                Some(execution) => {
                    tracing::trace!(key, execution_id = %execution.id, status = %execution.status, "waiting on in-flight execution");
                }
                None => {
                    return Err(IdempotencyError::Evicted { key: key.to_string() });
                }
            }

            let waited = start.elapsed();
            if waited >= self.wait_timeout {
                return Err(IdempotencyError::WaitTimeout {
                    key: key.to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.poll_interval.min(self.wait_timeout - waited)).await;
        }
    }
}
