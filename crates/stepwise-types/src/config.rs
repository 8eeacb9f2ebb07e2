//! Engine configuration types for stepwise.
//!
//! `EngineConfig` represents the `config.toml` that controls the live
//! execution table's retention, the idempotency wait, deadline enforcement,
//! and the fallback retry policy.

use serde::{Deserialize, Serialize};

use crate::workflow::RetryPolicy;

/// Top-level configuration for the orchestration engine.
///
/// All fields have sensible defaults, so an empty file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a finished execution stays observable to duplicate callers.
    #[serde(default = "default_completed_retention_ms")]
    pub completed_retention_ms: u64,

    /// Poll interval while waiting on an in-flight execution with the same key.
    #[serde(default = "default_idempotency_poll_interval_ms")]
    pub idempotency_poll_interval_ms: u64,

    /// Ceiling on how long a duplicate caller waits before timing out.
    #[serde(default = "default_idempotency_wait_timeout_ms")]
    pub idempotency_wait_timeout_ms: u64,

    /// Treat `WorkflowDefinition::timeout_secs` as a hard deadline.
    #[serde(default)]
    pub enforce_definition_timeout: bool,

    /// Retry policy for definitions that do not declare one.
    #[serde(default)]
    pub default_retry_policy: RetryPolicy,
}

fn default_completed_retention_ms() -> u64 {
    60_000
}

fn default_idempotency_poll_interval_ms() -> u64 {
    100
}

fn default_idempotency_wait_timeout_ms() -> u64 {
    30_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            completed_retention_ms: default_completed_retention_ms(),
            idempotency_poll_interval_ms: default_idempotency_poll_interval_ms(),
            idempotency_wait_timeout_ms: default_idempotency_wait_timeout_ms(),
            enforce_definition_timeout: false,
            default_retry_policy: RetryPolicy::default(),
        }
    }
}
