//! Workflow domain types for stepwise.
//!
//! Defines the immutable workflow template (`WorkflowDefinition`, `StepTemplate`,
//! `CompensationTemplate`), the retry configuration applied to step handlers
//! (`RetryPolicy`, `BackoffStrategy`), the lifecycle enums for steps and
//! executions, and the caller-facing `RunResult`.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// An immutable workflow template.
///
/// A definition is never mutated by the engine. Each run deep-copies the step
/// templates into its own execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable identifier for the workflow (e.g. "ticket-intake").
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered list of steps, executed strictly in declaration order.
    pub steps: Vec<StepTemplate>,
    /// Optional compensation templates. When non-empty, a failed run rolls
    /// back its completed steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensation: Vec<CompensationTemplate>,
    /// Overall timeout in seconds. Advisory unless the engine enforces it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Retry policy for every step. Falls back to the engine default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl WorkflowDefinition {
    /// Whether this definition declares any compensation steps.
    pub fn has_compensation(&self) -> bool {
        !self.compensation.is_empty()
    }

    /// Look up the compensation template targeting `step_id`, if any.
    pub fn compensation_for(&self, step_id: &str) -> Option<&CompensationTemplate> {
        self.compensation.iter().find(|c| c.step_id == step_id)
    }

    /// The retry policy for this definition, or `fallback` if none is declared.
    pub fn effective_retry_policy<'a>(&'a self, fallback: &'a RetryPolicy) -> &'a RetryPolicy {
        self.retry_policy.as_ref().unwrap_or(fallback)
    }
}

// ---------------------------------------------------------------------------
// Step Template
// ---------------------------------------------------------------------------

/// A single step in a workflow. Pure data; carries no execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTemplate {
    /// Step ID, unique within a definition.
    pub id: String,
    /// Name of the registered handler that executes this step.
    pub handler: String,
    /// Input payload passed to the handler.
    #[serde(default)]
    pub input: serde_json::Value,
    /// Retry budget for this step (number of retries after the first try).
    /// Defaults to `max_attempts - 1` of the effective retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl StepTemplate {
    /// Resolve the retry budget for this step against a policy.
    pub fn effective_max_retries(&self, policy: &RetryPolicy) -> u32 {
        self.max_retries
            .unwrap_or_else(|| policy.max_attempts.saturating_sub(1))
    }
}

/// Compensation declared for a forward step.
///
/// By default a completed step is rolled back through its own handler's
/// compensating action, fed with the step's stored output. A template can
/// redirect the rollback to another handler and/or override the input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationTemplate {
    /// ID of the forward step this compensation undoes.
    pub step_id: String,
    /// Handler whose compensating action runs (defaults to the step's handler).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    /// Input for the compensating action (defaults to the step's output).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Retry configuration applied to step handler failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay growth between attempts.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Base delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Random perturbation factor in [0, 1].
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// Case-insensitive substrings identifying retryable error classes.
    #[serde(default = "default_retryable_errors")]
    pub retryable_errors: Vec<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_retryable_errors() -> Vec<String> {
    ["timeout", "rate limit", "network", "unavailable", "econnreset"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
            retryable_errors: default_retryable_errors(),
        }
    }
}

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// `base * attempt`.
    Linear,
    /// `base * 2^(attempt - 1)`.
    #[default]
    Exponential,
}

// ---------------------------------------------------------------------------
// Execution Status
// ---------------------------------------------------------------------------

/// Status of a single runtime step.
///
/// Forward transitions only: pending -> running -> completed | failed.
/// `Compensating` is a terminal side-state entered during rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Compensating => "compensating",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensated,
}

impl ExecutionStatus {
    /// Whether the execution has finished and will not change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Compensated
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Compensated => "compensated",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Run Result
// ---------------------------------------------------------------------------

/// Outcome of one `run` call, also stored for late duplicate callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub success: bool,
    pub execution_id: Uuid,
    /// Output of the last step on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// The failure that aborted the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    /// Whether a compensation pass was attempted.
    pub compensated: bool,
    pub metadata: RunMetadata,
}

/// Timing and accounting for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub duration_ms: u64,
    pub steps_completed: u32,
    pub retries_used: u32,
}

/// Why a run was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A step referenced a handler that is not registered.
    HandlerNotFound,
    /// A handler's validator rejected the step input.
    ValidationRejected,
    /// A handler failed with a non-retryable error or exhausted its retries.
    StepFailed,
    /// The enforced definition deadline elapsed.
    Timeout,
}

/// The single error surfaced for an aborted run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    /// Step that failed (absent for whole-run timeouts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_id {
            Some(step_id) => write!(f, "step '{}': {}", step_id, self.message),
            None => f.write_str(&self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
