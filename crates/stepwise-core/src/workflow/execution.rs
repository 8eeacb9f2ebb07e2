//! Runtime step and execution records.
//!
//! An `Execution` owns deep copies of its definition's step templates, each
//! augmented with mutable status fields. Step transitions are forward-only and
//! return `TransitionError` on an illegal move.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use stepwise_types::workflow::{
    ExecutionStatus, RetryPolicy, RunMetadata, RunResult, StepFailure, StepStatus, StepTemplate,
    WorkflowDefinition,
};

use super::context::ExecutionContext;

/// Rejected step status transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("step '{step_id}' cannot move from {from} to {to}")]
pub struct TransitionError {
    pub step_id: String,
    pub from: StepStatus,
    pub to: StepStatus,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A step template plus its execution state.
#[derive(Debug, Clone)]
pub struct Step {
    pub id: String,
    pub handler: String,
    pub input: Value,
    /// Resolved retry budget (template override or policy default).
    pub max_retries: u32,
    pub status: StepStatus,
    /// Retries actually consumed.
    pub retry_count: u32,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Set when this step's rollback failed.
    pub compensation_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn from_template(template: &StepTemplate, policy: &RetryPolicy) -> Self {
        Self {
            id: template.id.clone(),
            handler: template.handler.clone(),
            input: template.input.clone(),
            max_retries: template.effective_max_retries(policy),
            status: StepStatus::Pending,
            retry_count: 0,
            output: None,
            error: None,
            compensation_error: None,
            started_at: None,
            completed_at: None,
        }
    }

    fn transition(&mut self, allowed: &[StepStatus], to: StepStatus) -> Result<(), TransitionError> {
        if !allowed.contains(&self.status) {
            return Err(TransitionError {
                step_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<(), TransitionError> {
        self.transition(&[StepStatus::Pending], StepStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_completed(&mut self, output: Value, retries: u32) -> Result<(), TransitionError> {
        self.transition(&[StepStatus::Running], StepStatus::Completed)?;
        self.output = Some(output);
        self.retry_count = retries;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Pending is allowed so that lookup and validation failures, which
    /// happen before the step starts, can still be recorded.
    pub fn mark_failed(&mut self, message: impl Into<String>, retries: u32) -> Result<(), TransitionError> {
        self.transition(&[StepStatus::Pending, StepStatus::Running], StepStatus::Failed)?;
        self.error = Some(message.into());
        self.retry_count = retries;
        Ok(())
    }

    /// Only completed steps are rolled back.
    pub fn mark_compensating(&mut self) -> Result<(), TransitionError> {
        self.transition(&[StepStatus::Completed], StepStatus::Compensating)
    }

    /// Whether the step finished successfully, even if since rolled back.
    pub fn has_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One run of a workflow definition.
#[derive(Debug, Clone)]
pub struct Execution {
    pub id: Uuid,
    pub definition_id: String,
    pub definition_name: String,
    pub session_id: String,
    pub status: ExecutionStatus,
    /// Index of the step currently (or last) executing.
    pub current_step: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub context: ExecutionContext,
    pub idempotency_key: String,
    pub steps: Vec<Step>,
    pub error: Option<StepFailure>,
    /// The result handed to the original caller, replayed to duplicates.
    pub outcome: Option<RunResult>,
}

impl Execution {
    pub fn new(
        definition: &WorkflowDefinition,
        policy: &RetryPolicy,
        context: ExecutionContext,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            definition_id: definition.id.clone(),
            definition_name: definition.name.clone(),
            session_id: context.session_id.clone(),
            status: ExecutionStatus::Pending,
            current_step: 0,
            started_at: Utc::now(),
            completed_at: None,
            context,
            idempotency_key: idempotency_key.into(),
            steps: definition
                .steps
                .iter()
                .map(|t| Step::from_template(t, policy))
                .collect(),
            error: None,
            outcome: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Terminal and the outcome is available to duplicate callers.
    pub fn is_settled(&self) -> bool {
        self.is_terminal() && self.outcome.is_some()
    }

    pub fn steps_completed(&self) -> u32 {
        self.steps.iter().filter(|s| s.has_completed()).count() as u32
    }

    /// Retries consumed across all steps.
    pub fn retries_used(&self) -> u32 {
        self.steps.iter().map(|s| s.retry_count).sum()
    }

    /// Indices of completed steps, most recently completed first.
    ///
    /// Ties on `completed_at` are broken by declaration order, later first.
    pub fn completed_steps_in_reverse(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == StepStatus::Completed)
            .map(|(i, _)| i)
            .collect();
        indices.sort_by(|&a, &b| {
            (self.steps[b].completed_at, b).cmp(&(self.steps[a].completed_at, a))
        });
        indices
    }

    /// Output of the last completed step in declaration order.
    pub fn last_output(&self) -> Option<&Value> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.has_completed())
            .and_then(|s| s.output.as_ref())
    }

    /// Finalize timestamps and build the caller-facing result.
    pub fn summarize(&mut self, duration_ms: u64) -> RunResult {
        self.completed_at = Some(Utc::now());
        let success = self.status == ExecutionStatus::Completed;
        RunResult {
            success,
            execution_id: self.id,
            result: if success { self.last_output().cloned() } else { None },
            error: self.error.clone(),
            compensated: self.status == ExecutionStatus::Compensated,
            metadata: RunMetadata {
                duration_ms,
                steps_completed: self.steps_completed(),
                retries_used: self.retries_used(),
            },
        }
    }
}
