//! Best-effort rollback of completed steps.
//!
//! ```text
//! Steps:        [a] -> [b] -> [c] -> [d FAILS]
//! Compensation:               [c'] -> [b'] -> [a']
//! ```
//!
//! A failed compensation is recorded and logged; the remaining steps are
//! still rolled back.

use serde_json::Value;

use stepwise_types::workflow::WorkflowDefinition;

use crate::handler::{HandlerRegistry, StepError};

use super::execution::Execution;

/// Why a single step could not be rolled back.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompensationError {
    #[error("compensation handler '{handler}' for step '{step_id}' is not registered")]
    HandlerNotFound { step_id: String, handler: String },

    #[error("compensation of step '{step_id}' failed: {source}")]
    Failed {
        step_id: String,
        #[source]
        source: StepError,
    },
}

impl CompensationError {
    pub fn step_id(&self) -> &str {
        match self {
            CompensationError::HandlerNotFound { step_id, .. } | CompensationError::Failed { step_id, .. } => {
                step_id
            }
        }
    }
}

/// What a compensation pass did, in the order it did it.
#[derive(Debug, Clone, Default)]
pub struct CompensationReport {
    /// Steps whose compensation was invoked (or whose handler was missing).
    pub attempted: Vec<String>,
    pub succeeded: Vec<String>,
    /// Completed steps whose handler has no compensating action.
    pub skipped: Vec<String>,
    pub failed: Vec<CompensationError>,
}

impl CompensationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Runs compensating actions for an execution's completed steps.
pub struct CompensationRunner;

impl CompensationRunner {
    /// Roll back every completed step of `execution`, most recent first.
    ///
    /// A compensation template for a step may redirect its rollback to another
    /// handler and may supply the input. Otherwise the step's own handler is
    /// called with the step's stored output.
    pub async fn compensate(
        execution: &mut Execution,
        definition: &WorkflowDefinition,
        registry: &HandlerRegistry,
    ) -> CompensationReport {
        let mut report = CompensationReport::default();

        for index in execution.completed_steps_in_reverse() {
            let step_id = execution.steps[index].id.clone();
            let template = definition.compensation_for(&step_id);
            let handler_name = template
                .and_then(|t| t.handler.as_deref())
                .unwrap_or(&execution.steps[index].handler)
                .to_string();

            let Some(handler) = registry.get(&handler_name) else {
                tracing::warn!(
                    execution_id = %execution.id,
                    step_id = step_id.as_str(),
                    handler = handler_name.as_str(),
                    "compensation handler not registered"
                );
                let err = CompensationError::HandlerNotFound {
                    step_id: step_id.clone(),
                    handler: handler_name,
                };
                execution.steps[index].compensation_error = Some(err.to_string());
                report.attempted.push(step_id);
                report.failed.push(err);
                continue;
            };

            if !handler.capabilities().compensate {
                tracing::debug!(step_id = step_id.as_str(), handler = handler_name.as_str(), "no compensating action, skipping");
                report.skipped.push(step_id);
                continue;
            }

            let input = match template.and_then(|t| t.input.as_ref()) {
                Some(input) => execution.context.resolve_input(input),
                None => execution.steps[index].output.clone().unwrap_or(Value::Null),
            };

            if let Err(err) = execution.steps[index].mark_compensating() {
                tracing::warn!(error = %err, "skipping compensation");
                report.skipped.push(step_id);
                continue;
            }
            report.attempted.push(step_id.clone());

            match handler.compensate(&input, &execution.context).await {
                Ok(()) => {
                    tracing::debug!(execution_id = %execution.id, step_id = step_id.as_str(), "step compensated");
                    report.succeeded.push(step_id);
                }
                Err(source) => {
                    tracing::warn!(
                        execution_id = %execution.id,
                        step_id = step_id.as_str(),
                        error = %source,
                        "compensation failed, continuing rollback"
                    );
                    let err = CompensationError::Failed { step_id, source };
                    execution.steps[index].compensation_error = Some(err.to_string());
                    report.failed.push(err);
                }
            }
        }

        report
    }
}
