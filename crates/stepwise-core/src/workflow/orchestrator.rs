//! Execution orchestrator: the top-level `run` driver.
//!
//! # Execution flow
//!
//! 1. Validate the definition and resolve the idempotency key.
//! 2. If the key is already tracked, join that execution instead of starting one.
//! 3. Otherwise register a new `Execution` under the key and mark it running.
//! 4. Run steps strictly in declaration order: lookup handler -> validate ->
//!    execute with retry -> merge output into the context.
//! 5. On failure, roll back completed steps if the definition declares
//!    compensation, then surface the step error.
//! 6. Record the outcome for duplicate callers and schedule eviction from the
//!    live table after the retention window.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use stepwise_types::config::EngineConfig;
use stepwise_types::error::StoreError;
use stepwise_types::workflow::{
    ExecutionStatus, FailureKind, RetryPolicy, RunResult, StepFailure, StepStatus, WorkflowDefinition,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};
use uuid::Uuid;

use crate::handler::{HandlerRegistry, StepHandler};

use super::compensation::CompensationRunner;
use super::context::ExecutionContext;
use super::definition::{WorkflowError, validate_definition};
use super::execution::Execution;
use super::idempotency::{IdempotencyError, IdempotencyResolver};
use super::retry::run_with_retry;
use super::store::{ExecutionStore, Registration};

// ---------------------------------------------------------------------------
// OrchestratorError
// ---------------------------------------------------------------------------

/// Errors surfaced by [`Orchestrator::run`].
///
/// Every variant is fatal: the caller should not retry `run` expecting a
/// different outcome for the same key.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("step '{step_id}': {message}")]
    HandlerNotFound {
        execution_id: Uuid,
        step_id: String,
        message: String,
    },

    #[error("step '{step_id}' rejected its input: {message}")]
    ValidationRejected {
        execution_id: Uuid,
        step_id: String,
        message: String,
    },

    #[error("step '{step_id}' failed: {message}")]
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        message: String,
    },

    #[error("execution timed out: {message}")]
    ExecutionTimeout {
        execution_id: Uuid,
        step_id: Option<String>,
        message: String,
    },

    #[error("idempotency error: {0}")]
    Idempotency(#[from] IdempotencyError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid definition: {0}")]
    InvalidDefinition(#[from] WorkflowError),
}

impl OrchestratorError {
    /// Rebuild the caller-facing error from a recorded failure.
    pub fn from_failure(execution_id: Uuid, failure: &StepFailure) -> Self {
        let step_id = failure.step_id.clone().unwrap_or_default();
        let message = failure.message.clone();
        match failure.kind {
            FailureKind::HandlerNotFound => OrchestratorError::HandlerNotFound {
                execution_id,
                step_id,
                message,
            },
            FailureKind::ValidationRejected => OrchestratorError::ValidationRejected {
                execution_id,
                step_id,
                message,
            },
            FailureKind::StepFailed => OrchestratorError::StepFailed {
                execution_id,
                step_id,
                message,
            },
            FailureKind::Timeout => OrchestratorError::ExecutionTimeout {
                execution_id,
                step_id: failure.step_id.clone(),
                message,
            },
        }
    }

    /// The execution this error belongs to, if one was created.
    pub fn execution_id(&self) -> Option<Uuid> {
        match self {
            OrchestratorError::HandlerNotFound { execution_id, .. }
            | OrchestratorError::ValidationRejected { execution_id, .. }
            | OrchestratorError::StepFailed { execution_id, .. }
            | OrchestratorError::ExecutionTimeout { execution_id, .. } => Some(*execution_id),
            _ => None,
        }
    }

    /// Whether the error is final for its key. Always true: retrying `run`
    /// with the same key replays this error.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs workflow definitions against registered step handlers.
///
/// Generic over `S: ExecutionStore` so the live-execution table can be
/// swapped for a durable one.
pub struct Orchestrator<S: ExecutionStore> {
    store: Arc<S>,
    registry: HandlerRegistry,
    resolver: IdempotencyResolver<S>,
    config: EngineConfig,
    /// Cancels pending eviction timers when the orchestrator is dropped.
    shutdown: CancellationToken,
}

impl<S: ExecutionStore + 'static> Orchestrator<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            resolver: IdempotencyResolver::from_config(Arc::clone(&store), &config),
            store,
            registry: HandlerRegistry::new(),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the handler registry wholesale.
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register a handler before any run that references it.
    pub fn register_step_handler<H: StepHandler + 'static>(&mut self, handler: H) {
        self.registry.register(handler);
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of executions currently tracked (running or within retention).
    pub async fn live_executions(&self) -> Result<usize, StoreError> {
        self.store.len().await
    }

    /// Run `definition` to completion.
    ///
    /// Concurrent or later calls with the same `idempotency_key` never re-run
    /// any step: they wait for and replay the first caller's outcome. Without a
    /// key, a unique one is generated and the run never deduplicates.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        context: ExecutionContext,
        idempotency_key: Option<&str>,
    ) -> Result<RunResult, OrchestratorError> {
        validate_definition(definition)?;

        let key = match idempotency_key {
            Some(key) => key.to_string(),
            None => IdempotencyResolver::<S>::generate_key(&definition.id, &context.session_id),
        };

        if let Some(existing) = self.resolver.find(&key).await? {
            return self.join_existing(&key, existing).await;
        }

        let policy = definition
            .effective_retry_policy(&self.config.default_retry_policy)
            .clone();
        let mut execution = Execution::new(definition, &policy, context, key.as_str());

        if let Registration::Existing(existing) = self.resolver.register(&key, execution.clone()).await? {
            return self.join_existing(&key, existing).await;
        }
        let settlement = Settlement {
            store: Arc::clone(&self.store),
            key: key.clone(),
            retention: self.retention(),
            shutdown: self.shutdown.clone(),
            armed: true,
        };

        execution.status = ExecutionStatus::Running;
        self.checkpoint(&key, &execution).await;

        tracing::info!(
            execution_id = %execution.id,
            workflow = definition.id.as_str(),
            key = key.as_str(),
            steps = execution.steps.len(),
            "starting execution"
        );

        let started = Instant::now();
        let outcome = self.drive(definition, &policy, &key, &mut execution).await;

        match outcome {
            Ok(()) => {
                execution.status = ExecutionStatus::Completed;
                let result = execution.summarize(started.elapsed().as_millis() as u64);
                self.warn_if_over_advisory_timeout(definition, &result);
                execution.outcome = Some(result.clone());
                self.finish(&key, &execution, settlement).await;

                tracing::info!(
                    execution_id = %execution.id,
                    duration_ms = result.metadata.duration_ms,
                    steps_completed = result.metadata.steps_completed,
                    retries_used = result.metadata.retries_used,
                    "execution completed"
                );
                Ok(result)
            }
            Err(failure) => {
                tracing::error!(
                    execution_id = %execution.id,
                    step_id = failure.step_id.as_deref().unwrap_or("-"),
                    error = %failure,
                    "execution failed"
                );
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(failure.clone());

                if definition.has_compensation() {
                    let report = CompensationRunner::compensate(&mut execution, definition, &self.registry).await;
                    if report.is_clean() {
                        tracing::info!(
                            execution_id = %execution.id,
                            compensated = report.succeeded.len(),
                            skipped = report.skipped.len(),
                            "compensation finished"
                        );
                    } else {
                        tracing::warn!(
                            execution_id = %execution.id,
                            failed = report.failed.len(),
                            succeeded = report.succeeded.len(),
                            "compensation finished with failures"
                        );
                    }
                    execution.status = ExecutionStatus::Compensated;
                }

                let result = execution.summarize(started.elapsed().as_millis() as u64);
                self.warn_if_over_advisory_timeout(definition, &result);
                execution.outcome = Some(result);
                self.finish(&key, &execution, settlement).await;

                Err(OrchestratorError::from_failure(execution.id, &failure))
            }
        }
    }

    /// Wait for (if needed) and replay another caller's execution.
    async fn join_existing(&self, key: &str, existing: Execution) -> Result<RunResult, OrchestratorError> {
        tracing::debug!(
            key,
            execution_id = %existing.id,
            status = %existing.status,
            "idempotency key already tracked, joining existing execution"
        );
        let settled = if existing.is_settled() {
            existing
        } else {
            self.resolver.await_terminal(key).await?
        };
        replay(key, settled)
    }

    /// Step loop, optionally bounded by the definition's deadline.
    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        policy: &RetryPolicy,
        key: &str,
        execution: &mut Execution,
    ) -> Result<(), StepFailure> {
        let deadline = definition
            .timeout_secs
            .filter(|_| self.config.enforce_definition_timeout)
            .map(Duration::from_secs);

        let attempts = AtomicU32::new(0);
        let Some(limit) = deadline else {
            return self.run_steps(policy, key, execution, &attempts).await;
        };

        match tokio::time::timeout(limit, self.run_steps(policy, key, execution, &attempts)).await {
            Ok(result) => result,
            Err(_) => {
                let message = format!("execution exceeded its {}s deadline", limit.as_secs());
                let index = execution.current_step;
                let step_id = match execution.steps.get_mut(index) {
                    Some(step) if step.status == StepStatus::Running => {
                        let retries = attempts.load(Ordering::SeqCst).saturating_sub(1);
                        if let Err(e) = step.mark_failed(message.clone(), retries) {
                            tracing::warn!(error = %e, "could not record timeout on step");
                        }
                        Some(step.id.clone())
                    }
                    _ => None,
                };
                Err(StepFailure {
                    kind: FailureKind::Timeout,
                    step_id,
                    message,
                })
            }
        }
    }

    /// `attempts` tracks handler invocations of the current step, so a deadline
    /// that drops this future can still record the retries consumed.
    async fn run_steps(
        &self,
        policy: &RetryPolicy,
        key: &str,
        execution: &mut Execution,
        attempts: &AtomicU32,
    ) -> Result<(), StepFailure> {
        for index in 0..execution.steps.len() {
            execution.current_step = index;
            attempts.store(0, Ordering::SeqCst);
            let step_id = execution.steps[index].id.clone();
            let handler_name = execution.steps[index].handler.clone();

            let Some(handler) = self.registry.get(&handler_name) else {
                let message = format!("no handler registered under '{handler_name}'");
                return Err(fail_step(execution, index, FailureKind::HandlerNotFound, message, 0));
            };

            let input = execution.context.resolve_input(&execution.steps[index].input);

            if handler.capabilities().validate && !handler.validate(&input) {
                let message = format!("handler '{handler_name}' rejected the step input");
                return Err(fail_step(execution, index, FailureKind::ValidationRejected, message, 0));
            }

            if let Err(e) = execution.steps[index].mark_running() {
                return Err(fail_step(execution, index, FailureKind::StepFailed, e.to_string(), 0));
            }
            self.checkpoint(key, execution).await;
            tracing::debug!(execution_id = %execution.id, step_id = step_id.as_str(), "step started");

            let span = info_span!(
                "stepwise.step",
                execution_id = %execution.id,
                step_id = step_id.as_str(),
                handler = handler_name.as_str(),
            );
            let max_retries = execution.steps[index].max_retries;
            let ctx = &execution.context;
            let input = &input;
            let attempted = run_with_retry(policy, max_retries, move |attempt| {
                tracing::trace!(attempt, "invoking handler");
                attempts.store(attempt + 1, Ordering::SeqCst);
                handler.execute(input, ctx)
            })
            .instrument(span)
            .await;

            let retries = attempted.retries();
            match attempted.result {
                Ok(output) => {
                    if let Err(e) = execution.steps[index].mark_completed(output.clone(), retries) {
                        return Err(fail_step(execution, index, FailureKind::StepFailed, e.to_string(), retries));
                    }
                    execution.context.record_step_output(&step_id, output);
                    self.checkpoint(key, execution).await;
                    tracing::debug!(
                        execution_id = %execution.id,
                        step_id = step_id.as_str(),
                        retries,
                        "step completed"
                    );
                }
                Err(err) => {
                    return Err(fail_step(execution, index, FailureKind::StepFailed, err.to_string(), retries));
                }
            }
        }
        Ok(())
    }

    /// Best-effort snapshot for observers polling the store.
    async fn checkpoint(&self, key: &str, execution: &Execution) {
        if let Err(e) = self.store.update(key, execution).await {
            tracing::warn!(key, execution_id = %execution.id, error = %e, "failed to update execution snapshot");
        }
    }

    /// Store the settled snapshot, then hand eviction over to a timer.
    async fn finish(&self, key: &str, execution: &Execution, mut settlement: Settlement<S>) {
        self.checkpoint(key, execution).await;
        settlement.armed = false;
        tokio::spawn(evict_after(
            Arc::clone(&self.store),
            key.to_string(),
            self.retention(),
            self.shutdown.clone(),
        ));
    }

    fn retention(&self) -> Duration {
        Duration::from_millis(self.config.completed_retention_ms)
    }

    /// The advisory timeout `result` overran, if any. An enforced deadline
    /// aborts the run instead, so it never counts as an overrun.
    fn advisory_overrun(&self, definition: &WorkflowDefinition, result: &RunResult) -> Option<u64> {
        if self.config.enforce_definition_timeout {
            return None;
        }
        definition
            .timeout_secs
            .filter(|secs| result.metadata.duration_ms > secs.saturating_mul(1_000))
    }

    /// Applies to succeeded and failed runs alike.
    fn warn_if_over_advisory_timeout(&self, definition: &WorkflowDefinition, result: &RunResult) {
        if let Some(secs) = self.advisory_overrun(definition, result) {
            tracing::warn!(
                execution_id = %result.execution_id,
                success = result.success,
                timeout_secs = secs,
                duration_ms = result.metadata.duration_ms,
                "execution exceeded its advisory timeout"
            );
        }
    }
}

impl<S: ExecutionStore> Drop for Orchestrator<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

/// Settles a registered execution whose `run` future is dropped before it
/// finishes (caller timeout, `select!`, task abort, handler panic).
///
/// The stored snapshot is marked failed with a recorded outcome, so waiting
/// duplicates replay an error instead of timing out, and eviction is scheduled
/// so the key becomes usable again. Compensation does not run for an
/// abandoned execution.
struct Settlement<S: ExecutionStore + 'static> {
    store: Arc<S>,
    key: String,
    retention: Duration,
    shutdown: CancellationToken,
    armed: bool,
}

impl<S: ExecutionStore + 'static> Drop for Settlement<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = self.key.as_str(), "runtime gone, abandoned execution left unsettled");
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let retention = self.retention;
        let shutdown = self.shutdown.clone();

        runtime.spawn(async move {
            abandon(store.as_ref(), &key).await;
            evict_after(store, key, retention, shutdown).await;
        });
    }
}

/// Mark an unsettled snapshot failed and record its outcome.
async fn abandon<S: ExecutionStore>(store: &S, key: &str) {
    let mut execution = match store.find(key).await {
        Ok(Some(execution)) if !execution.is_settled() => execution,
        Ok(_) => return,
        Err(e) => {
            tracing::warn!(key, error = %e, "could not load abandoned execution");
            return;
        }
    };

    let message = "execution abandoned before it finished".to_string();
    let index = execution.current_step;
    let step_id = match execution.steps.get_mut(index) {
        Some(step) => {
            if step.status == StepStatus::Running {
                let retries = step.retry_count;
                if let Err(e) = step.mark_failed(message.clone(), retries) {
                    tracing::warn!(error = %e, "could not record abandonment on step");
                }
            }
            Some(step.id.clone())
        }
        None => None,
    };

    execution.status = ExecutionStatus::Failed;
    execution.error = Some(StepFailure {
        kind: FailureKind::StepFailed,
        step_id,
        message,
    });
    let elapsed = chrono::Utc::now() - execution.started_at;
    let result = execution.summarize(elapsed.num_milliseconds().max(0) as u64);
    execution.outcome = Some(result);

    tracing::warn!(key, execution_id = %execution.id, "execution abandoned, recorded as failed");
    if let Err(e) = store.update(key, &execution).await {
        tracing::warn!(key, error = %e, "failed to record abandoned execution");
    }
}

/// Remove `key` from the live table once `retention` elapses.
async fn evict_after<S: ExecutionStore>(store: Arc<S>, key: String, retention: Duration, shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(retention) => {
            match store.remove(&key).await {
                Ok(true) => tracing::debug!(key = key.as_str(), "evicted finished execution"),
                Ok(false) => {}
                Err(e) => tracing::warn!(key = key.as_str(), error = %e, "failed to evict execution"),
            }
        }
        _ = shutdown.cancelled() => {}
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Mark step `index` failed and build the failure to surface.
fn fail_step(
    execution: &mut Execution,
    index: usize,
    kind: FailureKind,
    message: String,
    retries: u32,
) -> StepFailure {
    let step = &mut execution.steps[index];
    if let Err(e) = step.mark_failed(message.clone(), retries) {
        tracing::warn!(error = %e, "could not record step failure");
    }
    StepFailure {
        kind,
        step_id: Some(step.id.clone()),
        message,
    }
}

/// Turn a settled execution back into the result its first caller received.
fn replay(key: &str, execution: Execution) -> Result<RunResult, OrchestratorError> {
    let missing = || {
        OrchestratorError::Store(StoreError::Conflict(format!(
            "execution for key '{key}' finished without a recorded outcome"
        )))
    };
    let result = execution.outcome.ok_or_else(missing)?;
    if result.success {
        return Ok(result);
    }
    match &result.error {
        Some(failure) => Err(OrchestratorError::from_failure(execution.id, failure)),
        None => Err(missing()),
    }
}
