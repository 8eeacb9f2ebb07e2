//! End-to-end behavior of `Orchestrator::run`: retry accounting, idempotent
//! starts, reverse-order compensation, and output threading between steps.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use stepwise_core::handler::{HandlerCapabilities, StepError, StepHandler};
use stepwise_core::workflow::context::ExecutionContext;
use stepwise_core::workflow::idempotency::IdempotencyError;
use stepwise_core::workflow::orchestrator::{Orchestrator, OrchestratorError};
use stepwise_core::workflow::store::{ExecutionStore, InMemoryExecutionStore};
use stepwise_types::config::EngineConfig;
use stepwise_types::workflow::{
    BackoffStrategy, CompensationTemplate, ExecutionStatus, RetryPolicy, StepStatus, StepTemplate,
    WorkflowDefinition,
};

// ---------------------------------------------------------------------------
// Scripted handler
// ---------------------------------------------------------------------------

type Script = dyn Fn(u32, &Value, &ExecutionContext) -> Result<Value, StepError> + Send + Sync;

/// Shared view of what a scripted handler was asked to do.
#[derive(Clone, Default)]
struct Probe {
    calls: Arc<AtomicU32>,
    compensations: Arc<Mutex<Vec<Value>>>,
}

impl Probe {
    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn compensations(&self) -> Vec<Value> {
        self.compensations.lock().unwrap().clone()
    }
}

/// Handler whose result on the n-th call (1-based) is decided by a closure.
struct Scripted {
    name: &'static str,
    probe: Probe,
    compensable: bool,
    fail_compensation: bool,
    delay: Duration,
    script: Box<Script>,
}

impl Scripted {
    fn new(
        name: &'static str,
        script: impl Fn(u32, &Value, &ExecutionContext) -> Result<Value, StepError> + Send + Sync + 'static,
    ) -> (Self, Probe) {
        let probe = Probe::default();
        let handler = Self {
            name,
            probe: probe.clone(),
            compensable: false,
            fail_compensation: false,
            delay: Duration::ZERO,
            script: Box::new(script),
        };
        (handler, probe)
    }

    fn compensable(mut self) -> Self {
        self.compensable = true;
        self
    }

    fn failing_compensation(mut self) -> Self {
        self.compensable = true;
        self.fail_compensation = true;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl StepHandler for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    fn capabilities(&self) -> HandlerCapabilities {
        HandlerCapabilities {
            compensate: self.compensable,
            validate: false,
        }
    }

    async fn execute(&self, input: &Value, ctx: &ExecutionContext) -> Result<Value, StepError> {
        let n = self.probe.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.script)(n, input, ctx)
    }

    async fn compensate(&self, input: &Value, _ctx: &ExecutionContext) -> Result<(), StepError> {
        self.probe.compensations.lock().unwrap().push(input.clone());
        if self.fail_compensation {
            return Err(StepError::new("RollbackError", "undo rejected"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff: BackoffStrategy::Exponential,
        base_delay_ms: 10,
        max_delay_ms: 1_000,
        jitter_factor: 0.1,
        retryable_errors: vec!["timeout".to_string()],
    }
}

fn step(id: &str, handler: &str) -> StepTemplate {
    StepTemplate {
        id: id.to_string(),
        handler: handler.to_string(),
        input: json!({}),
        max_retries: None,
    }
}

fn workflow(steps: Vec<StepTemplate>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: "intake".to_string(),
        name: "Intake".to_string(),
        description: None,
        steps,
        compensation: vec![],
        timeout_secs: None,
        retry_policy: Some(fast_policy()),
    }
}

fn compensate(step_id: &str) -> CompensationTemplate {
    CompensationTemplate {
        step_id: step_id.to_string(),
        handler: None,
        input: None,
    }
}

fn engine() -> (Orchestrator<InMemoryExecutionStore>, Arc<InMemoryExecutionStore>) {
    let store = Arc::new(InMemoryExecutionStore::new());
    (Orchestrator::new(Arc::clone(&store), EngineConfig::default()), store)
}

fn session() -> ExecutionContext {
    ExecutionContext::new("session-1").with_user("user-1")
}

// ---------------------------------------------------------------------------
// Retry accounting
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn success_on_kth_attempt_records_k_minus_one_retries() {
    for k in 1..=4u32 {
        let (handler, probe) = Scripted::new("flaky", move |n, _, _| {
            if n < k {
                Err(StepError::new("Error", "upstream timeout"))
            } else {
                Ok(json!({ "attempt": n }))
            }
        });
        let (mut orch, store) = engine();
        orch.register_step_handler(handler);

        let mut flaky = step("flaky", "flaky");
        flaky.max_retries = Some(3);
        let result = orch.run(&workflow(vec![flaky]), session(), Some("k")).await.unwrap();

        assert_eq!(probe.calls(), k);
        assert_eq!(result.metadata.retries_used, k - 1);
        assert_eq!(result.result, Some(json!({ "attempt": k })));

        let execution = store.find("k").await.unwrap().unwrap();
        assert_eq!(execution.steps[0].retry_count, k - 1);
        assert_eq!(execution.steps[0].status, StepStatus::Completed);
    }
}

#[tokio::test(start_paused = true)]
async fn persistent_retryable_error_uses_whole_budget() {
    let (handler, probe) = Scripted::new("down", |_, _, _| Err(StepError::new("NetworkError", "connection timeout")));
    let (mut orch, store) = engine();
    orch.register_step_handler(handler);

    let mut down = step("down", "down");
    down.max_retries = Some(4);
    let err = orch.run(&workflow(vec![down]), session(), Some("k")).await.unwrap_err();

    assert_eq!(probe.calls(), 5);
    assert!(matches!(err, OrchestratorError::StepFailed { ref step_id, .. } if step_id == "down"));

    let execution = store.find("k").await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.steps[0].status, StepStatus::Failed);
    assert_eq!(execution.steps[0].retry_count, 4);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_error_is_attempted_once() {
    let (handler, probe) = Scripted::new("strict", |_, _, _| Err(StepError::new("ValidationError", "missing field")));
    let (mut orch, _store) = engine();
    orch.register_step_handler(handler);

    let mut strict = step("strict", "strict");
    strict.max_retries = Some(10);
    let err = orch.run(&workflow(vec![strict]), session(), None).await.unwrap_err();

    assert_eq!(probe.calls(), 1);
    assert!(err.to_string().contains("missing field"));
}

#[tokio::test(start_paused = true)]
async fn timeout_message_is_retried_up_to_max_attempts() {
    let (handler, probe) = Scripted::new("slow", |_, _, _| Err(StepError::new("Error", "request timeout after 30s")));
    let (mut orch, _store) = engine();
    orch.register_step_handler(handler);

    let mut def = workflow(vec![step("slow", "slow")]);
    def.retry_policy = Some(RetryPolicy {
        max_attempts: 3,
        retryable_errors: vec!["timeout".to_string()],
        ..RetryPolicy::default()
    });

    assert!(orch.run(&def, session(), None).await.is_err());
    assert_eq!(probe.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn tagged_fatal_error_overrides_matching_pattern() {
    let (handler, probe) = Scripted::new("tagged", |_, _, _| Err(StepError::fatal("Error", "timeout")));
    let (mut orch, _store) = engine();
    orch.register_step_handler(handler);

    assert!(orch.run(&workflow(vec![step("t", "tagged")]), session(), None).await.is_err());
    assert_eq!(probe.calls(), 1);
}

// ---------------------------------------------------------------------------
// Output threading
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn later_step_reads_earlier_output_from_variables() {
    let (a, _) = Scripted::new("produce", |_, _, _| Ok(json!({ "value": 1 })));
    let (b, _) = Scripted::new("consume", |_, _, ctx| {
        let prev = ctx.variables["step_A_output"]["value"]
            .as_i64()
            .ok_or_else(|| StepError::fatal("MissingInput", "step_A_output.value"))?;
        Ok(json!({ "value": prev + 1 }))
    });
    let (mut orch, _store) = engine();
    orch.register_step_handler(a);
    orch.register_step_handler(b);

    let result = orch
        .run(&workflow(vec![step("A", "produce"), step("B", "consume")]), session(), None)
        .await
        .unwrap();

    assert!(result.success);
    assert!(!result.compensated);
    assert_eq!(result.result, Some(json!({ "value": 2 })));
    assert_eq!(result.metadata.steps_completed, 2);
    assert!(result.error.is_none());
}

// ---------------------------------------------------------------------------
// Compensation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn failure_compensates_completed_steps_only() {
    let (one, probe_one) = Scripted::new("one", |_, _, _| Ok(json!({ "reserved": 1 })));
    let (two, _) = Scripted::new("two", |_, _, _| Err(StepError::new("PaymentDeclined", "card rejected")));
    let (three, probe_three) = Scripted::new("three", |_, _, _| Ok(json!(3)));
    let (mut orch, store) = engine();
    orch.register_step_handler(one.compensable());
    orch.register_step_handler(two);
    orch.register_step_handler(three.compensable());

    let mut def = workflow(vec![step("s1", "one"), step("s2", "two"), step("s3", "three")]);
    def.compensation = vec![compensate("s1"), compensate("s3")];

    let err = orch.run(&def, session(), Some("k")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::StepFailed { ref step_id, .. } if step_id == "s2"));

    assert_eq!(probe_one.compensations(), vec![json!({ "reserved": 1 })]);
    assert_eq!(probe_three.calls(), 0);
    assert!(probe_three.compensations().is_empty());

    let execution = store.find("k").await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Compensated);
    assert_eq!(execution.steps[0].status, StepStatus::Compensating);
    assert_eq!(execution.steps[1].status, StepStatus::Failed);
    assert_eq!(execution.steps[2].status, StepStatus::Pending);
    assert!(execution.outcome.as_ref().unwrap().compensated);
}

#[tokio::test(start_paused = true)]
async fn compensation_gets_stored_output_and_step_error_surfaces() {
    let (one, probe_one) = Scripted::new("create-ticket", |_, _, _| Ok(json!({ "ticket_id": 42 })));
    let (two, _) = Scripted::new("notify", |_, _, _| Err(StepError::new("Error", "recipient blocked")));
    let (mut orch, _store) = engine();
    orch.register_step_handler(one.compensable());
    orch.register_step_handler(two);

    let mut def = workflow(vec![step("create", "create-ticket"), step("notify", "notify")]);
    def.compensation = vec![compensate("create")];

    let err = orch.run(&def, session(), None).await.unwrap_err();
    match err {
        OrchestratorError::StepFailed { step_id, message, .. } => {
            assert_eq!(step_id, "notify");
            assert!(message.contains("recipient blocked"));
        }
        other => panic!("expected StepFailed, got {other:?}"),
    }
    assert_eq!(probe_one.compensations(), vec![json!({ "ticket_id": 42 })]);
}

#[tokio::test(start_paused = true)]
async fn without_declared_compensation_nothing_is_rolled_back() {
    let (one, probe_one) = Scripted::new("one", |_, _, _| Ok(json!(1)));
    let (two, _) = Scripted::new("two", |_, _, _| Err(StepError::new("Error", "bad")));
    let (mut orch, store) = engine();
    orch.register_step_handler(one.compensable());
    orch.register_step_handler(two);

    let def = workflow(vec![step("s1", "one"), step("s2", "two")]);
    assert!(orch.run(&def, session(), Some("k")).await.is_err());

    assert!(probe_one.compensations().is_empty());
    let execution = store.find("k").await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(!execution.outcome.unwrap().compensated);
}

#[tokio::test(start_paused = true)]
async fn compensation_failure_is_swallowed() {
    let (one, probe_one) = Scripted::new("one", |_, _, _| Ok(json!("first")));
    let (two, probe_two) = Scripted::new("two", |_, _, _| Ok(json!("second")));
    let (three, _) = Scripted::new("three", |_, _, _| Err(StepError::new("Error", "original failure")));
    let (mut orch, store) = engine();
    orch.register_step_handler(one.compensable());
    orch.register_step_handler(two.failing_compensation());
    orch.register_step_handler(three);

    let mut def = workflow(vec![step("s1", "one"), step("s2", "two"), step("s3", "three")]);
    def.compensation = vec![compensate("s1")];

    let err = orch.run(&def, session(), Some("k")).await.unwrap_err();
    assert!(err.to_string().contains("original failure"));

    // s2 is rolled back first and fails; s1 is still rolled back.
    assert_eq!(probe_two.compensations(), vec![json!("second")]);
    assert_eq!(probe_one.compensations(), vec![json!("first")]);

    let execution = store.find("k").await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Compensated);
    assert!(execution.steps[1].compensation_error.is_some());
}

// ---------------------------------------------------------------------------
// Idempotency
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_runs_with_same_key_execute_once() {
    let (a, probe_a) = Scripted::new("a", |_, _, _| Ok(json!("a")));
    let (b, probe_b) = Scripted::new("b", |_, _, _| Ok(json!("b")));
    let (mut orch, store) = engine();
    orch.register_step_handler(a.with_delay(Duration::from_millis(250)));
    orch.register_step_handler(b.with_delay(Duration::from_millis(250)));

    let def = workflow(vec![step("a", "a"), step("b", "b")]);
    let (first, second) = tokio::join!(
        orch.run(&def, session(), Some("order-1")),
        orch.run(&def, session(), Some("order-1")),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(probe_a.calls(), 1);
    assert_eq!(probe_b.calls(), 1);
    assert_eq!(first.execution_id, second.execution_id);
    assert_eq!(first.result, second.result);
    assert_eq!(store.len().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_across_threads_execute_once() {
    let (a, probe) = Scripted::new("a", |_, _, _| Ok(json!("done")));
    let (mut orch, _store) = engine();
    orch.register_step_handler(a.with_delay(Duration::from_millis(50)));
    let orch = Arc::new(orch);
    let def = Arc::new(workflow(vec![step("a", "a")]));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orch = Arc::clone(&orch);
        let def = Arc::clone(&def);
        handles.push(tokio::spawn(async move { orch.run(&def, session(), Some("shared")).await }));
    }

    let mut ids: Vec<_> = futures_util::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().execution_id)
        .collect();
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(probe.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn late_duplicate_replays_stored_result() {
    let (a, probe) = Scripted::new("a", |n, _, _| Ok(json!({ "call": n })));
    let (mut orch, _store) = engine();
    orch.register_step_handler(a);
    let def = workflow(vec![step("a", "a")]);

    let first = orch.run(&def, session(), Some("k")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let second = orch.run(&def, session(), Some("k")).await.unwrap();

    assert_eq!(probe.calls(), 1);
    assert_eq!(first.execution_id, second.execution_id);
    assert_eq!(second.result, Some(json!({ "call": 1 })));
}

#[tokio::test(start_paused = true)]
async fn duplicate_of_failed_run_gets_the_same_error() {
    let (a, probe) = Scripted::new("a", |_, _, _| Err(StepError::new("Error", "quota exceeded")));
    let (mut orch, _store) = engine();
    orch.register_step_handler(a);
    let def = workflow(vec![step("a", "a")]);

    let first = orch.run(&def, session(), Some("k")).await.unwrap_err();
    let second = orch.run(&def, session(), Some("k")).await.unwrap_err();

    assert_eq!(probe.calls(), 1);
    assert_eq!(first.to_string(), second.to_string());
    assert_eq!(first.execution_id(), second.execution_id());
}

#[tokio::test(start_paused = true)]
async fn key_is_reusable_after_retention_window() {
    let (a, probe) = Scripted::new("a", |_, _, _| Ok(json!("ok")));
    let store = Arc::new(InMemoryExecutionStore::new());
    let config = EngineConfig {
        completed_retention_ms: 1_000,
        ..EngineConfig::default()
    };
    let mut orch = Orchestrator::new(Arc::clone(&store), config);
    orch.register_step_handler(a);
    let def = workflow(vec![step("a", "a")]);

    let first = orch.run(&def, session(), Some("k")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(store.len().await.unwrap(), 0);

    let second = orch.run(&def, session(), Some("k")).await.unwrap();
    assert_eq!(probe.calls(), 2);
    assert_ne!(first.execution_id, second.execution_id);
}

#[tokio::test(start_paused = true)]
async fn duplicate_caller_times_out_waiting() {
    let (a, _) = Scripted::new("a", |_, _, _| Ok(json!("eventually")));
    let store = Arc::new(InMemoryExecutionStore::new());
    let config = EngineConfig {
        idempotency_wait_timeout_ms: 1_000,
        ..EngineConfig::default()
    };
    let mut orch = Orchestrator::new(Arc::clone(&store), config);
    orch.register_step_handler(a.with_delay(Duration::from_secs(5)));
    let def = workflow(vec![step("a", "a")]);

    let (first, second) = tokio::join!(
        orch.run(&def, session(), Some("k")),
        orch.run(&def, session(), Some("k")),
    );

    assert!(first.is_ok());
    match second.unwrap_err() {
        OrchestratorError::Idempotency(IdempotencyError::WaitTimeout { key, waited_ms }) => {
            assert_eq!(key, "k");
            assert!(waited_ms >= 1_000);
        }
        other => panic!("expected WaitTimeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn runs_without_key_never_deduplicate() {
    let (a, probe) = Scripted::new("a", |_, _, _| Ok(json!(null)));
    let (mut orch, _store) = engine();
    orch.register_step_handler(a);
    let def = workflow(vec![step("a", "a")]);

    let first = orch.run(&def, session(), None).await.unwrap();
    let second = orch.run(&def, session(), None).await.unwrap();

    assert_eq!(probe.calls(), 2);
    assert_ne!(first.execution_id, second.execution_id);
    assert_eq!(orch.live_executions().await.unwrap(), 2);
}
