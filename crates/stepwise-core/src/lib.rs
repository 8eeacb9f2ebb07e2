//! Step orchestration engine for stepwise.
//!
//! This crate holds the engine proper: the step handler contract and its
//! registry, plus the workflow runtime (backoff, execution context, execution
//! store, idempotency resolver, compensation runner, orchestrator). It depends
//! only on `stepwise-types` -- collaborator adapters live in `stepwise-infra`.

pub mod handler;
pub mod workflow;
