//! Workflow runtime: sequential step execution with retry, rollback, and
//! idempotent starts.
//!
//! - `definition` -- YAML/JSON parsing, validation, filesystem load
//! - `retry` -- backoff calculator and the per-step retry loop
//! - `context` -- execution context with step output tracking and input templating
//! - `execution` -- runtime `Step` and `Execution` records
//! - `store` -- live-execution table trait and in-memory implementation
//! - `idempotency` -- key lookup, registration, and wait-for-terminal polling
//! - `compensation` -- reverse-order best-effort rollback
//! - `orchestrator` -- the top-level `run` driver

pub mod compensation;
pub mod context;
pub mod definition;
pub mod execution;
pub mod idempotency;
pub mod orchestrator;
pub mod retry;
pub mod store;
