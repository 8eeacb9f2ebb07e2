//! Step handler contract.
//!
//! Every external collaborator the engine calls (AI inference, key-value
//! writes, tool dispatch, ...) is registered as a `StepHandler` under a name
//! that step templates reference. The engine only knows the capability set
//! exposed here: execute, and optionally compensate and validate.
//!
//! - `box_handler` -- object-safe wrapper for runtime dispatch by name
//! - `registry` -- name-indexed handler registry

pub mod box_handler;
pub mod registry;

use std::future::Future;

use serde_json::Value;

use crate::workflow::context::ExecutionContext;

pub use box_handler::BoxStepHandler;
pub use registry::HandlerRegistry;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// How a handler error should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Always retried while budget remains.
    Retryable,
    /// Never retried.
    Fatal,
    /// Classified by matching the retry policy's patterns against the error text.
    Unclassified,
}

/// Error raised by a step handler.
///
/// Handlers that know whether a failure is transient tag it explicitly.
/// Untagged errors fall back to substring matching on `name` and `message`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct StepError {
    pub kind: ErrorKind,
    /// Error class name (e.g. "TimeoutError").
    pub name: String,
    pub message: String,
}

impl StepError {
    /// An untagged error, classified by the retry policy's patterns.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Unclassified,
            name: name.into(),
            message: message.into(),
        }
    }

    /// An error that should always be retried.
    pub fn retryable(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Retryable,
            ..Self::new(name, message)
        }
    }

    /// An error that must never be retried.
    pub fn fatal(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            ..Self::new(name, message)
        }
    }
}

// ---------------------------------------------------------------------------
// StepHandler trait
// ---------------------------------------------------------------------------

/// Optional capabilities a handler exposes beyond `execute`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerCapabilities {
    /// The handler provides a compensating action.
    pub compensate: bool,
    /// The handler provides an input validator.
    pub validate: bool,
}

/// An executable unit bound to a step by name.
///
/// Uses RPITIT (native async fn in traits). Wrap in [`BoxStepHandler`] for
/// dynamic dispatch.
pub trait StepHandler: Send + Sync {
    /// The identifier step templates reference.
    fn name(&self) -> &str;

    /// Which optional operations this handler implements.
    ///
    /// The engine consults only these flags: overriding `compensate` or
    /// `validate` without setting the matching flag leaves that method
    /// uncalled.
    fn capabilities(&self) -> HandlerCapabilities {
        HandlerCapabilities::default()
    }

    /// Run the step and produce its output.
    fn execute(
        &self,
        input: &Value,
        ctx: &ExecutionContext,
    ) -> impl Future<Output = Result<Value, StepError>> + Send;

    /// Best-effort undo of a completed step. `input` is the step's stored
    /// output unless a compensation template overrides it.
    ///
    /// Called only when `capabilities().compensate` is true.
    fn compensate(
        &self,
        _input: &Value,
        _ctx: &ExecutionContext,
    ) -> impl Future<Output = Result<(), StepError>> + Send {
        async { Ok(()) }
    }

    /// Synchronous precondition check. `false` fails the whole execution.
    ///
    /// Called only when `capabilities().validate` is true.
    fn validate(&self, _input: &Value) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_display_includes_name_and_message() {
        let err = StepError::new("TimeoutError", "upstream timed out after 30s");
        assert_eq!(err.to_string(), "TimeoutError: upstream timed out after 30s");
        assert_eq!(err.kind, ErrorKind::Unclassified);
    }

    #[test]
    fn step_error_constructors_tag_kind() {
        assert_eq!(StepError::retryable("Busy", "try later").kind, ErrorKind::Retryable);
        assert_eq!(StepError::fatal("BadInput", "missing key").kind, ErrorKind::Fatal);
    }

    #[test]
    fn default_capabilities_are_empty() {
        let caps = HandlerCapabilities::default();
        assert!(!caps.compensate);
        assert!(!caps.validate);
    }
}
