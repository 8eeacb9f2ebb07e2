//! BoxStepHandler -- object-safe dynamic dispatch wrapper for StepHandler.
//!
//! 1. Define an object-safe `StepHandlerDyn` trait with boxed futures
//! 2. Blanket-impl `StepHandlerDyn` for all `T: StepHandler`
//! 3. `BoxStepHandler` wraps `Box<dyn StepHandlerDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::workflow::context::ExecutionContext;

use super::{HandlerCapabilities, StepError, StepHandler};

/// Object-safe version of [`StepHandler`] with boxed futures.
///
/// A blanket implementation is provided for all types implementing `StepHandler`.
pub trait StepHandlerDyn: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> HandlerCapabilities;

    fn execute_boxed<'a>(
        &'a self,
        input: &'a Value,
        ctx: &'a ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>>;

    fn compensate_boxed<'a>(
        &'a self,
        input: &'a Value,
        ctx: &'a ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), StepError>> + Send + 'a>>;

    fn validate(&self, input: &Value) -> bool;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn name(&self) -> &str {
        StepHandler::name(self)
    }

    fn capabilities(&self) -> HandlerCapabilities {
        StepHandler::capabilities(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        input: &'a Value,
        ctx: &'a ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>> {
        Box::pin(StepHandler::execute(self, input, ctx))
    }

    fn compensate_boxed<'a>(
        &'a self,
        input: &'a Value,
        ctx: &'a ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), StepError>> + Send + 'a>> {
        Box::pin(StepHandler::compensate(self, input, ctx))
    }

    fn validate(&self, input: &Value) -> bool {
        StepHandler::validate(self, input)
    }
}

/// Type-erased step handler stored in the registry.
///
/// Since `StepHandler` uses RPITIT, it cannot be used as a trait object
/// directly. `BoxStepHandler` provides equivalent methods that delegate to the
/// inner `StepHandlerDyn` trait object.
pub struct BoxStepHandler {
    inner: Box<dyn StepHandlerDyn>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn capabilities(&self) -> HandlerCapabilities {
        self.inner.capabilities()
    }

    pub async fn execute(&self, input: &Value, ctx: &ExecutionContext) -> Result<Value, StepError> {
        self.inner.execute_boxed(input, ctx).await
    }

    pub async fn compensate(&self, input: &Value, ctx: &ExecutionContext) -> Result<(), StepError> {
        self.inner.compensate_boxed(input, ctx).await
    }

    pub fn validate(&self, input: &Value) -> bool {
        self.inner.validate(input)
    }
}

impl std::fmt::Debug for BoxStepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepHandler")
            .field("name", &self.name())
            .field("capabilities", &self.capabilities())
            .finish()
    }
}
