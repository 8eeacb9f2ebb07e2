//! `echo` handler: returns its resolved input as the step output.

use serde_json::Value;
use stepwise_core::handler::{StepError, StepHandler};
use stepwise_core::workflow::context::ExecutionContext;

pub struct EchoHandler;

impl StepHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, input: &Value, ctx: &ExecutionContext) -> Result<Value, StepError> {
        tracing::trace!(session_id = ctx.session_id.as_str(), "echo");
        Ok(input.clone())
    }
}
