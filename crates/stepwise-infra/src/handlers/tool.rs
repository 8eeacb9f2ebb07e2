//! `tool.invoke` handler: dispatches to named tools.
//!
//! Step input is `{"tool": "<name>", "args": <json>}`. Tools are synchronous
//! functions over JSON, registered by name before the dispatcher is handed to
//! the handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use stepwise_core::handler::{HandlerCapabilities, StepError, StepHandler};
use stepwise_core::workflow::context::ExecutionContext;

/// A named tool: JSON arguments in, JSON result out.
pub type ToolFn = Arc<dyn Fn(&Value, &ExecutionContext) -> Result<Value, StepError> + Send + Sync>;

#[derive(Debug, Deserialize)]
struct Invocation {
    tool: String,
    #[serde(default)]
    args: Value,
}

/// Registry of named tools exposed as the `tool.invoke` handler.
#[derive(Clone, Default)]
pub struct ToolDispatcher {
    tools: HashMap<String, ToolFn>,
}

impl ToolDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher preloaded with the stock tools (`text.upper`, `math.sum`).
    pub fn with_stock_tools() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register("text.upper", |args, _| {
            let text = args
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| StepError::fatal("InvalidArgs", "text.upper expects {\"text\": string}"))?;
            Ok(json!(text.to_uppercase()))
        });
        dispatcher.register("math.sum", |args, _| {
            let values = args
                .get("values")
                .and_then(Value::as_array)
                .ok_or_else(|| StepError::fatal("InvalidArgs", "math.sum expects {\"values\": [number]}"))?;
            let total = values
                .iter()
                .map(|v| v.as_f64().ok_or_else(|| StepError::fatal("InvalidArgs", format!("not a number: {v}"))))
                .sum::<Result<f64, StepError>>()?;
            Ok(json!(total))
        });
        dispatcher
    }

    /// Register a tool, replacing any existing tool of the same name.
    pub fn register<F>(&mut self, name: impl Into<String>, tool: F)
    where
        F: Fn(&Value, &ExecutionContext) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(tool = name.as_str(), "registered tool");
        self.tools.insert(name, Arc::new(tool));
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn parse(input: &Value) -> Result<Invocation, StepError> {
        serde_json::from_value(input.clone()).map_err(|e| StepError::fatal("InvalidInput", e.to_string()))
    }
}

impl StepHandler for ToolDispatcher {
    fn name(&self) -> &str {
        "tool.invoke"
    }

    fn capabilities(&self) -> HandlerCapabilities {
        HandlerCapabilities {
            compensate: false,
            validate: true,
        }
    }

    async fn execute(&self, input: &Value, ctx: &ExecutionContext) -> Result<Value, StepError> {
        let Invocation { tool, args } = Self::parse(input)?;
        let f = self
            .tools
            .get(&tool)
            .ok_or_else(|| StepError::fatal("UnknownTool", format!("no tool named '{tool}'")))?;
        tracing::debug!(tool = tool.as_str(), "invoking tool");
        f(&args, ctx)
    }

    /// Rejects unknown tools before the step starts.
    fn validate(&self, input: &Value) -> bool {
        Self::parse(input).is_ok_and(|inv| self.tools.contains_key(&inv.tool))
    }
}
