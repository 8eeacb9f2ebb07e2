//! Handler registry for runtime lookup by step handler name.

use std::collections::HashMap;

use super::{BoxStepHandler, StepHandler};

/// Registry of step handlers, indexed by the name step templates reference.
///
/// Populated before any run that references a handler; the orchestrator only
/// reads from it while executions are in flight.
#[derive(Debug)]
pub struct HandlerRegistry {
    handlers: HashMap<String, BoxStepHandler>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under its own name.
    ///
    /// If a handler with this name already exists, it is replaced.
    pub fn register<H: StepHandler + 'static>(&mut self, handler: H) {
        self.register_boxed(BoxStepHandler::new(handler));
    }

    /// Register an already type-erased handler.
    pub fn register_boxed(&mut self, handler: BoxStepHandler) {
        let name = handler.name().to_string();
        let caps = handler.capabilities();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::warn!(handler = name.as_str(), "replaced existing step handler");
        } else {
            tracing::debug!(
                handler = name.as_str(),
                compensate = caps.compensate,
                validate = caps.validate,
                "registered step handler"
            );
        }
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<&BoxStepHandler> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// List all registered handler names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::StepError;
    use crate::workflow::context::ExecutionContext;
    use serde_json::{Value, json};

    struct Constant {
        name: &'static str,
        value: Value,
    }

    impl StepHandler for Constant {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _input: &Value, _ctx: &ExecutionContext) -> Result<Value, StepError> {
            Ok(self.value.clone())
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register(Constant {
            name: "ai.infer",
            value: json!("hello"),
        });
        registry.register(Constant {
            name: "kv.write",
            value: json!(null),
        });

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("ai.infer"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["ai.infer", "kv.write"]);
    }

    #[tokio::test]
    async fn re_registering_replaces_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register(Constant {
            name: "echo",
            value: json!(1),
        });
        registry.register(Constant {
            name: "echo",
            value: json!(2),
        });
        assert_eq!(registry.len(), 1);

        let ctx = ExecutionContext::new("s");
        let out = registry
            .get("echo")
            .unwrap()
            .execute(&Value::Null, &ctx)
            .await
            .unwrap();
        assert_eq!(out, json!(2));
    }
}
