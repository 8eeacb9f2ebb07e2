//! Execution context with step output tracking and input templating.
//!
//! `ExecutionContext` is the mutable state that flows through one execution.
//! Each completed step's output is merged into `variables` under
//! `step_<id>_output`, so later steps can read earlier results either directly
//! or through `{{ steps.<id>.output }}` references in their input.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Opaque handles to external collaborators (inference client, KV store, ...).
///
/// The engine never inspects these; handlers look up the ones they need by
/// name and concrete type.
#[derive(Clone, Default)]
pub struct Collaborators {
    handles: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with<T: Any + Send + Sync>(mut self, name: impl Into<String>, handle: Arc<T>) -> Self {
        self.insert(name, handle);
        self
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, name: impl Into<String>, handle: Arc<T>) {
        self.handles.insert(name.into(), handle);
    }

    /// Typed lookup. Returns `None` if the name is absent or holds another type.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let handle = Arc::clone(self.handles.get(name)?);
        handle.downcast::<T>().ok()
    }

    /// Registered collaborator names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("names", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable state passed to every step of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub session_id: String,
    pub user_id: Option<String>,
    /// Caller-supplied conversation state, passed through untouched.
    pub conversation: Value,
    pub collaborators: Collaborators,
    /// Caller variables plus one `step_<id>_output` entry per completed step.
    pub variables: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: None,
            conversation: Value::Null,
            collaborators: Collaborators::default(),
            variables: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_conversation(mut self, conversation: Value) -> Self {
        self.conversation = conversation;
        self
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Variables key under which a step's output is stored.
    pub fn output_key(step_id: &str) -> String {
        format!("step_{step_id}_output")
    }

    /// Merge a completed step's output into the variables map.
    pub fn record_step_output(&mut self, step_id: &str, output: Value) {
        self.variables.insert(Self::output_key(step_id), output);
    }

    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.variables.get(&Self::output_key(step_id))
    }

    /// Resolve `{{ ... }}` references inside a step input, recursively.
    ///
    /// A string that is exactly one reference is replaced by the referenced
    /// JSON value. References embedded in longer strings are replaced by the
    /// value's string form. Unknown references are left as-is.
    pub fn resolve_input(&self, input: &Value) -> Value {
        match input {
            Value::String(s) => {
                if let Some(expr) = whole_reference(s) {
                    if let Some(value) = self.lookup(expr) {
                        return value.clone();
                    }
                }
                Value::String(self.resolve_template(s))
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_input(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_input(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Resolve template references in a string.
    ///
    /// Supports:
    /// - `{{ steps.<step_id>.output }}` (optionally followed by `.field` paths)
    /// - `{{ variables.<name> }}` (optionally followed by `.field` paths)
    pub fn resolve_template(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start..].find("}}") else {
                break;
            };
            let end = start + len + 2;
            out.push_str(&rest[..start]);

            let expr = rest[start + 2..end - 2].trim();
            match self.lookup(expr) {
                Some(value) => out.push_str(&value_to_string(value)),
                None => out.push_str(&rest[start..end]),
            }
            rest = &rest[end..];
        }

        out.push_str(rest);
        out
    }

    fn lookup(&self, expr: &str) -> Option<&Value> {
        let mut parts = expr.split('.');
        let root = match parts.next()? {
            "steps" => {
                let step_id = parts.next()?;
                if parts.next()? != "output" {
                    return None;
                }
                self.step_output(step_id)?
            }
            "variables" => self.variables.get(parts.next()?)?,
            _ => return None,
        };
        parts.try_fold(root, |value, field| match value {
            Value::Array(items) => items.get(field.parse::<usize>().ok()?),
            _ => value.get(field),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The inner expression if `s` is a single `{{ expr }}` reference.
fn whole_reference(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Convert a JSON value to a display string for template resolution.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_context() -> ExecutionContext {
        ExecutionContext::new("session-1")
            .with_user("user-7")
            .with_variable("ticket", json!({ "priority": "high", "tags": ["a", "b"] }))
    }

    #[test]
    fn output_key_is_deterministic() {
        assert_eq!(ExecutionContext::output_key("A"), "step_A_output");
        assert_eq!(ExecutionContext::output_key("create-ticket"), "step_create-ticket_output");
    }

    #[test]
    fn record_and_read_step_output() {
        let mut ctx = test_context();
        ctx.record_step_output("A", json!({ "value": 1 }));

        assert_eq!(ctx.step_output("A"), Some(&json!({ "value": 1 })));
        assert_eq!(ctx.variables["step_A_output"]["value"], json!(1));
        assert_eq!(ctx.step_output("B"), None);
    }

    #[test]
    fn resolves_embedded_references() {
        let mut ctx = test_context();
        ctx.record_step_output("classify", json!("billing"));

        let out = ctx.resolve_template("route to {{ steps.classify.output }} ({{ variables.ticket.priority }})");
        assert_eq!(out, "route to billing (high)");
    }

    #[test]
    fn unknown_references_are_left_as_is() {
        let ctx = test_context();
        let out = ctx.resolve_template("x {{ steps.missing.output }} y {{ nope }}");
        assert_eq!(out, "x {{ steps.missing.output }} y {{ nope }}");
    }

    #[test]
    fn unterminated_reference_is_kept() {
        let ctx = test_context();
        assert_eq!(ctx.resolve_template("a {{ variables.ticket"), "a {{ variables.ticket");
    }

    #[test]
    fn whole_string_reference_keeps_json_type() {
        let mut ctx = test_context();
        ctx.record_step_output("A", json!({ "value": 1 }));

        let input = json!({
            "previous": "{{ steps.A.output }}",
            "value": "{{steps.A.output.value}}",
            "tag": "{{ variables.ticket.tags.1 }}",
            "label": "v={{ steps.A.output.value }}",
            "nested": ["{{ variables.ticket.priority }}", 5, null],
        });

        let resolved = ctx.resolve_input(&input);
        assert_eq!(resolved["previous"], json!({ "value": 1 }));
        assert_eq!(resolved["value"], json!(1));
        assert_eq!(resolved["tag"], json!("b"));
        assert_eq!(resolved["label"], json!("v=1"));
        assert_eq!(resolved["nested"], json!(["high", 5, null]));
    }

    #[test]
    fn collaborators_typed_lookup() {
        struct Inference {
            model: &'static str,
        }

        let collaborators = Collaborators::new()
            .with("inference", Arc::new(Inference { model: "small" }))
            .with("limit", Arc::new(42u32));

        let ctx = ExecutionContext::new("s").with_collaborators(collaborators);

        let inference = ctx.collaborators.get::<Inference>("inference").unwrap();
        assert_eq!(inference.model, "small");
        assert_eq!(*ctx.collaborators.get::<u32>("limit").unwrap(), 42);
        assert!(ctx.collaborators.get::<String>("limit").is_none());
        assert!(ctx.collaborators.get::<u32>("missing").is_none());
        assert_eq!(ctx.collaborators.names(), vec!["inference", "limit"]);
    }
}
