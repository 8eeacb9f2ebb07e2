//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts YAML or JSON into the canonical `WorkflowDefinition`, validates
//! structural constraints (unique step ids, compensation targets, retry policy
//! bounds), and discovers definition files on disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use stepwise_types::workflow::{RetryPolicy, WorkflowDefinition};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating a definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A compensation template targets a step that does not exist.
    #[error("unknown compensation target: {0}")]
    UnknownCompensationTarget(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// File extension is not one of yaml, yml, json.
    #[error("unsupported definition format: {0}")]
    UnsupportedFormat(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
///
/// Runs `validate_definition` after deserialization, so the returned value
/// is guaranteed to be structurally valid.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Id and name are non-empty
/// - At least one step exists
/// - Step ids are unique and contain no `.` or whitespace
/// - Every step names a handler
/// - Compensation templates target existing steps, at most once each
/// - Retry policy bounds (`max_attempts >= 1`, `base <= max`, jitter in [0, 1])
/// - Timeout > 0 if set
///
/// Handler names are not resolved here; that happens at execution time.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.id.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow id must not be empty".to_string(),
        ));
    }
    if def.name.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.is_empty() || step.id.contains('.') || step.id.chars().any(char::is_whitespace) {
            return Err(WorkflowError::ValidationError(format!(
                "step ID '{}' must be non-empty and contain no dots or whitespace",
                step.id
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
        if step.handler.trim().is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' has an empty handler name",
                step.id
            )));
        }
    }

    let mut compensated = HashSet::new();
    for comp in &def.compensation {
        if !seen_ids.contains(comp.step_id.as_str()) {
            return Err(WorkflowError::UnknownCompensationTarget(format!(
                "compensation references unknown step '{}'",
                comp.step_id
            )));
        }
        if !compensated.insert(comp.step_id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' has more than one compensation",
                comp.step_id
            )));
        }
        if comp.handler.as_deref().is_some_and(|h| h.trim().is_empty()) {
            return Err(WorkflowError::ValidationError(format!(
                "compensation for step '{}' has an empty handler name",
                comp.step_id
            )));
        }
    }

    if let Some(policy) = &def.retry_policy {
        validate_retry_policy(policy)?;
    }

    if let Some(t) = def.timeout_secs {
        if t == 0 {
            return Err(WorkflowError::ValidationError(
                "timeout must be > 0".to_string(),
            ));
        }
    }

    Ok(())
}

/// Check a retry policy's invariants.
pub fn validate_retry_policy(policy: &RetryPolicy) -> Result<(), WorkflowError> {
    if policy.max_attempts < 1 {
        return Err(WorkflowError::ValidationError(
            "retry policy max_attempts must be >= 1".to_string(),
        ));
    }
    if policy.base_delay_ms > policy.max_delay_ms {
        return Err(WorkflowError::ValidationError(format!(
            "retry policy base delay ({}ms) exceeds max delay ({}ms)",
            policy.base_delay_ms, policy.max_delay_ms
        )));
    }
    if !(0.0..=1.0).contains(&policy.jitter_factor) {
        return Err(WorkflowError::ValidationError(format!(
            "retry policy jitter factor {} is outside [0, 1]",
            policy.jitter_factor
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML or JSON file, chosen by extension.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "yaml" | "yml" => parse_workflow_yaml(&std::fs::read_to_string(path)?),
        "json" => parse_workflow_json(&std::fs::read_to_string(path)?),
        _ => Err(WorkflowError::UnsupportedFormat(path.display().to_string())),
    }
}

/// Save a workflow definition to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all workflow definition files under `base_dir`.
///
/// Scans for `.yaml`, `.yml` and `.json` files recursively. Files that fail
/// to parse are logged and skipped.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" || ext == "json" {
                match load_workflow_file(&path) {
                    Ok(def) => results.push((path, def)),
                    Err(e) => {
                        tracing::warn!(?path, error = %e, "skipping unparseable workflow file");
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
