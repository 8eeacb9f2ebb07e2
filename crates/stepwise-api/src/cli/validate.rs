//! `stepwise validate` and `stepwise list`: inspect definitions without running them.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use stepwise_core::handler::HandlerRegistry;
use stepwise_core::workflow::definition::{discover_workflows, load_workflow_file};
use stepwise_infra::handlers::{InMemoryKvStore, ToolDispatcher, register_builtins};
use stepwise_types::workflow::WorkflowDefinition;

pub fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let def = load_workflow_file(file).with_context(|| format!("{} is invalid", file.display()))?;
    let unknown = unknown_handlers(&def, &builtin_registry());

    if json {
        let out = serde_json::json!({
            "valid": true,
            "id": def.id,
            "name": def.name,
            "steps": def.steps.len(),
            "compensation": def.compensation.len(),
            "unknown_handlers": unknown,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} '{}' is valid ({} steps)",
        style("✓").green(),
        style(&def.name).cyan(),
        def.steps.len()
    );
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Handler"),
            Cell::new("Retries"),
            Cell::new("Rollback"),
        ]);

    let policy = def.retry_policy.clone().unwrap_or_default();
    for step in &def.steps {
        let handler_cell = if unknown.contains(&step.handler) {
            Cell::new(format!("{} (not built in)", step.handler)).fg(Color::Yellow)
        } else {
            Cell::new(&step.handler)
        };
        let rollback = match def.compensation_for(&step.id) {
            Some(c) => c.handler.clone().unwrap_or_else(|| step.handler.clone()),
            None if def.has_compensation() => "own handler".to_string(),
            None => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(&step.id),
            handler_cell,
            Cell::new(step.effective_max_retries(&policy)),
            Cell::new(rollback),
        ]);
    }
    println!("{table}");

    if !unknown.is_empty() {
        println!();
        println!(
            "  {} handlers must be registered by the embedding application: {}",
            style("!").yellow(),
            unknown.join(", ")
        );
    }
    println!();
    Ok(())
}

pub fn handle_list(dir: &Path, json: bool) -> Result<()> {
    let found = discover_workflows(dir).with_context(|| format!("failed to scan {}", dir.display()))?;

    if json {
        let out: Vec<_> = found
            .iter()
            .map(|(path, def)| {
                serde_json::json!({
                    "path": path.display().to_string(),
                    "id": def.id,
                    "name": def.name,
                    "steps": def.steps.len(),
                    "compensates": def.has_compensation(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if found.is_empty() {
        println!();
        println!("  No workflows found under {}.", dir.display());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Id").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Steps"),
            Cell::new("Compensates"),
            Cell::new("Path"),
        ]);
    for (path, def) in &found {
        table.add_row(vec![
            Cell::new(&def.id),
            Cell::new(&def.name),
            Cell::new(def.steps.len()),
            Cell::new(if def.has_compensation() { "yes" } else { "no" }),
            Cell::new(path.display()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    register_builtins(&mut registry, Arc::new(InMemoryKvStore::new()), ToolDispatcher::with_stock_tools());
    registry
}

/// Handler names referenced by `def` (steps and rollbacks) that `registry` lacks.
fn unknown_handlers(def: &WorkflowDefinition, registry: &HandlerRegistry) -> Vec<String> {
    let referenced = def
        .steps
        .iter()
        .map(|s| s.handler.as_str())
        .chain(def.compensation.iter().filter_map(|c| c.handler.as_deref()));

    let mut unknown: Vec<String> = referenced
        .filter(|name| !registry.contains(name))
        .map(str::to_string)
        .collect();
    unknown.sort_unstable();
    unknown.dedup();
    unknown
}
