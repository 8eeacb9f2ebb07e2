//! `stepwise run`: execute a workflow definition with the built-in handlers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Args;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Map, Value, json};
use tokio::task::JoinSet;

use stepwise_core::handler::HandlerRegistry;
use stepwise_core::workflow::context::{Collaborators, ExecutionContext};
use stepwise_core::workflow::definition::load_workflow_file;
use stepwise_core::workflow::orchestrator::{Orchestrator, OrchestratorError};
use stepwise_core::workflow::store::InMemoryExecutionStore;
use stepwise_infra::config::load_engine_config;
use stepwise_infra::handlers::{InMemoryKvStore, KvStore, ToolDispatcher, register_builtins};
use stepwise_types::workflow::RunResult;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the workflow definition.
    pub file: PathBuf,

    /// Idempotency key shared by every caller of this run.
    #[arg(long)]
    pub key: Option<String>,

    /// Session that owns the execution.
    #[arg(long, default_value = "cli")]
    pub session: String,

    /// User on whose behalf the workflow runs.
    #[arg(long)]
    pub user: Option<String>,

    /// Context variables as a JSON object.
    #[arg(long)]
    pub vars: Option<String>,

    /// A single context variable as `name=value` (value parsed as JSON when possible).
    #[arg(long)]
    pub var: Vec<String>,

    /// Directory holding `config.toml`.
    #[arg(long, env = "STEPWISE_CONFIG_DIR", default_value = ".")]
    pub config_dir: PathBuf,

    /// Number of concurrent callers to start with the same key.
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..))]
    pub callers: u32,
}

/// Outcome of one caller, success or failure.
struct CallerOutcome {
    caller: u32,
    result: Result<RunResult, OrchestratorError>,
}

pub async fn handle_run(args: RunArgs, json: bool) -> Result<()> {
    let definition = load_workflow_file(&args.file)
        .with_context(|| format!("failed to load {}", args.file.display()))?;
    let variables = parse_variables(args.vars.as_deref(), &args.var)?;

    if args.callers > 1 && args.key.is_none() {
        bail!("--callers greater than 1 needs --key, otherwise every caller runs on its own");
    }

    let config = load_engine_config(&args.config_dir).await;
    let kv = Arc::new(InMemoryKvStore::new());

    let mut registry = HandlerRegistry::new();
    register_builtins(&mut registry, Arc::clone(&kv), ToolDispatcher::with_stock_tools());

    let orchestrator = Arc::new(
        Orchestrator::new(Arc::new(InMemoryExecutionStore::new()), config).with_registry(registry),
    );

    let mut context = ExecutionContext::new(args.session.as_str())
        .with_collaborators(Collaborators::new().with("kv", Arc::clone(&kv)));
    if let Some(user) = &args.user {
        context = context.with_user(user.as_str());
    }
    for (name, value) in variables {
        context = context.with_variable(name, value);
    }

    tracing::debug!(
        workflow = definition.id.as_str(),
        callers = args.callers,
        "dispatching run"
    );

    let definition = Arc::new(definition);
    let mut callers = JoinSet::new();
    for caller in 0..args.callers {
        let orchestrator = Arc::clone(&orchestrator);
        let definition = Arc::clone(&definition);
        let context = context.clone();
        let key = args.key.clone();
        callers.spawn(async move {
            let result = orchestrator.run(&definition, context, key.as_deref()).await;
            CallerOutcome { caller, result }
        });
    }

    let mut outcomes = Vec::with_capacity(args.callers as usize);
    while let Some(joined) = callers.join_next().await {
        outcomes.push(joined.context("caller task panicked")?);
    }
    outcomes.sort_by_key(|o| o.caller);

    let kv_snapshot = snapshot(kv.as_ref()).await?;

    if json {
        print_json(&outcomes, &kv_snapshot)?;
    } else {
        print_table(&definition.name, &outcomes, &kv_snapshot);
    }

    if outcomes.iter().any(|o| o.result.is_err()) {
        bail!("workflow '{}' failed", definition.id);
    }
    Ok(())
}

/// Merge `--vars` (a JSON object) with `--var name=value` pairs; pairs win.
fn parse_variables(vars: Option<&str>, pairs: &[String]) -> Result<Vec<(String, Value)>> {
    let mut merged = Map::new();

    if let Some(raw) = vars {
        let parsed: Value = serde_json::from_str(raw).context("--vars is not valid JSON")?;
        let Value::Object(object) = parsed else {
            bail!("--vars must be a JSON object");
        };
        merged.extend(object);
    }

    for pair in pairs {
        let Some((name, raw)) = pair.split_once('=') else {
            bail!("--var expects name=value, got '{pair}'");
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("--var name must not be empty");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        merged.insert(name.to_string(), value);
    }

    Ok(merged.into_iter().collect())
}

async fn snapshot<S: KvStore>(kv: &S) -> Result<Vec<(String, Value)>> {
    let mut entries = Vec::new();
    for key in kv.list_keys().await? {
        if let Some(value) = kv.get(&key).await? {
            entries.push((key, value));
        }
    }
    Ok(entries)
}

fn print_json(outcomes: &[CallerOutcome], kv: &[(String, Value)]) -> Result<()> {
    let runs: Vec<Value> = outcomes
        .iter()
        .map(|o| match &o.result {
            Ok(result) => json!({ "caller": o.caller, "run": result }),
            Err(err) => json!({
                "caller": o.caller,
                "run": {
                    "success": false,
                    "execution_id": err.execution_id().map(|id| id.to_string()),
                    "error": err.to_string(),
                },
            }),
        })
        .collect();
    let kv: Map<String, Value> = kv.iter().cloned().collect();
    println!("{}", serde_json::to_string_pretty(&json!({ "runs": runs, "kv": kv }))?);
    Ok(())
}

fn print_table(workflow: &str, outcomes: &[CallerOutcome], kv: &[(String, Value)]) {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Caller"),
            Cell::new("Execution").fg(Color::Cyan),
            Cell::new("Outcome"),
            Cell::new("Steps"),
            Cell::new("Retries"),
            Cell::new("Duration"),
            Cell::new("Detail"),
        ]);

    for o in outcomes {
        match &o.result {
            Ok(r) => table.add_row(vec![
                Cell::new(o.caller),
                Cell::new(r.execution_id),
                Cell::new("completed").fg(Color::Green),
                Cell::new(r.metadata.steps_completed),
                Cell::new(r.metadata.retries_used),
                Cell::new(format!("{}ms", r.metadata.duration_ms)),
                Cell::new(r.result.as_ref().map(Value::to_string).unwrap_or_default()),
            ]),
            Err(err) => table.add_row(vec![
                Cell::new(o.caller),
                Cell::new(err.execution_id().map(|id| id.to_string()).unwrap_or_else(|| "-".into())),
                Cell::new("failed").fg(Color::Red),
                Cell::new("-"),
                Cell::new("-"),
                Cell::new("-"),
                Cell::new(err.to_string()),
            ]),
        };
    }

    println!();
    println!("  {} {}", style("Workflow").bold(), style(workflow).cyan());
    println!();
    println!("{table}");

    if !kv.is_empty() {
        println!();
        println!("  {}", style("Key-value store after run").dim());
        for (key, value) in kv {
            println!("    {} = {}", style(key).yellow(), value);
        }
    }
    println!();
}
