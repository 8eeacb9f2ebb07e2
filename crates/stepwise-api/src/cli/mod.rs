//! CLI command definitions for the `stepwise` binary.

pub mod run;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run multi-step workflows with retries, idempotency and compensation.
#[derive(Parser)]
#[command(name = "stepwise", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "STEPWISE_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow definition once.
    Run(run::RunArgs),

    /// Parse and validate a workflow definition without running it.
    Validate {
        /// Path to a `.yaml`, `.yml` or `.json` definition.
        file: PathBuf,
    },

    /// List the workflow definitions found under a directory.
    #[command(alias = "ls")]
    List {
        /// Directory to scan recursively.
        #[arg(default_value = "workflows")]
        dir: PathBuf,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn verbosity_flags_are_global() {
        let cli = Cli::parse_from(["stepwise", "validate", "wf.yaml", "-vv", "--json"]);
        assert_eq!(cli.verbose, 2);
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Validate { .. }));
    }

    #[test]
    fn run_accepts_key_and_variables() {
        let cli = Cli::parse_from([
            "stepwise", "run", "wf.yaml", "--key", "order-7", "--session", "s-1", "--var", "name=ada",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.key.as_deref(), Some("order-7"));
        assert_eq!(args.session, "s-1");
        assert_eq!(args.var, vec!["name=ada".to_string()]);
    }
}
