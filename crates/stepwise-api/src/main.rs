//! stepwise CLI entry point.
//!
//! Binary name: `stepwise`
//!
//! Parses CLI arguments, installs tracing, then dispatches to the command
//! handler. Engine state lives only for the duration of one command.

mod cli;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use stepwise_observe::tracing_setup::{self, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    tracing_setup::init_tracing(
        tracing_setup::verbosity_filter(cli.verbose, cli.quiet),
        format,
        cli.otel,
    )
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let outcome = match cli.command {
        Commands::Run(args) => cli::run::handle_run(args, cli.json).await,
        Commands::Validate { file } => cli::validate::handle_validate(&file, cli.json),
        Commands::List { dir } => cli::validate::handle_list(&dir, cli.json),
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "stepwise", &mut std::io::stdout());
            Ok(())
        }
    };

    tracing_setup::shutdown_tracing();
    outcome
}
