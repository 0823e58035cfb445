//! devflow command-line entry point.
//!
//! Binary name: `dflow`
//!
//! Parses arguments, installs tracing, then dispatches to the command
//! handlers in [`cli`].

mod cli;
mod state;

use std::process::ExitCode;

use clap::Parser;
use devflow_observe::tracing_setup::{init_tracing_with_level, level_for_verbosity, shutdown_tracing};

use cli::{Cli, Commands, RunsCommand};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let level = level_for_verbosity(cli.verbose, cli.quiet);
    if let Err(e) = init_tracing_with_level(cli.otel, level) {
        eprintln!("warning: tracing setup failed: {e}");
    }

    let out = cli::Output::new(cli.json, cli.quiet);
    let result = match cli.command {
        Commands::Validate { file } => cli::workflow::handle_validate(&file, cli.config.as_deref(), out).await,
        Commands::Run(args) => cli::workflow::handle_run(args, cli.config.as_deref(), out).await,
        Commands::Resume(args) => cli::workflow::handle_resume(args, cli.config.as_deref(), out).await,
        Commands::Runs { command } => match command {
            RunsCommand::List { limit } => cli::runs::handle_list(limit, out).await,
            RunsCommand::Show { run_id } => cli::runs::handle_show(&run_id, out).await,
        },
    };

    shutdown_tracing();
    result
}
