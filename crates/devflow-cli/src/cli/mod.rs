//! CLI command definitions for the `dflow` binary.
//!
//! Uses clap derive macros. Workflow files are validated and run directly
//! from disk; run records live in the SQLite database under the data
//! directory (`DEVFLOW_DATA_DIR` or `~/.devflow`).

pub mod runs;
pub mod workflow;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use comfy_table::{Cell, Color};
use devflow_types::run::{RunStatus, StepStatus};

/// Run developer workflows with retries, budgets and quality gates.
#[derive(Parser)]
#[command(name = "dflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Engine configuration file (defaults to `config.toml` in the data directory).
    #[arg(long, global = true, env = "DEVFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse and validate a workflow file without running it.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Run a workflow against a capability gateway.
    Run(RunArgs),

    /// Resume an interrupted run from its last checkpoint.
    Resume(ResumeArgs),

    /// Inspect recorded runs.
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
}

/// Gateway connection flags shared by `run` and `resume`.
#[derive(Args, Clone)]
pub struct GatewayArgs {
    /// Base URL of the capability gateway.
    #[arg(long, env = "DEVFLOW_GATEWAY")]
    pub gateway: String,

    /// Environment variable holding the gateway bearer token.
    #[arg(long, default_value = "DEVFLOW_GATEWAY_TOKEN")]
    pub token_env: String,
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to the workflow YAML file.
    pub file: PathBuf,

    /// Workflow input as `key=value` (value parsed as JSON when possible).
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,

    #[command(flatten)]
    pub gateway: GatewayArgs,
}

#[derive(Args)]
pub struct ResumeArgs {
    /// Run ID to resume.
    pub run_id: String,

    /// The workflow file the run was started from (must be unchanged).
    pub file: PathBuf,

    #[command(flatten)]
    pub gateway: GatewayArgs,
}

#[derive(Subcommand)]
pub enum RunsCommand {
    /// List the most recent runs.
    #[command(alias = "ls")]
    List {
        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show one run with its step results.
    Show {
        /// Run ID (full UUID).
        run_id: String,
    },
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

/// Output mode chosen by the global flags.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    pub fn new(json: bool, quiet: bool) -> Self {
        Self { json, quiet }
    }

    /// Styled, human-oriented output is wanted.
    pub fn styled(self) -> bool {
        !self.json && !self.quiet
    }
}

pub fn run_status_cell(status: RunStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        RunStatus::Pending => cell.fg(Color::Yellow),
        RunStatus::Running => cell.fg(Color::Blue),
        RunStatus::Completed => cell.fg(Color::Green),
        RunStatus::Failed => cell.fg(Color::Red),
        RunStatus::Aborted => cell.fg(Color::DarkYellow),
    }
}

pub fn step_status_cell(status: StepStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        StepStatus::Success => cell.fg(Color::Green),
        StepStatus::Failed => cell.fg(Color::Red),
        StepStatus::Skipped => cell.fg(Color::Grey),
        StepStatus::RolledBack => cell.fg(Color::Magenta),
    }
}

pub fn styled_status(status: RunStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        RunStatus::Completed => console::style(text).green().bold(),
        RunStatus::Failed => console::style(text).red().bold(),
        RunStatus::Aborted => console::style(text).yellow().bold(),
        RunStatus::Pending | RunStatus::Running => console::style(text).blue(),
    }
}

pub fn format_cost(cost: f64) -> String {
    format!("${cost:.4}")
}

pub fn format_duration_ms(ms: u64) -> String {
    if ms < 1_000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1_000)
    }
}
