//! Task orchestration engine CLI.
//!
//! Checks plan documents offline (schema + semantic validation against the
//! configured catalog) and summarizes exported execution traces.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use orchestrator::core::state::SessionState;
use orchestrator::core::validate::{Layering, validate};
use orchestrator::exit_codes;
use orchestrator::io::config::{OrchestratorConfig, load_config};
use orchestrator::io::plan_document::{load_plan, load_state};
use orchestrator::io::trace_export::{read_runs, stats_report};
use orchestrator::logging;

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Validate orchestration plans and summarize execution traces"
)]
struct Cli {
    /// Path to the orchestrator config (TOML).
    #[arg(long, global = true, default_value = "orchestrator.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a plan against the schema and the semantic validator; print its layers.
    Validate {
        /// Plan document (JSON).
        #[arg(long)]
        plan: PathBuf,
        /// Initial state document (JSON object of dotted keys).
        #[arg(long)]
        state: Option<PathBuf>,
    },
    /// Print latency statistics over exported runs.
    Stats {
        /// Export directory; defaults to `trace.export_dir` from the config.
        dir: Option<PathBuf>,
    },
}

fn main() {
    logging::init();
    let code = match run(Cli::parse()) {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    match cli.command {
        Command::Validate { plan, state } => cmd_validate(&config, &plan, state.as_deref()),
        Command::Stats { dir } => cmd_stats(&config, dir.as_deref()),
    }
}

fn cmd_validate(config: &OrchestratorConfig, plan_path: &Path, state_path: Option<&Path>) -> Result<()> {
    let plan = load_plan(plan_path)?;
    let state = match state_path {
        Some(path) => load_state(path)?,
        None => SessionState::new(),
    };
    let layering = validate(&plan, &state.key_set(), &config.name_catalog())
        .with_context(|| format!("plan {} is invalid", plan_path.display()))?;
    print!("{}", render_layers(&layering));
    Ok(())
}

fn cmd_stats(config: &OrchestratorConfig, dir: Option<&Path>) -> Result<()> {
    let dir = dir.unwrap_or(config.trace.export_dir.as_path());
    let runs = read_runs(dir)?;
    let report = stats_report(&runs);
    let mut payload = serde_json::to_string_pretty(&report).context("serialize stats report")?;
    payload.push('\n');
    print!("{payload}");
    Ok(())
}

fn render_layers(layering: &Layering) -> String {
    layering
        .layers()
        .iter()
        .enumerate()
        .map(|(index, steps)| format!("layer {index}: {}\n", steps.join(", ")))
        .collect()
}
