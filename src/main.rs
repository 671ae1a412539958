//! Binary entry point for the Ruslan provisioning planner.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use ruslan::{
    ConfigError, PlanScenario, PlannerConfig, PlannerSettings, ReconcileScenario, ScenarioError,
    scenario,
};

mod cli;

use cli::{Cli, PlanCommand, ReconcileCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
    #[error("failed to write report: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let settings = PlannerConfig::load_without_cli_args()?.settings()?;
    match cli {
        Cli::Plan(command) => plan(&command, settings, io::stdout()).await,
        Cli::Reconcile(command) => reconcile(&command, settings, io::stdout()),
    }
}

async fn plan(
    command: &PlanCommand,
    settings: PlannerSettings,
    target: impl Write,
) -> Result<i32, CliError> {
    let loaded: PlanScenario = scenario::load(&command.scenario)?;
    let report = scenario::run_plan(loaded, settings).await?;
    write_report(target, &report, command.compact)?;
    Ok(0)
}

fn reconcile(
    command: &ReconcileCommand,
    settings: PlannerSettings,
    target: impl Write,
) -> Result<i32, CliError> {
    let loaded: ReconcileScenario = scenario::load(&command.scenario)?;
    let reconciliation = scenario::run_reconcile(loaded, settings)?;
    write_report(target, &reconciliation, command.compact)?;
    Ok(0)
}

fn write_report(
    mut target: impl Write,
    report: &impl Serialize,
    compact: bool,
) -> Result<(), CliError> {
    let rendered = if compact {
        serde_json::to_string(report)
    } else {
        serde_json::to_string_pretty(report)
    }
    .map_err(|err| CliError::Output(err.to_string()))?;
    writeln!(target, "{rendered}").map_err(|err| CliError::Output(err.to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
