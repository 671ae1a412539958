//! Command-line interface definitions for the `ruslan` binary.
//!
//! The clap parser structures live here so both the binary and the build
//! script can use them when generating the manual page.

use camino::Utf8PathBuf;
use clap::Parser;

/// Top-level CLI for the `ruslan` binary.
#[derive(Debug, Parser)]
#[command(
    name = "ruslan",
    about = "Plan protected volume provisioning against a recorded topology",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Compile a creation scenario and print the batches it would submit.
    #[command(
        name = "plan",
        about = "Compile a creation scenario and print the batches it would submit"
    )]
    Plan(PlanCommand),
    /// Reconcile the capacities of a replication set.
    #[command(name = "reconcile", about = "Reconcile the capacities of a replication set")]
    Reconcile(ReconcileCommand),
}

/// Arguments for the `ruslan plan` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct PlanCommand {
    /// JSON scenario holding the store snapshot, request and proposals.
    #[arg(value_name = "SCENARIO")]
    pub(crate) scenario: Utf8PathBuf,
    /// Print the report on a single line.
    #[arg(long)]
    pub(crate) compact: bool,
}

/// Arguments for the `ruslan reconcile` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ReconcileCommand {
    /// JSON scenario holding the store snapshot and replication set.
    #[arg(value_name = "SCENARIO")]
    pub(crate) scenario: Utf8PathBuf,
    /// Print the report on a single line.
    #[arg(long)]
    pub(crate) compact: bool,
}
