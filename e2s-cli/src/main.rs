//! e2s: Encompass → Samsara address reconciliation CLI, with a Paycom →
//! Samsara driver sync alongside.
//!
//! # Usage
//!
//! ```text
//! e2s full  --encompass-csv <file> --warehouses <file> --out-dir <dir> [--apply] [--confirm-delete]
//! e2s daily --encompass-delta <file> --warehouses <file> --out-dir <dir> [--apply] [--confirm-delete]
//! e2s drivers --paycom-csv <file> --out-dir <dir> [--delta] [--apply]
//! e2s status --out-dir <dir> [--json]
//! e2s diff --out-dir <dir> [--all]
//! ```
//!
//! Runs are dry by default. Exit status is non-zero when any record ends in
//! an ERROR action or an applied call failed.

mod commands;
mod input;
mod logging;
mod report;
mod samsara;

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{diff::DiffArgs, drivers::DriversArgs, run::RunArgs, status::StatusArgs};
use e2s_sync::RunMode;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "e2s",
    version,
    about = "Reconcile Encompass customers into Samsara addresses",
    long_about = None,
)]
struct Cli {
    /// Log filter, e.g. `debug` or `e2s_sync=debug`. Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile a complete roster; unclaimed managed addresses are orphans.
    Full(RunArgs),

    /// Reconcile a delta roster; only listed rows are acted upon.
    Daily(RunArgs),

    /// Reconcile a payroll export into drivers; unlisted drivers are deactivated.
    Drivers(DriversArgs),

    /// Show tracked and quarantined addresses from the last run.
    Status(StatusArgs),

    /// Show field diffs recorded in the last action log.
    Diff(DiffArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref(), cli.log_json);
    match cli.command {
        Commands::Full(args) => args.run(RunMode::Full),
        Commands::Daily(args) => args.run(RunMode::Daily),
        Commands::Drivers(args) => args.run(),
        Commands::Status(args) => args.run().map(|()| ExitCode::SUCCESS),
        Commands::Diff(args) => args.run().map(|()| ExitCode::SUCCESS),
    }
}
