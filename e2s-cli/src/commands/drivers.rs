//! `e2s drivers`: reconcile a Paycom payroll export against Samsara drivers.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;

use e2s_core::{RetryPolicy, SyncConfig};
use e2s_sync::{DriverActionKind, DriverRunReport, Retrier, RunMode, RunOptions};

use crate::samsara::{SamsaraClient, DEFAULT_BASE_URL};
use crate::{input, report};

/// Arguments for `e2s drivers`.
#[derive(Args, Debug)]
pub struct DriversArgs {
    /// Paycom payroll export (CSV).
    #[arg(long)]
    pub paycom_csv: PathBuf,

    /// Directory for reports. Driver reports go to `<out-dir>/drivers/`.
    #[arg(long)]
    pub out_dir: PathBuf,

    /// YAML run configuration. Defaults to `<config dir>/e2s/config.yaml`.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Treat the export as partial: drivers it does not list are left alone.
    #[arg(long)]
    pub delta: bool,

    /// Execute actions. Without it the run is dry.
    #[arg(long)]
    pub apply: bool,

    /// JSON file with retry/rate settings for API calls.
    #[arg(long)]
    pub api_rate_config: Option<PathBuf>,

    #[arg(long, env = "SAMSARA_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    #[arg(long, env = "SAMSARA_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,
}

impl DriversArgs {
    pub fn run(self) -> Result<ExitCode> {
        let config = self.resolve_config()?;
        let sources = input::read_payroll_at(&self.paycom_csv)?;

        let token = match self.api_token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => token.to_owned(),
            _ => bail!("no API token: set SAMSARA_API_TOKEN or pass --api-token"),
        };
        let mut client = SamsaraClient::new(
            &self.base_url,
            &token,
            Duration::from_millis(config.retry.min_interval_ms),
        );
        let mut retrier = Retrier::new(config.retry.clone());

        let options = RunOptions {
            mode: if self.delta { RunMode::Daily } else { RunMode::Full },
            apply: self.apply,
            now: Utc::now(),
        };
        let run_report = e2s_sync::run_drivers(&mut client, &mut retrier, &config, &sources, options)
            .context("driver sync failed")?;

        let dir = report::write_driver_reports(&self.out_dir, &run_report)?;
        print_summary(&run_report, &dir);

        Ok(if run_report.has_errors() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        })
    }

    fn resolve_config(&self) -> Result<SyncConfig> {
        let mut config = super::load_config(self.config.as_deref())?;
        if let Some(path) = &self.api_rate_config {
            config.retry = RetryPolicy::load_at(path)
                .with_context(|| format!("failed to load rate config {}", path.display()))?;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn print_summary(report: &DriverRunReport, out_dir: &Path) {
    let prefix = if report.applied { "" } else { "[dry-run] " };
    let changes: usize = DriverActionKind::ALL
        .iter()
        .filter(|kind| kind.is_mutation())
        .map(|kind| report.count(*kind))
        .sum();
    println!(
        "{prefix}{} drivers reconciled, {changes} change(s) ({:?} run)",
        report.actions.len(),
        report.mode
    );
    for kind in DriverActionKind::ALL {
        let count = report.count(kind);
        if count == 0 {
            continue;
        }
        let label = format!("{:<16}", kind.as_str());
        let label = match kind {
            DriverActionKind::Create | DriverActionKind::Update | DriverActionKind::Reactivate => {
                label.green()
            }
            DriverActionKind::Deactivate => label.yellow(),
            DriverActionKind::Error => label.red(),
            DriverActionKind::NoOp | DriverActionKind::Skip => label.bright_black(),
        };
        println!("  {label} {count}");
    }
    let failed = report.failed_executions();
    if failed > 0 {
        println!("  {} {failed}", format!("{:<16}", "FAILED CALLS").red().bold());
    }
    if !report.applied {
        println!("Nothing was changed. Re-run with --apply to execute.");
    }
    println!("Reports written to {}", out_dir.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: DriversArgs,
    }

    #[test]
    fn defaults_to_a_dry_full_run() {
        let args = Harness::try_parse_from(["e2s", "--paycom-csv", "p.csv", "--out-dir", "out"])
            .expect("parse")
            .args;
        assert!(!args.apply);
        assert!(!args.delta);
        assert_eq!(args.paycom_csv, PathBuf::from("p.csv"));
    }

    #[test]
    fn empty_driver_scope_tag_is_rejected() {
        let dir = TempDir::new().expect("tmp");
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "driver_scope_tag: \"  \"\n").expect("write");
        let config_arg = config_path.to_string_lossy().into_owned();
        let args = Harness::try_parse_from([
            "e2s",
            "--paycom-csv",
            "p.csv",
            "--out-dir",
            "out",
            "--config",
            &config_arg,
        ])
        .expect("parse")
        .args;
        assert!(args.resolve_config().is_err());
    }
}
