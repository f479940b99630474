//! `e2s full` / `e2s daily`: reconcile a roster against the destination.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;

use e2s_core::{RetryPolicy, SyncConfig};
use e2s_sync::{ActionKind, Retrier, RunMode, RunOptions, RunReport, StateStore};

use crate::samsara::{SamsaraClient, DEFAULT_BASE_URL};
use crate::{input, report};

/// Arguments shared by `e2s full` and `e2s daily`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Encompass customer export (CSV). For daily runs, the delta file.
    #[arg(long, visible_alias = "encompass-delta")]
    pub encompass_csv: PathBuf,

    /// Protected destination addresses (CSV `samsara_id,name` or YAML).
    #[arg(long)]
    pub warehouses: PathBuf,

    /// Directory for reports and run state.
    #[arg(long)]
    pub out_dir: PathBuf,

    /// YAML run configuration. Defaults to `<config dir>/e2s/config.yaml`.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Geofence radius in meters for source coordinates.
    #[arg(long, env = "E2S_DEFAULT_RADIUS_METERS")]
    pub radius_m: Option<u32>,

    /// Days an orphan stays quarantined before hard deletion.
    #[arg(long)]
    pub retention_days: Option<u32>,

    /// Hard-delete orphans whose retention window has elapsed.
    #[arg(long)]
    pub confirm_delete: bool,

    /// Route INACTIVE customers through the orphan lifecycle.
    #[arg(long)]
    pub delete_inactive: bool,

    /// Execute actions and save state. Without it the run is dry.
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

impl RunArgs {
    pub fn run(self, mode: RunMode) -> Result<ExitCode> {
        let config = self.resolve_config()?;
        let sources = input::read_roster_at(&self.encompass_csv)?;
        let denylist = input::read_denylist_at(&self.warehouses)
            .context("failed to load warehouses denylist")?;

        let token = match self.api_token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => token.to_owned(),
            _ => bail!("no API token: set SAMSARA_API_TOKEN or pass --api-token"),
        };

        let store = StateStore::open_at(&self.out_dir)
            .with_context(|| format!("failed to open state in {}", self.out_dir.display()))?;
        let mut client = SamsaraClient::new(
            &self.base_url,
            &token,
            Duration::from_millis(config.retry.min_interval_ms),
        );
        let mut retrier = Retrier::new(config.retry.clone());

        let options = RunOptions {
            mode,
            apply: self.apply,
            now: Utc::now(),
        };
        let run_report = e2s_sync::run(
            &mut client,
            &mut retrier,
            &store,
            &config,
            &sources,
            &denylist,
            options,
        )
        .context("reconciliation run failed")?;

        report::write_all(&self.out_dir, &sources, &run_report)?;
        print_summary(&run_report, &self.out_dir);

        Ok(if run_report.has_errors() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        })
    }

    fn resolve_config(&self) -> Result<SyncConfig> {
        let mut config = super::load_config(self.config.as_deref())?;
        if let Some(radius) = self.radius_m {
            config.radius_m = radius;
        }
        if let Some(days) = self.retention_days {
            config.retention_days = days;
        }
        config.confirm_delete |= self.confirm_delete;
        config.delete_inactive |= self.delete_inactive;
        if let Some(path) = &self.api_rate_config {
            config.retry = RetryPolicy::load_at(path)
                .with_context(|| format!("failed to load rate config {}", path.display()))?;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn print_summary(report: &RunReport, out_dir: &std::path::Path) {
    let prefix = if report.applied { "" } else { "[dry-run] " };
    let summary = report.log.summary();
    let changes: usize = summary
        .by_kind
        .iter()
        .filter(|(kind, _)| kind.is_mutation())
        .map(|(_, n)| n)
        .sum();
    println!(
        "{prefix}{} records reconciled, {changes} change(s) ({:?} run)",
        summary.total, report.mode
    );
    for kind in ActionKind::ALL {
        let count = summary.count(kind);
        if count == 0 {
            continue;
        }
        let label = format!("{:<16}", kind.as_str());
        let label = match kind {
            ActionKind::Create | ActionKind::Update => label.green(),
            ActionKind::Quarantine | ActionKind::AwaitRetention => label.yellow(),
            ActionKind::HardDelete | ActionKind::Error => label.red(),
            ActionKind::NoOp | ActionKind::Skip => label.bright_black(),
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
        args: RunArgs,
    }

    fn parse(extra: &[&str]) -> RunArgs {
        let mut argv = vec![
            "e2s",
            "--encompass-csv",
            "in.csv",
            "--warehouses",
            "w.csv",
            "--out-dir",
            "out",
        ];
        argv.extend_from_slice(extra);
        Harness::try_parse_from(argv).expect("parse").args
    }

    #[test]
    fn flags_override_config_file() {
        let dir = TempDir::new().expect("tmp");
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "radius_m: 75\nretention_days: 14\n").expect("write");
        let rate_path = dir.path().join("rate.json");
        std::fs::write(&rate_path, r#"{"max_attempts": 3, "min_interval_ms": 200}"#)
            .expect("write");

        let config_arg = config_path.to_string_lossy().into_owned();
        let rate_arg = rate_path.to_string_lossy().into_owned();
        let args = parse(&[
            "--config",
            &config_arg,
            "--retention-days",
            "7",
            "--confirm-delete",
            "--api-rate-config",
            &rate_arg,
        ]);
        let config = args.resolve_config().expect("config");
        assert_eq!(config.radius_m, 75);
        assert_eq!(config.retention_days, 7);
        assert!(config.confirm_delete);
        assert!(!config.delete_inactive);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.min_interval_ms, 200);
    }

    #[test]
    fn delta_alias_is_accepted() {
        let args = Harness::try_parse_from([
            "e2s",
            "--encompass-delta",
            "delta.csv",
            "--warehouses",
            "w.csv",
            "--out-dir",
            "out",
        ])
        .expect("parse")
        .args;
        assert_eq!(args.encompass_csv, PathBuf::from("delta.csv"));
        assert!(!args.apply);
    }

    #[test]
    fn zero_radius_is_rejected() {
        let dir = TempDir::new().expect("tmp");
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "{}\n").expect("write");
        let config_arg = config_path.to_string_lossy().into_owned();
        let args = parse(&["--config", &config_arg, "--radius-m", "0"]);
        assert!(args.resolve_config().is_err());
    }
}
