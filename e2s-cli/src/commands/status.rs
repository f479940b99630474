//! `e2s status`: tracked and quarantined addresses from the last run.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use e2s_sync::{action_log, state, ActionKind, ActionLog, StateSnapshot};

/// Arguments for `e2s status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Directory a previous run wrote to.
    #[arg(long)]
    pub out_dir: PathBuf,

    /// YAML run configuration, for the retention window.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Retention window used to judge delete eligibility.
    #[arg(long)]
    pub retention_days: Option<u32>,

    /// Only list quarantined addresses.
    #[arg(long)]
    pub quarantined: bool,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let retention_days = match self.retention_days {
            Some(days) => days,
            None => super::load_config(self.config.as_deref())?.retention_days,
        };
        let snapshot = state::load_at(&self.out_dir)
            .with_context(|| format!("failed to read state in {}", self.out_dir.display()))?;

        let log_path = action_log::action_log_path_at(&self.out_dir);
        let last_run = if log_path.exists() {
            Some(ActionLog::read_jsonl_at(&log_path).context("failed to read action log")?)
        } else {
            None
        };

        let report = build_report(&snapshot, retention_days, Utc::now(), self.quarantined);
        if self.json {
            let payload = StatusJson {
                saved_at: snapshot.saved_at,
                retention_days,
                tracked: snapshot.records.len(),
                quarantined: report.iter().filter(|r| r.quarantined_since.is_some()).count(),
                last_run: last_run.as_ref().map(|log| {
                    let summary = log.summary();
                    ActionKind::ALL
                        .iter()
                        .map(|k| (k.as_str(), summary.count(*k)))
                        .filter(|(_, n)| *n > 0)
                        .collect()
                }),
                records: report,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize status JSON")?
            );
            return Ok(());
        }

        print_table(&snapshot, retention_days, report, last_run.as_ref());
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
struct RecordStatus {
    address_id: String,
    fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    quarantined_since: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quarantine_age_days: Option<i64>,
    delete_eligible: bool,
}

#[derive(Serialize)]
struct StatusJson {
    saved_at: Option<DateTime<Utc>>,
    retention_days: u32,
    tracked: usize,
    quarantined: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_run: Option<std::collections::BTreeMap<&'static str, usize>>,
    records: Vec<RecordStatus>,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "address")]
    address: String,
    #[tabled(rename = "fingerprint")]
    fingerprint: String,
    #[tabled(rename = "quarantined since")]
    since: String,
    #[tabled(rename = "age (days)")]
    age: String,
    #[tabled(rename = "delete")]
    eligible: String,
}

fn build_report(
    snapshot: &StateSnapshot,
    retention_days: u32,
    now: DateTime<Utc>,
    quarantined_only: bool,
) -> Vec<RecordStatus> {
    let retention = chrono::Duration::days(i64::from(retention_days));
    snapshot
        .records
        .iter()
        .filter(|(_, entry)| !quarantined_only || entry.quarantined_since.is_some())
        .map(|(id, entry)| {
            let age = entry.quarantined_since.map(|since| now - since);
            RecordStatus {
                address_id: id.0.clone(),
                fingerprint: entry.fingerprint.clone(),
                quarantined_since: entry.quarantined_since,
                quarantine_age_days: age.map(|a| a.num_days()),
                delete_eligible: age.is_some_and(|a| a >= retention),
            }
        })
        .collect()
}

fn print_table(
    snapshot: &StateSnapshot,
    retention_days: u32,
    rows: Vec<RecordStatus>,
    last_run: Option<&ActionLog>,
) {
    let quarantined = rows.iter().filter(|r| r.quarantined_since.is_some()).count();
    let eligible = rows.iter().filter(|r| r.delete_eligible).count();
    let saved = snapshot
        .saved_at
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "never".into());
    println!(
        "e2s v{} | {} tracked | {} quarantined | {} eligible | retention {}d | saved {}",
        env!("CARGO_PKG_VERSION"),
        snapshot.records.len(),
        quarantined,
        eligible,
        retention_days,
        saved,
    );

    if let Some(log) = last_run {
        let summary = log.summary();
        let parts: Vec<String> = ActionKind::ALL
            .iter()
            .filter(|k| summary.count(**k) > 0)
            .map(|k| format!("{} {}", k.as_str(), summary.count(*k)))
            .collect();
        println!("Last run: {}", parts.join(", "));
    }

    if rows.is_empty() {
        println!("No tracked addresses.");
        return;
    }

    let table_rows: Vec<StatusTableRow> = rows
        .into_iter()
        .map(|r| StatusTableRow {
            address: r.address_id,
            fingerprint: r.fingerprint.chars().take(12).collect(),
            since: r
                .quarantined_since
                .map(|t| t.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            age: r.quarantine_age_days.map(|d| d.to_string()).unwrap_or_default(),
            eligible: match (r.quarantined_since.is_some(), r.delete_eligible) {
                (true, true) => "■ eligible".red().bold().to_string(),
                (true, false) => "■ waiting".yellow().to_string(),
                (false, _) => "■ tracked".green().to_string(),
            },
        })
        .collect();
    let mut table = Table::new(table_rows);
    table.with(Style::rounded());
    println!("{table}");

    if eligible > 0 {
        println!("Run with --apply --confirm-delete to hard-delete eligible addresses.");
    }
}
