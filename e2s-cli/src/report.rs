//! Report files written under `--out-dir` after every run.

use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use e2s_core::SourceRecord;
use e2s_sync::{
    action_log, ActionKind, DriverAction, DriverRunReport, ExecutionOutcome, ReasonCode,
    RunReport,
};

use crate::input::duplicate_ids;

pub const DRY_RUN_DIFF_FILE: &str = "dry_run_diff.csv";
pub const SYNC_REPORT_FILE: &str = "sync_report.csv";
pub const ERRORS_FILE: &str = "errors.csv";
pub const DUPLICATES_FILE: &str = "duplicates.csv";
pub const DRIVERS_DIR: &str = "drivers";
pub const DRIVER_PLAN_FILE: &str = "drivers_sync_plan.csv";
pub const DRIVER_RESULTS_FILE: &str = "drivers_sync_results.csv";

#[derive(Debug, Serialize)]
struct DiffRow<'a> {
    encompass_id: &'a str,
    name: &'a str,
    action: &'static str,
}

#[derive(Debug, Serialize)]
struct MetricRow {
    metric: String,
    value: usize,
}

#[derive(Debug, PartialEq, Serialize)]
struct ErrorRow {
    error: String,
    row_name: String,
}

#[derive(Debug, PartialEq, Serialize)]
struct DuplicateRow {
    #[serde(rename = "type")]
    kind: &'static str,
    encompass_id: String,
    count: usize,
}

/// Writes the action log and every CSV report. `errors.csv` and
/// `duplicates.csv` are only written when they have rows; stale copies from
/// an earlier run are removed.
pub fn write_all(out_dir: &Path, sources: &[SourceRecord], report: &RunReport) -> Result<()> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    report
        .log
        .write_jsonl_at(&action_log::action_log_path_at(out_dir))
        .context("failed to write action log")?;

    let diff_rows: Vec<DiffRow> = report
        .log
        .entries()
        .iter()
        .map(|a| DiffRow {
            encompass_id: a.source_id.as_ref().map(|s| s.0.as_str()).unwrap_or(""),
            name: a.name.as_deref().unwrap_or(""),
            action: a.kind.as_str(),
        })
        .collect();
    write_csv(&out_dir.join(DRY_RUN_DIFF_FILE), &diff_rows)?;

    write_csv(&out_dir.join(SYNC_REPORT_FILE), &metrics(report))?;

    let errors = error_rows(report);
    write_optional(&out_dir.join(ERRORS_FILE), &errors)?;

    let duplicates = duplicate_rows(sources, report);
    write_optional(&out_dir.join(DUPLICATES_FILE), &duplicates)?;

    tracing::info!("reports written to {}", out_dir.display());
    Ok(())
}

fn metrics(report: &RunReport) -> Vec<MetricRow> {
    let summary = report.log.summary();
    let mut rows: Vec<MetricRow> = ActionKind::ALL
        .iter()
        .map(|kind| MetricRow {
            metric: kind.as_str().to_lowercase(),
            value: summary.count(*kind),
        })
        .collect();
    rows.push(MetricRow {
        metric: "total".into(),
        value: summary.total,
    });
    rows.push(MetricRow {
        metric: "failed_calls".into(),
        value: report.failed_executions(),
    });
    rows.push(MetricRow {
        metric: "pruned_state".into(),
        value: report.pruned,
    });
    rows
}

fn row_name(action: &e2s_sync::Action) -> String {
    action
        .name
        .clone()
        .or_else(|| action.source_id.as_ref().map(|s| s.0.clone()))
        .or_else(|| action.destination_id.as_ref().map(|d| d.0.clone()))
        .unwrap_or_default()
}

fn error_rows(report: &RunReport) -> Vec<ErrorRow> {
    let entries = report.log.entries();
    let decided = entries.iter().filter_map(|a| {
        a.error.as_ref().map(|e| ErrorRow {
            error: format!("{}: {e}", e.reason_code()),
            row_name: row_name(a),
        })
    });
    let failed = entries
        .iter()
        .zip(&report.outcomes)
        .filter_map(|(a, outcome)| match outcome {
            ExecutionOutcome::Failed { error, attempts } => Some(ErrorRow {
                error: format!("{} failed after {attempts} attempt(s): {error}", a.kind),
                row_name: row_name(a),
            }),
            _ => None,
        });
    decided.chain(failed).collect()
}

fn duplicate_rows(sources: &[SourceRecord], report: &RunReport) -> Vec<DuplicateRow> {
    let mut rows: Vec<DuplicateRow> = duplicate_ids(sources)
        .into_iter()
        .map(|(id, count)| DuplicateRow {
            kind: "source",
            encompass_id: id,
            count,
        })
        .collect();

    let mut conflicts: BTreeMap<String, usize> = BTreeMap::new();
    for action in report
        .log
        .entries()
        .iter()
        .filter(|a| a.reason == ReasonCode::Conflict)
    {
        let key = action
            .source_id
            .as_ref()
            .map(|s| s.0.clone())
            .or_else(|| action.destination_id.as_ref().map(|d| d.0.clone()))
            .unwrap_or_default();
        *conflicts.entry(key).or_default() += 1;
    }
    rows.extend(conflicts.into_iter().map(|(id, count)| DuplicateRow {
        kind: "conflict",
        encompass_id: id,
        count,
    }));
    rows
}

// ---------------------------------------------------------------------------
// Driver reports
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct DriverPlanRow<'a> {
    employee_code: &'a str,
    driver_id: &'a str,
    name: &'a str,
    action: &'static str,
    reason: String,
    fingerprint: &'a str,
}

#[derive(Debug, Serialize)]
struct DriverDiffRow<'a> {
    employee_code: &'a str,
    driver_id: &'a str,
    action: &'static str,
    field: &'a str,
    current: &'a str,
    desired: &'a str,
}

#[derive(Debug, PartialEq, Serialize)]
struct DriverResultRow {
    employee_code: String,
    driver_id: String,
    action: &'static str,
    status: &'static str,
    message: String,
}

fn code_of(a: &DriverAction) -> &str {
    a.employee_code.as_deref().unwrap_or("")
}

fn driver_of(a: &DriverAction) -> &str {
    a.driver_id.as_ref().map(|d| d.0.as_str()).unwrap_or("")
}

/// Writes the driver action log, plan, per-field diff and, for applied runs,
/// per-action results under `<out_dir>/drivers/`. Returns that directory.
pub fn write_driver_reports(out_dir: &Path, report: &DriverRunReport) -> Result<PathBuf> {
    let dir = out_dir.join(DRIVERS_DIR);
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let log_path = action_log::action_log_path_at(&dir);
    let file = std::fs::File::create(&log_path)
        .with_context(|| format!("failed to create {}", log_path.display()))?;
    let mut out = BufWriter::new(file);
    for action in &report.actions {
        serde_json::to_writer(&mut out, action)
            .with_context(|| format!("failed to write {}", log_path.display()))?;
        out.write_all(b"\n")
            .with_context(|| format!("failed to write {}", log_path.display()))?;
    }
    out.flush()
        .with_context(|| format!("failed to flush {}", log_path.display()))?;

    let plan: Vec<DriverPlanRow> = report
        .actions
        .iter()
        .map(|a| DriverPlanRow {
            employee_code: code_of(a),
            driver_id: driver_of(a),
            name: a.name.as_deref().unwrap_or(""),
            action: a.kind.as_str(),
            reason: serde_json::to_value(a.reason)
                .ok()
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_default(),
            fingerprint: a.fingerprint.as_deref().unwrap_or(""),
        })
        .collect();
    write_csv(&dir.join(DRIVER_PLAN_FILE), &plan)?;

    let diff: Vec<DriverDiffRow> = report
        .actions
        .iter()
        .flat_map(|a| {
            a.diff.iter().map(move |c| DriverDiffRow {
                employee_code: code_of(a),
                driver_id: driver_of(a),
                action: a.kind.as_str(),
                field: &c.field,
                current: c.before.as_deref().unwrap_or(""),
                desired: c.after.as_deref().unwrap_or(""),
            })
        })
        .collect();
    write_csv(&dir.join(DRY_RUN_DIFF_FILE), &diff)?;

    let results = driver_result_rows(report);
    write_optional(&dir.join(DRIVER_RESULTS_FILE), &results)?;

    tracing::info!("driver reports written to {}", dir.display());
    Ok(dir)
}

fn driver_result_rows(report: &DriverRunReport) -> Vec<DriverResultRow> {
    report
        .actions
        .iter()
        .zip(&report.outcomes)
        .filter(|(a, _)| a.operation.is_some())
        .map(|(a, outcome)| {
            let (status, message, created) = match outcome {
                ExecutionOutcome::Applied { created, attempts } => {
                    ("ok", format!("{attempts} attempt(s)"), created.as_ref())
                }
                ExecutionOutcome::Failed { error, attempts } => (
                    "failed",
                    format!("failed after {attempts} attempt(s): {error}"),
                    None,
                ),
                ExecutionOutcome::NoCall => ("skipped", String::new(), None),
            };
            DriverResultRow {
                employee_code: code_of(a).to_owned(),
                driver_id: created.map_or_else(|| driver_of(a).to_owned(), |id| id.0.clone()),
                action: a.kind.as_str(),
                status,
                message,
            }
        })
        .collect()
}

fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for row in rows {
        wtr.serialize(row)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    wtr.flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

fn write_optional<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if rows.is_empty() {
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove stale {}", path.display()))?;
        }
        return Ok(());
    }
    write_csv(path, rows)
}
