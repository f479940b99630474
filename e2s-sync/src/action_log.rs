//! Append-only action log.
//!
//! One JSON object per line, one line per decided record, in decision order.
//! The log is identical for dry and applied runs; execution outcomes are
//! reported separately.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{io_err, SyncError};
use crate::reconcile::{Action, ActionKind};

pub const ACTION_LOG_FILE: &str = "actions.jsonl";

/// Path of the action log inside `dir`.
pub fn action_log_path_at(dir: &Path) -> PathBuf {
    dir.join(ACTION_LOG_FILE)
}

/// Count of actions per kind. Every kind is present, zero included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub by_kind: BTreeMap<ActionKind, usize>,
}

impl Summary {
    pub fn count(&self, kind: ActionKind) -> usize {
        self.by_kind.get(&kind).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionLog {
    entries: Vec<Action>,
}

impl ActionLog {
    pub fn new(entries: Vec<Action>) -> Self {
        Self { entries }
    }

    pub fn push(&mut self, action: Action) {
        self.entries.push(action);
    }

    pub fn entries(&self) -> &[Action] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn of_kind(&self, kind: ActionKind) -> impl Iterator<Item = &Action> {
        self.entries.iter().filter(move |a| a.kind == kind)
    }

    pub fn has_errors(&self) -> bool {
        self.of_kind(ActionKind::Error).next().is_some()
    }

    pub fn summary(&self) -> Summary {
        let mut by_kind: BTreeMap<ActionKind, usize> =
            ActionKind::ALL.iter().map(|k| (*k, 0)).collect();
        for action in &self.entries {
            *by_kind.entry(action.kind).or_default() += 1;
        }
        Summary {
            total: self.entries.len(),
            by_kind,
        }
    }

    /// Writes the log as JSON lines, replacing any previous file.
    pub fn write_jsonl_at(&self, path: &Path) -> Result<(), SyncError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let file = std::fs::File::create(path).map_err(|e| io_err(path, e))?;
        let mut out = BufWriter::new(file);
        for action in &self.entries {
            serde_json::to_writer(&mut out, action)?;
            out.write_all(b"\n").map_err(|e| io_err(path, e))?;
        }
        out.flush().map_err(|e| io_err(path, e))?;
        tracing::info!("wrote {} actions to {}", self.entries.len(), path.display());
        Ok(())
    }

    /// Reads a log written by [`ActionLog::write_jsonl_at`]. Blank lines are
    /// skipped.
    pub fn read_jsonl_at(path: &Path) -> Result<Self, SyncError> {
        let file = std::fs::File::open(path).map_err(|e| io_err(path, e))?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| io_err(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(Self { entries })
    }
}

impl From<Vec<Action>> for ActionLog {
    fn from(entries: Vec<Action>) -> Self {
        Self::new(entries)
    }
}
