//! `e2s diff`: unified field diffs recorded in the last action log.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use e2s_sync::{action_log, diff::diff_actions, ActionKind, ActionLog};

/// Arguments for `e2s diff`.
#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Directory a previous run wrote to.
    #[arg(long)]
    pub out_dir: PathBuf,

    /// Include every action with a field diff, not only updates.
    #[arg(long)]
    pub all: bool,
}

impl DiffArgs {
    pub fn run(self) -> Result<()> {
        let path = action_log::action_log_path_at(&self.out_dir);
        let log = ActionLog::read_jsonl_at(&path)
            .with_context(|| format!("failed to read {}; run `e2s full` first", path.display()))?;

        let kinds: &[ActionKind] = if self.all {
            &ActionKind::ALL
        } else {
            &[ActionKind::Update]
        };
        let diffs = diff_actions(log.entries(), kinds);
        if diffs.is_empty() {
            println!("No differences in {}.", path.display());
            return Ok(());
        }

        for diff in diffs {
            print!("{}", diff.unified_diff);
            if !diff.unified_diff.ends_with('\n') {
                println!();
            }
        }
        Ok(())
    }
}
