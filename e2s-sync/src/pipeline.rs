//! One reconciliation run, end to end.
//!
//! 1. Load prior state (the caller already holds the store lock).
//! 2. Fetch the tag directory and every address, with retries.
//! 3. Decide one action per record.
//! 4. Apply mode only: execute, commit state changes of successful actions,
//!    prune state for vanished destinations, save.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use e2s_core::{AddressId, Denylist, SourceRecord, SyncConfig, TagDirectory, TagResolver};

use crate::action_log::ActionLog;
use crate::api::AddressApi;
use crate::error::SyncError;
use crate::executor::{self, ExecutionOutcome};
use crate::matcher::RunMode;
use crate::reconcile::{self, ReconcileContext};
use crate::retry::{Retrier, Sleeper};
use crate::state::{StateSnapshot, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Execute actions and persist state. Otherwise a dry run.
    pub apply: bool,
    pub now: DateTime<Utc>,
}

/// Everything a run produced.
#[derive(Debug)]
pub struct RunReport {
    pub mode: RunMode,
    pub applied: bool,
    pub log: ActionLog,
    /// One per action, same order. Empty on dry runs.
    pub outcomes: Vec<ExecutionOutcome>,
    /// State as it stands after the run (unchanged on dry runs).
    pub state: StateSnapshot,
    pub pruned: usize,
}

impl RunReport {
    pub fn failed_executions(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_success()).count()
    }

    /// Non-zero exit status territory: any ERROR action or failed call.
    pub fn has_errors(&self) -> bool {
        self.log.has_errors() || self.failed_executions() > 0
    }
}

/// Runs reconciliation for `sources` against the live destination.
pub fn run<A: AddressApi, S: Sleeper>(
    api: &mut A,
    retrier: &mut Retrier<S>,
    store: &StateStore,
    config: &SyncConfig,
    sources: &[SourceRecord],
    denylist: &Denylist,
    options: RunOptions,
) -> Result<RunReport, SyncError> {
    let mut state = store.load()?;
    tracing::info!(
        "loaded state for {} records from {}",
        state.records.len(),
        store.dir().display()
    );

    let tags = retrier.call("list tags", || api.list_tags()).result?;
    let destinations = retrier
        .call("list addresses", || api.list_addresses())
        .result?;
    tracing::info!(
        "fetched {} addresses and {} tags; {} source records",
        destinations.len(),
        tags.len(),
        sources.len()
    );

    let resolver = TagResolver::new(
        TagDirectory::new(tags),
        &config.scope_tag,
        &config.quarantine_tag,
    );
    let ctx = ReconcileContext {
        config,
        mode: options.mode,
        resolver: &resolver,
        denylist,
        state: &state,
        now: options.now,
    };
    let log = ActionLog::new(reconcile::reconcile(sources, &destinations, &ctx)?);
    let summary = log.summary();
    for (kind, count) in summary.by_kind.iter().filter(|(_, c)| **c > 0) {
        tracing::info!("{kind}: {count}");
    }

    if !options.apply {
        tracing::info!("dry run: nothing applied, state not saved");
        return Ok(RunReport {
            mode: options.mode,
            applied: false,
            log,
            outcomes: Vec::new(),
            state,
            pruned: 0,
        });
    }

    let outcomes = executor::execute(api, retrier, log.entries());

    let live: BTreeSet<AddressId> = destinations.iter().map(|d| d.id.clone()).collect();
    let pruned = state.prune(&live);
    if pruned > 0 {
        tracing::info!("pruned {pruned} state entries for vanished addresses");
    }
    for (action, outcome) in log.entries().iter().zip(&outcomes) {
        if action.state_change.is_none() || !outcome.is_success() {
            continue;
        }
        if let Some(id) = outcome.target(action) {
            state.apply(id, &action.state_change);
        }
    }
    store.save(&state, options.now)?;

    let report = RunReport {
        mode: options.mode,
        applied: true,
        log,
        outcomes,
        state,
        pruned,
    };
    if report.failed_executions() > 0 {
        tracing::warn!("{} actions failed to apply", report.failed_executions());
    }
    Ok(report)
}
