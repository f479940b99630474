//! Reconciler: one decision per matched, new, orphaned or rejected record.
//!
//! ```text
//! NEW      → CREATE | SKIP (inactive, delete target missing) | ERROR
//! MATCHED  → NO_OP | UPDATE | SKIP (inactive, denylisted) | ERROR
//! ORPHAN   → QUARANTINE        first detection
//!          → AWAIT_RETENTION   quarantined, window open or no confirm
//!          → HARD_DELETE       window elapsed and confirm set
//!          → SKIP              denylisted
//! REJECTED → ERROR
//! ```
//!
//! Decisions are pure: they read the fetched destinations, the loaded state
//! and the run configuration, and describe their effects as data. Nothing is
//! applied here.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use e2s_core::{
    AddressId, AddressPatch, AddressPayload, Denylist, DestinationRecord, RecordError, RowAction,
    SourceId, SourceRecord, SyncConfig, TagResolver,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::matcher::{self, is_managed, MatchConfidence, MatchOptions, Pairing, RunMode};
use crate::payload::{self, FieldChange, QuarantineStrategy, UpdatePlan};
use crate::state::{StateChange, StateSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Create,
    Update,
    NoOp,
    Skip,
    Quarantine,
    AwaitRetention,
    HardDelete,
    Error,
}

impl ActionKind {
    pub const ALL: [ActionKind; 8] = [
        ActionKind::Create,
        ActionKind::Update,
        ActionKind::NoOp,
        ActionKind::Skip,
        ActionKind::Quarantine,
        ActionKind::AwaitRetention,
        ActionKind::HardDelete,
        ActionKind::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Create => "CREATE",
            ActionKind::Update => "UPDATE",
            ActionKind::NoOp => "NO_OP",
            ActionKind::Skip => "SKIP",
            ActionKind::Quarantine => "QUARANTINE",
            ActionKind::AwaitRetention => "AWAIT_RETENTION",
            ActionKind::HardDelete => "HARD_DELETE",
            ActionKind::Error => "ERROR",
        }
    }

    /// Whether the action changes the destination when applied.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            ActionKind::Create | ActionKind::Update | ActionKind::Quarantine | ActionKind::HardDelete
        )
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a decision was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    NewRecord,
    FingerprintChanged,
    Drift,
    Unchanged,
    Inactive,
    Denylisted,
    Unscoped,
    DeleteTargetMissing,
    OrphanDetected,
    DeleteRequested,
    RetentionPending,
    ConfirmRequired,
    RetentionElapsed,
    ValidationError,
    ResolutionError,
    Conflict,
}

impl ReasonCode {
    fn for_error(error: &RecordError) -> Self {
        match error {
            RecordError::Validation { .. } => ReasonCode::ValidationError,
            RecordError::Resolution { .. } => ReasonCode::ResolutionError,
            RecordError::Conflict { .. } => ReasonCode::Conflict,
        }
    }
}

/// Destination call an action needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Create { payload: AddressPayload },
    Patch { patch: AddressPatch },
    Delete,
}

/// One decision, as logged and as handed to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub at: DateTime<Utc>,
    pub kind: ActionKind,
    pub reason: ReasonCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<SourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<AddressId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<MatchConfidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantined_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diff: Vec<FieldChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordError>,
    #[serde(default, skip_serializing_if = "StateChange::is_none")]
    pub state_change: StateChange,
}

impl Action {
    fn new(at: DateTime<Utc>, kind: ActionKind, reason: ReasonCode) -> Self {
        Self {
            at,
            kind,
            reason,
            source_id: None,
            destination_id: None,
            name: None,
            confidence: None,
            fingerprint: None,
            prior_fingerprint: None,
            quarantined_since: None,
            operation: None,
            diff: Vec::new(),
            error: None,
            state_change: StateChange::None,
        }
    }

    fn error(at: DateTime<Utc>, error: RecordError) -> Self {
        let mut action = Action::new(at, ActionKind::Error, ReasonCode::for_error(&error));
        action.error = Some(error);
        action
    }

    fn source(mut self, id: Option<&SourceId>, name: &str) -> Self {
        self.source_id = id.cloned();
        self.name = Some(name.to_owned());
        self
    }

    fn destination(mut self, dest: &DestinationRecord) -> Self {
        self.destination_id = Some(dest.id.clone());
        if self.name.is_none() {
            self.name = Some(dest.name.clone());
        }
        self
    }

    fn patch(mut self, plan: UpdatePlan) -> Self {
        self.operation = Some(Operation::Patch { patch: plan.patch });
        self.diff = plan.changes;
        self
    }
}

/// Everything a decision may read.
#[derive(Debug, Clone)]
pub struct ReconcileContext<'a> {
    pub config: &'a SyncConfig,
    pub mode: RunMode,
    pub resolver: &'a TagResolver,
    pub denylist: &'a Denylist,
    pub state: &'a StateSnapshot,
    pub now: DateTime<Utc>,
}

struct Decider<'a> {
    ctx: &'a ReconcileContext<'a>,
    sources: &'a [SourceRecord],
    destinations: &'a [DestinationRecord],
    normalizer: e2s_core::Normalizer,
    strategy: QuarantineStrategy,
}

impl Decider<'_> {
    fn decide(&self, pairing: &Pairing) -> Action {
        let now = self.ctx.now;
        match pairing {
            Pairing::Matched {
                source,
                destination,
                key,
                confidence,
            } => self.matched(
                &self.sources[*source],
                &self.destinations[*destination],
                key,
                *confidence,
            ),
            Pairing::New { source, key } => self.new_record(&self.sources[*source], key),
            Pairing::Orphan { destination } => {
                self.orphan(&self.destinations[*destination], ReasonCode::OrphanDetected)
            }
            Pairing::Rejected {
                source: None,
                destination: Some(d),
                error,
            } if self.ctx.denylist.matches(&self.destinations[*d]) => {
                let dest = &self.destinations[*d];
                tracing::debug!("SKIP denylisted {} despite: {error}", dest.id);
                Action::new(now, ActionKind::Skip, ReasonCode::Denylisted).destination(dest)
            }
            Pairing::Rejected {
                source,
                destination,
                error,
            } => {
                let mut action = Action::error(now, error.clone());
                if let Some(s) = source {
                    let src = &self.sources[*s];
                    action = action.source(Some(&src.id), &src.name);
                }
                if let Some(d) = destination {
                    action = action.destination(&self.destinations[*d]);
                }
                action
            }
        }
    }

    fn matched(
        &self,
        src: &SourceRecord,
        dest: &DestinationRecord,
        key: &SourceId,
        confidence: MatchConfidence,
    ) -> Action {
        let now = self.ctx.now;
        let base = |kind, reason| {
            let mut a = Action::new(now, kind, reason)
                .source(Some(key), &src.name)
                .destination(dest);
            a.confidence = Some(confidence);
            a
        };

        if self.ctx.denylist.matches(dest) {
            return base(ActionKind::Skip, ReasonCode::Denylisted);
        }
        if self.ctx.mode == RunMode::Daily && src.action == Some(RowAction::Delete) {
            return self.tag_source(self.orphan(dest, ReasonCode::DeleteRequested), key, confidence);
        }
        if src.status.is_inactive() {
            if self.ctx.config.delete_inactive {
                return self.tag_source(self.orphan(dest, ReasonCode::Inactive), key, confidence);
            }
            return base(ActionKind::Skip, ReasonCode::Inactive);
        }

        let desired = match payload::build_desired(
            src,
            key,
            self.ctx.resolver,
            &self.normalizer,
            self.ctx.config.radius_m,
            false,
        ) {
            Ok(d) => d,
            Err(error) => {
                let mut a = base(ActionKind::Error, ReasonCode::for_error(&error));
                a.error = Some(error);
                return a;
            }
        };

        let prior = self
            .ctx
            .state
            .get(&dest.id)
            .map(|e| e.fingerprint.as_str())
            .filter(|f| !f.is_empty())
            .or_else(|| dest.stored_fingerprint())
            .map(str::to_owned);
        let content_changed = prior
            .as_deref()
            .map_or(true, |p| !desired.fingerprint.matches(p));
        let plan = payload::plan_update(dest, &desired, self.ctx.resolver, content_changed);

        let mut action = if plan.is_empty() {
            base(ActionKind::NoOp, ReasonCode::Unchanged)
        } else {
            let reason = if content_changed {
                ReasonCode::FingerprintChanged
            } else {
                ReasonCode::Drift
            };
            base(ActionKind::Update, reason).patch(plan)
        };
        action.fingerprint = Some(desired.fingerprint.to_string());
        action.prior_fingerprint = prior;
        action.state_change = StateChange::Track {
            fingerprint: desired.fingerprint.to_string(),
        };
        tracing::debug!(
            "{} {key} -> {}: {:?}",
            action.kind,
            dest.id,
            action.reason
        );
        action
    }

    fn new_record(&self, src: &SourceRecord, key: &SourceId) -> Action {
        let now = self.ctx.now;
        let base = |kind, reason| Action::new(now, kind, reason).source(Some(key), &src.name);

        if src.action == Some(RowAction::Delete) {
            return base(ActionKind::Skip, ReasonCode::DeleteTargetMissing);
        }
        if src.status.is_inactive() {
            return base(ActionKind::Skip, ReasonCode::Inactive);
        }
        let built = payload::build_desired(
            src,
            key,
            self.ctx.resolver,
            &self.normalizer,
            self.ctx.config.radius_m,
            true,
        )
        .and_then(|desired| payload::create_payload(&desired).map(|p| (desired, p)));
        match built {
            Ok((desired, payload)) => {
                let mut action = base(ActionKind::Create, ReasonCode::NewRecord);
                action.fingerprint = Some(desired.fingerprint.to_string());
                action.operation = Some(Operation::Create { payload });
                action.state_change = StateChange::Track {
                    fingerprint: desired.fingerprint.to_string(),
                };
                tracing::debug!("CREATE {key}");
                action
            }
            Err(error) => {
                let mut action = base(ActionKind::Error, ReasonCode::for_error(&error));
                action.error = Some(error);
                action
            }
        }
    }

    /// Two-phase delete for a destination with no live source.
    fn orphan(&self, dest: &DestinationRecord, reason: ReasonCode) -> Action {
        let now = self.ctx.now;
        if self.ctx.denylist.matches(dest) {
            return Action::new(now, ActionKind::Skip, ReasonCode::Denylisted).destination(dest);
        }
        if !is_managed(self.ctx.resolver, dest) {
            return Action::new(now, ActionKind::Skip, ReasonCode::Unscoped).destination(dest);
        }

        let entry = self.ctx.state.get(&dest.id);
        let mark = self.strategy.mark(dest, now);
        let Some(since) = entry.and_then(|e| e.quarantined_since) else {
            let mut action = Action::new(now, ActionKind::Quarantine, reason).destination(dest);
            if let Some(plan) = mark {
                action = action.patch(plan);
            }
            action.quarantined_since = Some(now);
            action.state_change = StateChange::Quarantine { since: now };
            tracing::debug!("QUARANTINE {} since {now}", dest.id);
            return action;
        };

        let elapsed = now - since;
        let mut action = if elapsed >= self.ctx.config.retention() && self.ctx.config.confirm_delete {
            let mut a = Action::new(now, ActionKind::HardDelete, ReasonCode::RetentionElapsed)
                .destination(dest);
            a.operation = Some(Operation::Delete);
            a.state_change = StateChange::Forget;
            a
        } else {
            let reason = if elapsed >= self.ctx.config.retention() {
                ReasonCode::ConfirmRequired
            } else {
                ReasonCode::RetentionPending
            };
            let mut a = Action::new(now, ActionKind::AwaitRetention, reason).destination(dest);
            if let Some(plan) = mark {
                a = a.patch(plan);
            }
            a
        };
        action.quarantined_since = Some(since);
        tracing::debug!("{} {} (quarantined since {since})", action.kind, dest.id);
        action
    }

    fn tag_source(&self, mut action: Action, key: &SourceId, confidence: MatchConfidence) -> Action {
        action.source_id = Some(key.clone());
        action.confidence = Some(confidence);
        action
    }
}

/// Decides one action per record.
///
/// Returns [`SyncError::SafetyViolation`] if any mutating action would touch
/// an unmanaged or denylisted destination; nothing should be applied then.
pub fn reconcile(
    sources: &[SourceRecord],
    destinations: &[DestinationRecord],
    ctx: &ReconcileContext<'_>,
) -> Result<Vec<Action>, SyncError> {
    let normalizer = ctx.config.normalizer();
    let pairings = matcher::match_records(
        sources,
        destinations,
        ctx.resolver,
        &MatchOptions {
            mode: ctx.mode,
            normalizer: &normalizer,
            distance_threshold_m: ctx.config.distance_threshold_m,
        },
    );

    let decider = Decider {
        ctx,
        sources,
        destinations,
        normalizer,
        strategy: QuarantineStrategy::for_run(ctx.resolver),
    };
    let actions: Vec<Action> = pairings.par_iter().map(|p| decider.decide(p)).collect();

    check_safety(&actions, destinations, ctx)?;
    Ok(actions)
}

/// Every mutation must target a managed, non-denylisted destination.
fn check_safety(
    actions: &[Action],
    destinations: &[DestinationRecord],
    ctx: &ReconcileContext<'_>,
) -> Result<(), SyncError> {
    let by_id: BTreeMap<&AddressId, &DestinationRecord> =
        destinations.iter().map(|d| (&d.id, d)).collect();
    for action in actions {
        if action.operation.is_none() {
            continue;
        }
        let Some(id) = &action.destination_id else {
            continue;
        };
        let reason = match by_id.get(id) {
            None => Some("destination not in the fetched snapshot"),
            Some(d) if ctx.denylist.matches(d) => Some("destination is denylisted"),
            Some(d) if !is_managed(ctx.resolver, d) => Some("destination is not managed"),
            Some(_) => None,
        };
        if let Some(reason) = reason {
            tracing::error!("refusing {} on {id}: {reason}", action.kind);
            return Err(SyncError::SafetyViolation {
                destination: id.clone(),
                reason: reason.to_owned(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use e2s_core::{AccountStatus, SourceCoordinates, Tag, TagDirectory, TagId};

    fn resolver() -> TagResolver {
        TagResolver::new(
            TagDirectory::new(vec![
                Tag { id: TagId::from("scope"), name: "ManagedBy:EncompassSync".into() },
                Tag { id: TagId::from("q"), name: "CandidateDelete".into() },
            ]),
            "ManagedBy:EncompassSync",
            "CandidateDelete",
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn run_with(
        sources: &[SourceRecord],
        dests: &[DestinationRecord],
        state: &StateSnapshot,
        config: &SyncConfig,
        denylist: &Denylist,
        now: DateTime<Utc>,
    ) -> Result<Vec<Action>, SyncError> {
        let resolver = resolver();
        let ctx = ReconcileContext {
            config,
            mode: RunMode::Full,
            resolver: &resolver,
            denylist,
            state,
            now,
        };
        reconcile(sources, dests, &ctx)
    }

    fn run(sources: &[SourceRecord], dests: &[DestinationRecord]) -> Vec<Action> {
        run_with(
            sources,
            dests,
            &StateSnapshot::default(),
            &SyncConfig::default(),
            &Denylist::new(),
            t0(),
        )
        .expect("reconcile")
    }

    fn acme() -> SourceRecord {
        let mut s = SourceRecord::new("C100", "Acme Store");
        s.coordinates = SourceCoordinates::from_optional(Some(30.0), Some(-97.0));
        s
    }

    fn managed(id: &str) -> DestinationRecord {
        let mut d = DestinationRecord::new(id, "Old Site");
        d.tag_ids.insert(TagId::from("scope"));
        d
    }

    #[test]
    fn new_source_is_created_with_scope_tag() {
        let actions = run(&[acme()], &[]);
        assert_eq!(actions.len(), 1);
        let a = &actions[0];
        assert_eq!(a.kind, ActionKind::Create);
        assert_eq!(a.fingerprint.as_ref().map(String::len), Some(64));
        let Some(Operation::Create { payload }) = &a.operation else {
            panic!("expected create payload");
        };
        assert!(payload.tag_ids.contains(&TagId::from("scope")));
    }

    #[test]
    fn inactive_new_source_is_skipped() {
        let mut s = acme();
        s.status = AccountStatus::Inactive;
        let actions = run(&[s], &[]);
        assert_eq!(actions[0].kind, ActionKind::Skip);
        assert_eq!(actions[0].reason, ReasonCode::Inactive);
    }

    #[test]
    fn missing_coordinates_on_create_is_error_and_others_continue() {
        let mut bad = acme();
        bad.id = "C1".into();
        bad.coordinates = SourceCoordinates::Absent;
        let actions = run(&[bad, acme()], &[]);
        assert_eq!(actions[0].kind, ActionKind::Error);
        assert_eq!(actions[0].reason, ReasonCode::ValidationError);
        assert_eq!(actions[1].kind, ActionKind::Create);
    }

    #[test]
    fn orphan_first_seen_is_quarantined_now() {
        let actions = run(&[], &[managed("d1")]);
        assert_eq!(actions[0].kind, ActionKind::Quarantine);
        assert_eq!(actions[0].quarantined_since, Some(t0()));
        assert_eq!(actions[0].state_change, StateChange::Quarantine { since: t0() });
        assert!(matches!(actions[0].operation, Some(Operation::Patch { .. })));
    }

    #[test]
    fn denylisted_orphan_is_skipped() {
        let mut deny = Denylist::new();
        deny.add_name("old site");
        let actions = run_with(
            &[],
            &[managed("d1")],
            &StateSnapshot::default(),
            &SyncConfig::default(),
            &deny,
            t0(),
        )
        .unwrap();
        assert_eq!(actions[0].kind, ActionKind::Skip);
        assert_eq!(actions[0].reason, ReasonCode::Denylisted);
        assert!(actions[0].operation.is_none());
    }

    #[test]
    fn denylisted_destination_in_conflict_is_skipped() {
        let mut deny = Denylist::new();
        deny.add_id("d1");
        let mut dest = managed("d1");
        dest.external_ids.insert("encompassid".into(), "C1".into());
        let mut first = acme();
        first.id = SourceId::from("C1");
        let mut second = acme();
        second.id = SourceId::from("C1");
        let actions = run_with(
            &[first, second],
            &[dest],
            &StateSnapshot::default(),
            &SyncConfig::default(),
            &deny,
            t0(),
        )
        .unwrap();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0].kind, ActionKind::Error);
        assert_eq!(actions[1].kind, ActionKind::Error);
        assert_eq!(actions[2].kind, ActionKind::Skip);
        assert_eq!(actions[2].reason, ReasonCode::Denylisted);
        assert_eq!(actions[2].destination_id, Some(AddressId::from("d1")));
        assert!(actions[2].error.is_none());
    }

    #[test]
    fn quarantine_matures_only_with_confirm() {
        let mut state = StateSnapshot::default();
        state.apply(&"d1".into(), &StateChange::Quarantine { since: t0() });
        let mut config = SyncConfig::default();
        let dests = [managed("d1")];
        let deny = Denylist::new();

        let early = run_with(&[], &dests, &state, &config, &deny, t0() + Duration::days(29)).unwrap();
        assert_eq!(early[0].kind, ActionKind::AwaitRetention);
        assert_eq!(early[0].reason, ReasonCode::RetentionPending);

        let late = run_with(&[], &dests, &state, &config, &deny, t0() + Duration::days(31)).unwrap();
        assert_eq!(late[0].kind, ActionKind::AwaitRetention);
        assert_eq!(late[0].reason, ReasonCode::ConfirmRequired);

        config.confirm_delete = true;
        let late = run_with(&[], &dests, &state, &config, &deny, t0() + Duration::days(31)).unwrap();
        assert_eq!(late[0].kind, ActionKind::HardDelete);
        assert_eq!(late[0].operation, Some(Operation::Delete));
        assert_eq!(late[0].state_change, StateChange::Forget);
    }

    #[test]
    fn zero_retention_still_quarantines_first() {
        let mut config = SyncConfig::default();
        config.retention_days = 0;
        config.confirm_delete = true;
        let actions = run_with(
            &[],
            &[managed("d1")],
            &StateSnapshot::default(),
            &config,
            &Denylist::new(),
            t0(),
        )
        .unwrap();
        assert_eq!(actions[0].kind, ActionKind::Quarantine);
    }

    #[test]
    fn unmanaged_destinations_get_no_action() {
        let actions = run(&[], &[DestinationRecord::new("d1", "Depot")]);
        assert!(actions.is_empty());
    }

    #[test]
    fn matched_with_same_fingerprint_is_noop() {
        let created = run(&[acme()], &[]);
        let Some(Operation::Create { payload }) = &created[0].operation else {
            panic!("expected create");
        };
        let dest = DestinationRecord {
            id: "d1".into(),
            name: payload.name.clone(),
            formatted_address: payload.formatted_address.clone(),
            geofence: Some(payload.geofence.clone()),
            tag_ids: payload.tag_ids.iter().cloned().collect(),
            external_ids: payload.external_ids.clone(),
        };
        let actions = run(&[acme()], &[dest]);
        assert_eq!(actions[0].kind, ActionKind::NoOp);
        assert_eq!(actions[0].fingerprint, created[0].fingerprint);
    }

    #[test]
    fn safety_check_rejects_mutation_of_unmanaged_record() {
        let resolver = resolver();
        let config = SyncConfig::default();
        let state = StateSnapshot::default();
        let deny = Denylist::new();
        let ctx = ReconcileContext {
            config: &config,
            mode: RunMode::Full,
            resolver: &resolver,
            denylist: &deny,
            state: &state,
            now: t0(),
        };
        let dest = DestinationRecord::new("d1", "Depot");
        let mut action = Action::new(t0(), ActionKind::HardDelete, ReasonCode::RetentionElapsed)
            .destination(&dest);
        action.operation = Some(Operation::Delete);
        let err = check_safety(&[action], &[dest], &ctx).unwrap_err();
        assert!(matches!(err, SyncError::SafetyViolation { .. }));
    }
}
