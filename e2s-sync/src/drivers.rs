//! Payroll roster → destination driver reconciliation.
//!
//! ```text
//! NEW      → CREATE (active) | SKIP (inactive, not hired, no code) | ERROR
//! MATCHED  → NO_OP | UPDATE | DEACTIVATE | REACTIVATE | ERROR
//! ORPHAN   → DEACTIVATE  full mode only; carries an employee code, still active
//! ```
//!
//! Drivers match by employee code first. Drivers without a code can be
//! claimed by username. Drivers are never deleted, and the fingerprint lives
//! in the driver's own external ids, so there is no run state to persist.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use e2s_core::driver::{DRIVER_FINGERPRINT_KEY, EMPLOYEE_CODE_KEY, LEGACY_EMPLOYEE_CODE_KEY};
use e2s_core::external_id;
use e2s_core::normalize::normalize_phone;
use e2s_core::{
    ActivationStatus, DestinationDriver, DriverId, DriverPatch, DriverPayload, DriverSource,
    EmploymentStatus, Fingerprint, Normalizer, RecordError, SyncConfig, TagDirectory, TagId,
};
use serde::{Deserialize, Serialize};

use crate::api::DriverApi;
use crate::error::{ApiError, SyncError};
use crate::executor::ExecutionOutcome;
use crate::matcher::RunMode;
use crate::payload::FieldChange;
use crate::pipeline::RunOptions;
use crate::retry::{Retrier, Sleeper};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverActionKind {
    Create,
    Update,
    Deactivate,
    Reactivate,
    NoOp,
    Skip,
    Error,
}

impl DriverActionKind {
    pub const ALL: [DriverActionKind; 7] = [
        DriverActionKind::Create,
        DriverActionKind::Update,
        DriverActionKind::Deactivate,
        DriverActionKind::Reactivate,
        DriverActionKind::NoOp,
        DriverActionKind::Skip,
        DriverActionKind::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DriverActionKind::Create => "CREATE",
            DriverActionKind::Update => "UPDATE",
            DriverActionKind::Deactivate => "DEACTIVATE",
            DriverActionKind::Reactivate => "REACTIVATE",
            DriverActionKind::NoOp => "NO_OP",
            DriverActionKind::Skip => "SKIP",
            DriverActionKind::Error => "ERROR",
        }
    }

    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            DriverActionKind::Create
                | DriverActionKind::Update
                | DriverActionKind::Deactivate
                | DriverActionKind::Reactivate
        )
    }
}

impl std::fmt::Display for DriverActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverReason {
    NewDriver,
    FingerprintChanged,
    Drift,
    Unchanged,
    StatusActive,
    StatusInactive,
    StatusNotHired,
    Orphan,
    MissingEmployeeCode,
    ValidationError,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DriverOperation {
    Create { payload: DriverPayload },
    Patch { patch: DriverPatch },
}

/// One driver decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverAction {
    pub at: DateTime<Utc>,
    pub kind: DriverActionKind,
    pub reason: DriverReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<DriverId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<DriverOperation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diff: Vec<FieldChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordError>,
}

impl DriverAction {
    fn new(at: DateTime<Utc>, kind: DriverActionKind, reason: DriverReason) -> Self {
        Self {
            at,
            kind,
            reason,
            employee_code: None,
            driver_id: None,
            name: None,
            fingerprint: None,
            operation: None,
            diff: Vec::new(),
            error: None,
        }
    }

    fn error(at: DateTime<Utc>, error: RecordError) -> Self {
        let reason = match &error {
            RecordError::Conflict { .. } => DriverReason::Conflict,
            _ => DriverReason::ValidationError,
        };
        let mut action = DriverAction::new(at, DriverActionKind::Error, reason);
        action.error = Some(error);
        action
    }

    fn for_source(mut self, code: Option<&str>, src: &DriverSource) -> Self {
        self.employee_code = code.map(str::to_owned);
        self.name = Some(src.full_name()).filter(|n| !n.is_empty());
        self
    }

    fn for_destination(mut self, dest: &DestinationDriver) -> Self {
        self.driver_id = Some(dest.id.clone());
        if self.name.is_none() {
            self.name = Some(dest.name.clone());
        }
        if self.employee_code.is_none() {
            self.employee_code = dest.employee_code().map(str::to_owned);
        }
        self
    }
}

/// Everything a driver decision may read.
#[derive(Debug, Clone)]
pub struct DriverPlanContext<'a> {
    pub normalizer: &'a Normalizer,
    pub scope_tag: Option<&'a TagId>,
    pub mode: RunMode,
    pub now: DateTime<Utc>,
}

struct DriverIndex {
    by_code: BTreeMap<String, Vec<usize>>,
    by_username: BTreeMap<String, usize>,
}

impl DriverIndex {
    fn build(destinations: &[DestinationDriver]) -> Self {
        let mut by_code: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut by_username = BTreeMap::new();
        for (i, dest) in destinations.iter().enumerate() {
            if let Some(code) = dest.employee_code() {
                by_code.entry(external_id::sanitize(code)).or_default().push(i);
                continue;
            }
            // Only drivers without an employee code can be claimed by username.
            if let Some(user) = dest.username.as_deref().map(username_key) {
                if !user.is_empty() {
                    by_username.entry(user).or_insert(i);
                }
            }
        }
        Self {
            by_code,
            by_username,
        }
    }

    fn find(&self, code: &str, username: Option<&str>) -> Result<Option<usize>, RecordError> {
        match self.by_code.get(code).map(Vec::as_slice) {
            Some([only]) => return Ok(Some(*only)),
            Some(many) if many.len() > 1 => {
                return Err(RecordError::conflict(format!(
                    "{} drivers carry employee code {code}",
                    many.len()
                )))
            }
            _ => {}
        }
        Ok(username
            .map(username_key)
            .and_then(|u| self.by_username.get(&u).copied()))
    }
}

fn username_key(username: &str) -> String {
    username.trim().to_lowercase()
}

fn change(field: &str, before: impl Into<String>, after: impl Into<String>) -> FieldChange {
    let before = before.into();
    let after = after.into();
    FieldChange {
        field: field.to_owned(),
        before: Some(before).filter(|b| !b.is_empty()),
        after: Some(after).filter(|a| !a.is_empty()),
    }
}

fn join_tags(tags: &BTreeSet<TagId>) -> String {
    tags.iter().map(|t| t.0.as_str()).collect::<Vec<_>>().join(",")
}

struct Planner<'a> {
    ctx: &'a DriverPlanContext<'a>,
}

impl Planner<'_> {
    fn desired_tags(&self, base: &BTreeSet<TagId>, src: Option<&DriverSource>) -> BTreeSet<TagId> {
        let mut tags = base.clone();
        if let Some(src) = src {
            tags.extend(src.tag_ids.iter().cloned());
        }
        if let Some(scope) = self.ctx.scope_tag {
            tags.insert(scope.clone());
        }
        tags
    }

    fn new_driver(&self, src: &DriverSource, code: &str) -> DriverAction {
        let now = self.ctx.now;
        let base = |kind, reason| DriverAction::new(now, kind, reason).for_source(Some(code), src);
        match src.employment_status() {
            EmploymentStatus::Inactive => {
                return base(DriverActionKind::Skip, DriverReason::StatusInactive)
            }
            EmploymentStatus::NotHired => {
                return base(DriverActionKind::Skip, DriverReason::StatusNotHired)
            }
            EmploymentStatus::Active => {}
        }

        let name = src.full_name();
        let username = src.username.as_deref().map(str::trim).unwrap_or_default();
        let missing = if name.is_empty() {
            Some(("name", "first or last name is required"))
        } else if username.is_empty() {
            Some(("username", "required to create a driver"))
        } else {
            None
        };
        if let Some((field, message)) = missing {
            return DriverAction::error(now, RecordError::validation(field, message))
                .for_source(Some(code), src);
        }

        let fingerprint = Fingerprint::of_driver(self.ctx.normalizer, src);
        let external_ids = BTreeMap::from([
            (EMPLOYEE_CODE_KEY.to_owned(), code.to_owned()),
            (
                DRIVER_FINGERPRINT_KEY.to_owned(),
                fingerprint.short().to_owned(),
            ),
        ]);
        let payload = DriverPayload {
            name,
            username: username.to_owned(),
            phone: src.phone.trim().to_owned(),
            timezone: src.time_zone.clone().filter(|tz| !tz.trim().is_empty()),
            tag_ids: self.desired_tags(&BTreeSet::new(), Some(src)).into_iter().collect(),
            external_ids,
        };
        let mut action = base(DriverActionKind::Create, DriverReason::NewDriver);
        action.fingerprint = Some(fingerprint.to_string());
        action.operation = Some(DriverOperation::Create { payload });
        tracing::debug!("CREATE driver {code}");
        action
    }

    fn matched(&self, src: &DriverSource, code: &str, dest: &DestinationDriver) -> DriverAction {
        let normalizer = self.ctx.normalizer;
        let fingerprint = Fingerprint::of_driver(normalizer, src);
        let content_changed = dest
            .stored_fingerprint()
            .map_or(true, |stored| !fingerprint.matches(stored));

        let mut patch = DriverPatch::default();
        let mut diff = Vec::new();

        if content_changed {
            let name = src.full_name();
            if !name.is_empty() && normalizer.normalize(&name) != normalizer.normalize(&dest.name) {
                diff.push(change("name", dest.name.as_str(), name.as_str()));
                patch.name = Some(name);
            }
            let phone = src.phone.trim();
            if !phone.is_empty() && normalize_phone(phone) != normalize_phone(&dest.phone) {
                diff.push(change("phone", dest.phone.as_str(), phone));
                patch.phone = Some(phone.to_owned());
            }
            if let Some(tz) = src.time_zone.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
                if dest.time_zone.as_deref() != Some(tz) {
                    diff.push(change("timezone", dest.time_zone.clone().unwrap_or_default(), tz));
                    patch.timezone = Some(tz.to_owned());
                }
            }
        }

        let mut ids = dest.external_ids.clone();
        ids.remove(LEGACY_EMPLOYEE_CODE_KEY);
        ids.insert(EMPLOYEE_CODE_KEY.to_owned(), code.to_owned());
        if content_changed {
            ids.insert(
                DRIVER_FINGERPRINT_KEY.to_owned(),
                fingerprint.short().to_owned(),
            );
        }
        if ids != dest.external_ids {
            for key in ids.keys().chain(dest.external_ids.keys()).collect::<BTreeSet<_>>() {
                let before = dest.external_ids.get(key).cloned().unwrap_or_default();
                let after = ids.get(key).cloned().unwrap_or_default();
                if before != after {
                    diff.push(change(&format!("externalIds.{key}"), before, after));
                }
            }
            patch.external_ids = Some(ids);
        }

        let tags = self.desired_tags(&dest.tag_ids, Some(src));
        if tags != dest.tag_ids {
            diff.push(change("tagIds", join_tags(&dest.tag_ids), join_tags(&tags)));
            patch.tag_ids = Some(tags.into_iter().collect());
        }

        let status = src.employment_status();
        let (kind, reason) = match (dest.is_deactivated, status.is_active()) {
            (true, true) => {
                patch.driver_activation_status = Some(ActivationStatus::Active);
                diff.push(change("driverActivationStatus", "deactivated", "active"));
                (DriverActionKind::Reactivate, DriverReason::StatusActive)
            }
            (false, false) => {
                patch.driver_activation_status = Some(ActivationStatus::Deactivated);
                diff.push(change("driverActivationStatus", "active", "deactivated"));
                let reason = if status == EmploymentStatus::NotHired {
                    DriverReason::StatusNotHired
                } else {
                    DriverReason::StatusInactive
                };
                (DriverActionKind::Deactivate, reason)
            }
            _ if patch.is_empty() => (DriverActionKind::NoOp, DriverReason::Unchanged),
            _ if content_changed => (DriverActionKind::Update, DriverReason::FingerprintChanged),
            _ => (DriverActionKind::Update, DriverReason::Drift),
        };

        let mut action = DriverAction::new(self.ctx.now, kind, reason)
            .for_source(Some(code), src)
            .for_destination(dest);
        action.fingerprint = Some(fingerprint.to_string());
        if !patch.is_empty() {
            action.operation = Some(DriverOperation::Patch { patch });
            action.diff = diff;
        }
        tracing::debug!("{kind} driver {code} -> {}: {reason:?}", dest.id);
        action
    }

    /// Deactivates a managed, still-active driver the roster no longer lists.
    fn orphan(&self, dest: &DestinationDriver) -> Option<DriverAction> {
        if dest.is_deactivated {
            return None;
        }
        let scoped = self
            .ctx
            .scope_tag
            .is_some_and(|scope| dest.tag_ids.contains(scope));
        if dest.employee_code().is_none() {
            if scoped {
                tracing::debug!("leaving scoped driver {} alone: no employee code", dest.id);
            }
            return None;
        }

        let mut patch = DriverPatch {
            driver_activation_status: Some(ActivationStatus::Deactivated),
            ..Default::default()
        };
        let mut diff = vec![change("driverActivationStatus", "active", "deactivated")];
        let tags = self.desired_tags(&dest.tag_ids, None);
        if tags != dest.tag_ids {
            diff.push(change("tagIds", join_tags(&dest.tag_ids), join_tags(&tags)));
            patch.tag_ids = Some(tags.into_iter().collect());
        }
        let mut action =
            DriverAction::new(self.ctx.now, DriverActionKind::Deactivate, DriverReason::Orphan)
                .for_destination(dest);
        action.fingerprint = dest.stored_fingerprint().map(str::to_owned);
        action.operation = Some(DriverOperation::Patch { patch });
        action.diff = diff;
        tracing::debug!("DEACTIVATE orphan driver {}", dest.id);
        Some(action)
    }
}

/// Decides one action per payroll row, then one per orphaned driver in full
/// mode. Output follows roster order, then destination order.
pub fn plan_drivers(
    sources: &[DriverSource],
    destinations: &[DestinationDriver],
    ctx: &DriverPlanContext<'_>,
) -> Vec<DriverAction> {
    let index = DriverIndex::build(destinations);
    let planner = Planner { ctx };
    let now = ctx.now;

    let codes: Vec<Option<String>> = sources
        .iter()
        .map(|s| Some(s.employee_code.trim()).filter(|c| !c.is_empty()).map(external_id::sanitize))
        .collect();
    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    for code in codes.iter().flatten() {
        *seen.entry(code.as_str()).or_default() += 1;
    }

    let mut claimed: BTreeSet<usize> = BTreeSet::new();
    let mut out = Vec::with_capacity(sources.len());
    for (src, code) in sources.iter().zip(&codes) {
        let Some(code) = code else {
            out.push(
                DriverAction::new(now, DriverActionKind::Skip, DriverReason::MissingEmployeeCode)
                    .for_source(None, src),
            );
            continue;
        };
        let count = seen.get(code.as_str()).copied().unwrap_or_default();
        if count > 1 {
            let error = RecordError::conflict(format!(
                "employee code {code} appears {count} times in the roster"
            ));
            out.push(DriverAction::error(now, error).for_source(Some(code), src));
            continue;
        }
        match index.find(code, src.username.as_deref()) {
            Ok(Some(di)) => {
                claimed.insert(di);
                out.push(planner.matched(src, code, &destinations[di]));
            }
            Ok(None) => out.push(planner.new_driver(src, code)),
            Err(error) => out.push(DriverAction::error(now, error).for_source(Some(code), src)),
        }
    }

    if ctx.mode == RunMode::Full {
        for (di, dest) in destinations.iter().enumerate() {
            let listed = dest
                .employee_code()
                .is_some_and(|c| seen.contains_key(external_id::sanitize(c).as_str()));
            if claimed.contains(&di) || listed {
                continue;
            }
            out.extend(planner.orphan(dest));
        }
    }
    out
}

/// Applies every driver action in order. A failure is recorded and the next
/// action proceeds.
pub fn execute_drivers<A: DriverApi, S: Sleeper>(
    api: &mut A,
    retrier: &mut Retrier<S>,
    actions: &[DriverAction],
) -> Vec<ExecutionOutcome<DriverId>> {
    actions
        .iter()
        .map(|action| {
            let Some(operation) = &action.operation else {
                return ExecutionOutcome::NoCall;
            };
            let what = format!(
                "{} driver {}",
                action.kind,
                action
                    .driver_id
                    .as_ref()
                    .map(|d| d.0.as_str())
                    .or(action.employee_code.as_deref())
                    .unwrap_or_default()
            );
            let (result, attempts) = match (operation, &action.driver_id) {
                (DriverOperation::Create { payload }, _) => {
                    let out = retrier.call(&what, || api.create_driver(payload));
                    (out.result.map(Some), out.attempts)
                }
                (DriverOperation::Patch { patch }, Some(id)) => {
                    let out = retrier.call(&what, || api.patch_driver(id, patch));
                    (out.result.map(|()| None), out.attempts)
                }
                (DriverOperation::Patch { .. }, None) => {
                    return ExecutionOutcome::Failed {
                        error: ApiError::Transport(format!("{what}: no driver id")),
                        attempts: 0,
                    }
                }
            };
            ExecutionOutcome::from_call(&what, result, attempts)
        })
        .collect()
}

/// Everything a driver run produced.
#[derive(Debug)]
pub struct DriverRunReport {
    pub mode: RunMode,
    pub applied: bool,
    pub actions: Vec<DriverAction>,
    /// One per action, same order. Empty on dry runs.
    pub outcomes: Vec<ExecutionOutcome<DriverId>>,
}

impl DriverRunReport {
    pub fn count(&self, kind: DriverActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind == kind).count()
    }

    pub fn failed_executions(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_success()).count()
    }

    pub fn has_errors(&self) -> bool {
        self.count(DriverActionKind::Error) > 0 || self.failed_executions() > 0
    }
}

/// Reconciles a payroll roster against the live driver list.
pub fn run_drivers<A: DriverApi, S: Sleeper>(
    api: &mut A,
    retrier: &mut Retrier<S>,
    config: &SyncConfig,
    sources: &[DriverSource],
    options: RunOptions,
) -> Result<DriverRunReport, SyncError> {
    let tags = retrier.call("list tags", || api.list_tags()).result?;
    let destinations = retrier.call("list drivers", || api.list_drivers()).result?;
    tracing::info!(
        "fetched {} drivers and {} tags; {} payroll rows",
        destinations.len(),
        tags.len(),
        sources.len()
    );

    let directory = TagDirectory::new(tags);
    let scope_tag = directory.lookup(&config.driver_scope_tag).cloned();
    if scope_tag.is_none() {
        tracing::warn!(
            "driver scope tag {:?} not found in tag directory; drivers are not tagged",
            config.driver_scope_tag
        );
    }
    let normalizer = config.normalizer();
    let ctx = DriverPlanContext {
        normalizer: &normalizer,
        scope_tag: scope_tag.as_ref(),
        mode: options.mode,
        now: options.now,
    };
    let actions = plan_drivers(sources, &destinations, &ctx);
    for kind in DriverActionKind::ALL {
        let count = actions.iter().filter(|a| a.kind == kind).count();
        if count > 0 {
            tracing::info!("{kind}: {count}");
        }
    }

    if !options.apply {
        tracing::info!("dry run: no driver changes applied");
        return Ok(DriverRunReport {
            mode: options.mode,
            applied: false,
            actions,
            outcomes: Vec::new(),
        });
    }

    let outcomes = execute_drivers(api, retrier, &actions);
    let report = DriverRunReport {
        mode: options.mode,
        applied: true,
        actions,
        outcomes,
    };
    if report.failed_executions() > 0 {
        tracing::warn!("{} driver actions failed to apply", report.failed_executions());
    }
    Ok(report)
}
