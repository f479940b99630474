//! Desired destination state for a source record and the minimal patch
//! that moves an existing address there.
//!
//! Fields covered by the fingerprint (name, formatted address, status and
//! the other managed external ids) are only rewritten when the fingerprint
//! moved. Scope markers, legacy key cleanup, quarantine markers, tags and
//! the geofence are checked on every run.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use e2s_core::external_id::{self, sanitize};
use e2s_core::{
    AddressPatch, AddressPayload, CircleGeofence, DestinationRecord, Fingerprint, Geofence,
    Normalizer, RecordError, SourceCoordinates, SourceId, SourceRecord, TagId, TagResolver,
};
use serde::{Deserialize, Serialize};

const COORD_EPSILON: f64 = 1e-7;

/// One changed field, rendered as text for logs and diffs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

impl FieldChange {
    fn new(field: impl Into<String>, before: Option<String>, after: Option<String>) -> Self {
        Self {
            field: field.into(),
            before,
            after,
        }
    }
}

/// What to do with the geofence.
#[derive(Debug, Clone, PartialEq)]
pub enum GeofenceIntent {
    Set(Geofence),
    /// No usable source coordinates; keep whatever the destination has.
    Preserve,
}

/// The state a managed address should be in.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredAddress {
    pub name: String,
    pub formatted_address: String,
    pub geofence: GeofenceIntent,
    /// Scope, Location and Company tags.
    pub tag_ids: BTreeSet<TagId>,
    /// Managed external ids only.
    pub external_ids: BTreeMap<String, String>,
    pub fingerprint: Fingerprint,
}

/// Builds the desired address for `source`.
///
/// `creating` makes missing coordinates an error; on update they leave the
/// existing geofence alone.
pub fn build_desired(
    source: &SourceRecord,
    key: &SourceId,
    resolver: &TagResolver,
    normalizer: &Normalizer,
    radius_m: u32,
    creating: bool,
) -> Result<DesiredAddress, RecordError> {
    let geofence = match &source.coordinates {
        SourceCoordinates::Point(p) => GeofenceIntent::Set(Geofence::Circle(CircleGeofence {
            latitude: p.latitude,
            longitude: p.longitude,
            radius_meters: radius_m,
        })),
        SourceCoordinates::Absent if creating => {
            return Err(RecordError::validation(
                "coordinates",
                "latitude/longitude are required to create an address",
            ))
        }
        SourceCoordinates::Absent => GeofenceIntent::Preserve,
        SourceCoordinates::Malformed(message) => {
            return Err(RecordError::validation("coordinates", message.clone()))
        }
    };

    let mut tag_ids = BTreeSet::new();
    if let Some(scope) = resolver.scope_tag() {
        tag_ids.insert(scope.clone());
    }
    if let Some(id) = resolver.resolve_category("location", &source.location)? {
        tag_ids.insert(id);
    }
    if let Some(id) = resolver.resolve_category("company", &source.company)? {
        tag_ids.insert(id);
    }

    let fingerprint = Fingerprint::of_source(normalizer, source);
    let mut external_ids = BTreeMap::new();
    external_ids.insert(external_id::ENCOMPASS_ID_KEY.to_owned(), key.0.clone());
    let status = sanitize(source.status.as_str());
    if !status.is_empty() {
        external_ids.insert(external_id::STATUS_KEY.to_owned(), status);
    }
    external_ids.insert(
        external_id::MANAGED_KEY.to_owned(),
        external_id::MANAGED_FLAG.to_owned(),
    );
    external_ids.insert(
        external_id::FINGERPRINT_KEY.to_owned(),
        fingerprint.short().to_owned(),
    );
    if let Some(kind) = source
        .record_type
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        external_ids.insert(external_id::TYPE_KEY.to_owned(), sanitize(kind));
    }

    Ok(DesiredAddress {
        name: source.name.trim().to_owned(),
        formatted_address: source.address.trim().to_owned(),
        geofence,
        tag_ids,
        external_ids,
        fingerprint,
    })
}

/// Creation body for a desired address.
pub fn create_payload(desired: &DesiredAddress) -> Result<AddressPayload, RecordError> {
    let GeofenceIntent::Set(geofence) = &desired.geofence else {
        return Err(RecordError::validation(
            "coordinates",
            "latitude/longitude are required to create an address",
        ));
    };
    Ok(AddressPayload {
        name: desired.name.clone(),
        formatted_address: desired.formatted_address.clone(),
        geofence: geofence.clone(),
        tag_ids: desired.tag_ids.iter().cloned().collect(),
        external_ids: desired.external_ids.clone(),
    })
}

/// Patch plus the per-field changes it carries.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdatePlan {
    pub patch: AddressPatch,
    pub changes: Vec<FieldChange>,
}

impl UpdatePlan {
    pub fn is_empty(&self) -> bool {
        self.patch.is_empty()
    }
}

fn geofence_drifted(existing: Option<&Geofence>, desired: &Geofence) -> bool {
    match (existing, desired) {
        (None, _) => true,
        (Some(Geofence::Circle(a)), Geofence::Circle(b)) => {
            (a.latitude - b.latitude).abs() > COORD_EPSILON
                || (a.longitude - b.longitude).abs() > COORD_EPSILON
                || a.radius_meters != b.radius_meters
        }
        (Some(_), _) => true,
    }
}

fn join_tags(tags: &BTreeSet<TagId>) -> String {
    tags.iter().map(|t| t.0.as_str()).collect::<Vec<_>>().join(",")
}

/// Minimal patch moving `existing` to `desired`.
///
/// `content_changed` is false when the prior fingerprint equals the
/// desired one; fingerprinted fields are then left untouched.
pub fn plan_update(
    existing: &DestinationRecord,
    desired: &DesiredAddress,
    resolver: &TagResolver,
    content_changed: bool,
) -> UpdatePlan {
    let mut plan = UpdatePlan::default();

    if content_changed {
        if existing.name != desired.name {
            plan.changes.push(FieldChange::new(
                "name",
                Some(existing.name.clone()),
                Some(desired.name.clone()),
            ));
            plan.patch.name = Some(desired.name.clone());
        }
        if existing.formatted_address != desired.formatted_address {
            plan.changes.push(FieldChange::new(
                "formattedAddress",
                Some(existing.formatted_address.clone()),
                Some(desired.formatted_address.clone()),
            ));
            plan.patch.formatted_address = Some(desired.formatted_address.clone());
        }
    }

    // Geofence: operator-drawn polygons are never replaced.
    if let GeofenceIntent::Set(geofence) = &desired.geofence {
        let is_polygon = matches!(existing.geofence, Some(Geofence::Polygon(_)));
        if !is_polygon && geofence_drifted(existing.geofence.as_ref(), geofence) {
            plan.changes.push(FieldChange::new(
                "geofence",
                existing.geofence.as_ref().map(ToString::to_string),
                Some(geofence.to_string()),
            ));
            plan.patch.geofence = Some(geofence.clone());
        }
    }

    // Tags: add what is required, drop the quarantine tag, keep the rest.
    let mut tags: BTreeSet<TagId> = existing.tag_ids.clone();
    if let Some(q) = resolver.quarantine_tag() {
        tags.remove(q);
    }
    tags.extend(desired.tag_ids.iter().cloned());
    if tags != existing.tag_ids {
        plan.changes.push(FieldChange::new(
            "tagIds",
            Some(join_tags(&existing.tag_ids)),
            Some(join_tags(&tags)),
        ));
        plan.patch.tag_ids = Some(tags.into_iter().collect());
    }

    // External ids: whole map is sent when anything in it changes.
    let mut ids = external_id::canonicalize_ids(&existing.external_ids);
    ids.remove(external_id::DELETE_MARKER_KEY);
    for (key, value) in &desired.external_ids {
        let always = key == external_id::ENCOMPASS_ID_KEY || key == external_id::MANAGED_KEY;
        let missing = !ids.contains_key(key);
        if always || content_changed || missing {
            ids.insert(key.clone(), value.clone());
        }
    }
    if content_changed && !desired.external_ids.contains_key(external_id::TYPE_KEY) {
        ids.remove(external_id::TYPE_KEY);
    }
    if ids != existing.external_ids {
        let keys: BTreeSet<&String> = ids.keys().chain(existing.external_ids.keys()).collect();
        for key in keys {
            let before = existing.external_ids.get(key);
            let after = ids.get(key);
            if before != after {
                plan.changes.push(FieldChange::new(
                    format!("externalIds.{key}"),
                    before.cloned(),
                    after.cloned(),
                ));
            }
        }
        plan.patch.external_ids = Some(ids);
    }

    plan
}

/// How orphans are marked as delete candidates this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuarantineStrategy {
    /// Attach the quarantine tag.
    Tag(TagId),
    /// Quarantine tag unavailable: write the delete-marker external id.
    ExternalIdMarker,
}

impl QuarantineStrategy {
    pub fn for_run(resolver: &TagResolver) -> Self {
        match resolver.quarantine_tag() {
            Some(id) => QuarantineStrategy::Tag(id.clone()),
            None => QuarantineStrategy::ExternalIdMarker,
        }
    }

    pub fn is_marked(&self, record: &DestinationRecord) -> bool {
        match self {
            QuarantineStrategy::Tag(id) => record.tag_ids.contains(id),
            QuarantineStrategy::ExternalIdMarker => record
                .external_ids
                .get(external_id::DELETE_MARKER_KEY)
                .is_some_and(|v| !v.trim().is_empty()),
        }
    }

    /// Patch marking `record`, or `None` when it is already marked.
    pub fn mark(&self, record: &DestinationRecord, now: DateTime<Utc>) -> Option<UpdatePlan> {
        if self.is_marked(record) {
            return None;
        }
        let mut plan = UpdatePlan::default();
        match self {
            QuarantineStrategy::Tag(id) => {
                let mut tags = record.tag_ids.clone();
                tags.insert(id.clone());
                plan.changes.push(FieldChange::new(
                    "tagIds",
                    Some(join_tags(&record.tag_ids)),
                    Some(join_tags(&tags)),
                ));
                plan.patch.tag_ids = Some(tags.into_iter().collect());
            }
            QuarantineStrategy::ExternalIdMarker => {
                let marker = external_id::delete_marker_value(&record.id.0, now);
                let mut ids = record.external_ids.clone();
                ids.insert(external_id::DELETE_MARKER_KEY.to_owned(), marker.clone());
                plan.changes.push(FieldChange::new(
                    format!("externalIds.{}", external_id::DELETE_MARKER_KEY),
                    None,
                    Some(marker),
                ));
                plan.patch.external_ids = Some(ids);
            }
        }
        Some(plan)
    }
}
