//! Domain types for the Encompass → Samsara reconciliation.
//!
//! Source records are parsed fresh each run and never mutated. Destination
//! records mirror what the address API returned at run start; the wire-facing
//! structs serialize with the API's camelCase field names.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// External identifier of a customer in the source roster (Encompass
/// "Customer ID").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub String);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Destination-assigned address identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressId(pub String);

impl fmt::Display for AddressId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for AddressId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AddressId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Destination tag identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagId(pub String);

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for TagId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TagId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Account status of a source customer.
///
/// Anything other than `ACTIVE` / `INACTIVE` is kept verbatim so it still
/// contributes its original text to the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AccountStatus {
    Active,
    Inactive,
    Other(String),
}

impl AccountStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => AccountStatus::Active,
            "INACTIVE" => AccountStatus::Inactive,
            _ => AccountStatus::Other(raw.trim().to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Inactive => "INACTIVE",
            AccountStatus::Other(raw) => raw,
        }
    }

    pub fn is_inactive(&self) -> bool {
        matches!(self, AccountStatus::Inactive)
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for AccountStatus {
    fn from(s: String) -> Self {
        AccountStatus::parse(&s)
    }
}

impl From<AccountStatus> for String {
    fn from(status: AccountStatus) -> Self {
        status.as_str().to_owned()
    }
}

/// Per-row instruction carried by a daily delta file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowAction {
    Upsert,
    Delete,
}

impl RowAction {
    /// Parses the delta `Action` column. Blank and unknown values mean upsert.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" => None,
            "delete" => Some(RowAction::Delete),
            _ => Some(RowAction::Upsert),
        }
    }
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// A WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Coordinates as supplied by the source roster.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SourceCoordinates {
    /// No coordinates given.
    #[default]
    Absent,
    /// A valid, in-range point.
    Point(GeoPoint),
    /// Something was given but it cannot be used; the message says why.
    Malformed(String),
}

/// Circular geofence as the address API represents it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircleGeofence {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_meters: u32,
}

/// Polygon geofence drawn on the destination side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolygonGeofence {
    #[serde(default)]
    pub vertices: Vec<GeoPoint>,
}

/// Address geofence: exactly one of circle or polygon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Geofence {
    Circle(CircleGeofence),
    Polygon(PolygonGeofence),
}

impl Geofence {
    /// Center of the geofence: the circle center, or the vertex centroid.
    pub fn center(&self) -> Option<GeoPoint> {
        match self {
            Geofence::Circle(c) => Some(GeoPoint {
                latitude: c.latitude,
                longitude: c.longitude,
            }),
            Geofence::Polygon(p) if !p.vertices.is_empty() => {
                let n = p.vertices.len() as f64;
                let (lat, lon) = p
                    .vertices
                    .iter()
                    .fold((0.0, 0.0), |(a, b), v| (a + v.latitude, b + v.longitude));
                Some(GeoPoint {
                    latitude: lat / n,
                    longitude: lon / n,
                })
            }
            Geofence::Polygon(_) => None,
        }
    }
}

impl fmt::Display for Geofence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Geofence::Circle(c) => write!(
                f,
                "circle({}, {}) r={}m",
                c.latitude, c.longitude, c.radius_meters
            ),
            Geofence::Polygon(p) => write!(f, "polygon({} vertices)", p.vertices.len()),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One customer row from the source roster.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub id: SourceId,
    pub name: String,
    /// Free-text address, used verbatim as the destination formatted address.
    pub address: String,
    pub coordinates: SourceCoordinates,
    pub status: AccountStatus,
    /// Category label mapped to a Location tag.
    pub location: String,
    /// Category label mapped to a Company tag.
    pub company: String,
    /// Customer type label; not part of the fingerprint.
    pub record_type: Option<String>,
    /// Explicit delta instruction (daily runs only).
    pub action: Option<RowAction>,
}

impl SourceRecord {
    /// Minimal active record; tests and callers fill in the rest.
    pub fn new(id: impl Into<SourceId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: String::new(),
            coordinates: SourceCoordinates::Absent,
            status: AccountStatus::Active,
            location: String::new(),
            company: String::new(),
            record_type: None,
            action: None,
        }
    }
}

/// A destination address as fetched at run start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRecord {
    pub id: AddressId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub formatted_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geofence: Option<Geofence>,
    #[serde(default)]
    pub tag_ids: BTreeSet<TagId>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

impl DestinationRecord {
    pub fn new(id: impl Into<AddressId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            formatted_address: String::new(),
            geofence: None,
            tag_ids: BTreeSet::new(),
            external_ids: BTreeMap::new(),
        }
    }

    /// Fingerprint stored on the record by a previous sync, if any.
    pub fn stored_fingerprint(&self) -> Option<&str> {
        self.external_ids
            .get(crate::external_id::FINGERPRINT_KEY)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

/// A tag from the destination tag directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Write payloads
// ---------------------------------------------------------------------------

/// Body of an address creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressPayload {
    pub name: String,
    pub formatted_address: String,
    pub geofence: Geofence,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_ids: Vec<TagId>,
    pub external_ids: BTreeMap<String, String>,
}

/// Partial update of an address. Absent fields are left untouched.
///
/// `tag_ids` and `external_ids` replace the whole collection on the
/// destination, so they always carry the complete desired set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geofence: Option<Geofence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_ids: Option<Vec<TagId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ids: Option<BTreeMap<String, String>>,
}

impl AddressPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.formatted_address.is_none()
            && self.geofence.is_none()
            && self.tag_ids.is_none()
            && self.external_ids.is_none()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(SourceId::from("C100").to_string(), "C100");
        assert_eq!(AddressId::from("281474").to_string(), "281474");
        assert_eq!(TagId::from("t-1").to_string(), "t-1");
    }

    #[test]
    fn account_status_parses_case_insensitively() {
        assert_eq!(AccountStatus::parse(" active "), AccountStatus::Active);
        assert_eq!(AccountStatus::parse("INACTIVE"), AccountStatus::Inactive);
        assert_eq!(
            AccountStatus::parse("On Hold"),
            AccountStatus::Other("On Hold".to_string())
        );
        assert!(AccountStatus::parse("Inactive").is_inactive());
    }

    #[test]
    fn row_action_blank_is_none_and_unknown_is_upsert() {
        assert_eq!(RowAction::parse(""), None);
        assert_eq!(RowAction::parse("DELETE"), Some(RowAction::Delete));
        assert_eq!(RowAction::parse("refresh"), Some(RowAction::Upsert));
    }

    #[test]
    fn circle_geofence_uses_wire_shape() {
        let geofence = Geofence::Circle(CircleGeofence {
            latitude: 30.0,
            longitude: -97.0,
            radius_meters: 50,
        });
        let json = serde_json::to_value(&geofence).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({"circle": {"latitude": 30.0, "longitude": -97.0, "radiusMeters": 50}})
        );
    }

    #[test]
    fn polygon_center_is_vertex_centroid() {
        let geofence = Geofence::Polygon(PolygonGeofence {
            vertices: vec![
                GeoPoint { latitude: 0.0, longitude: 0.0 },
                GeoPoint { latitude: 2.0, longitude: 4.0 },
            ],
        });
        let center = geofence.center().expect("center");
        assert_eq!(center.latitude, 1.0);
        assert_eq!(center.longitude, 2.0);
    }

    #[test]
    fn empty_patch_is_empty() {
        assert!(AddressPatch::default().is_empty());
        let patch = AddressPatch {
            name: Some("x".into()),
            ..AddressPatch::default()
        };
        assert!(!patch.is_empty());
    }

    #[test]
    fn destination_record_deserializes_with_defaults() {
        let record: DestinationRecord =
            serde_json::from_str(r#"{"id":"1","externalIds":{"fingerprint":" abc "}}"#)
                .expect("deserialize");
        assert!(record.tag_ids.is_empty());
        assert_eq!(record.stored_fingerprint(), Some("abc"));
    }
}
