//! Driver roster records (Paycom) and their Samsara driver counterparts.
//!
//! Drivers are keyed by employee code, stored on the destination under the
//! [`EMPLOYEE_CODE_KEY`] external id. The driver fingerprint is written next
//! to it under [`DRIVER_FINGERPRINT_KEY`]; there is no local state file for
//! drivers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::TagId;

/// External id holding the employee code.
pub const EMPLOYEE_CODE_KEY: &str = "employeeCode";
/// Lower-cased spelling some older records carry.
pub const LEGACY_EMPLOYEE_CODE_KEY: &str = "employeecode";
/// External id holding the short driver fingerprint.
pub const DRIVER_FINGERPRINT_KEY: &str = "paycom_fingerprint";

/// Destination-assigned driver identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DriverId(pub String);

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for DriverId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DriverId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Employment status as far as driver activation is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmploymentStatus {
    Active,
    Inactive,
    NotHired,
}

impl EmploymentStatus {
    /// Classifies a free-text payroll status. Blank and unrecognised values
    /// count as active; termination, leave, suspension and retirement as
    /// inactive.
    pub fn classify(raw: &str) -> Self {
        let status = raw.trim().to_lowercase();
        if status.is_empty() || status == "active" {
            return EmploymentStatus::Active;
        }
        if status.contains("not hire") {
            return EmploymentStatus::NotHired;
        }
        const INACTIVE: [&str; 5] = ["inactive", "term", "leave", "suspend", "retire"];
        if INACTIVE.iter().any(|token| status.contains(token)) {
            return EmploymentStatus::Inactive;
        }
        EmploymentStatus::Active
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EmploymentStatus::Active => "active",
            EmploymentStatus::Inactive => "inactive",
            EmploymentStatus::NotHired => "not_hired",
        }
    }

    pub fn is_active(self) -> bool {
        self == EmploymentStatus::Active
    }
}

impl fmt::Display for EmploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One payroll row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DriverSource {
    pub employee_code: String,
    pub first_name: String,
    pub last_name: String,
    pub username: Option<String>,
    pub phone: String,
    pub time_zone: Option<String>,
    pub tag_ids: BTreeSet<TagId>,
    pub status: Option<EmploymentStatus>,
}

impl DriverSource {
    pub fn new(employee_code: impl Into<String>, first: &str, last: &str) -> Self {
        Self {
            employee_code: employee_code.into(),
            first_name: first.trim().to_owned(),
            last_name: last.trim().to_owned(),
            ..Default::default()
        }
    }

    /// `first last`, either part may be missing.
    pub fn full_name(&self) -> String {
        [self.first_name.trim(), self.last_name.trim()]
            .iter()
            .filter(|p| !p.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn employment_status(&self) -> EmploymentStatus {
        self.status.unwrap_or(EmploymentStatus::Active)
    }
}

/// A driver as the destination returned it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DestinationDriver {
    pub id: DriverId,
    pub name: String,
    pub username: Option<String>,
    pub phone: String,
    pub time_zone: Option<String>,
    pub is_deactivated: bool,
    pub tag_ids: BTreeSet<TagId>,
    pub external_ids: BTreeMap<String, String>,
}

impl DestinationDriver {
    pub fn new(id: impl Into<DriverId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Employee code from the canonical key, else the legacy spelling.
    pub fn employee_code(&self) -> Option<&str> {
        [EMPLOYEE_CODE_KEY, LEGACY_EMPLOYEE_CODE_KEY]
            .iter()
            .filter_map(|k| self.external_ids.get(*k))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
    }

    pub fn stored_fingerprint(&self) -> Option<&str> {
        self.external_ids
            .get(DRIVER_FINGERPRINT_KEY)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// `driverActivationStatus` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationStatus {
    Active,
    Deactivated,
}

/// Body of a driver create call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverPayload {
    pub name: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub tag_ids: Vec<TagId>,
    pub external_ids: BTreeMap<String, String>,
}

/// Body of a driver patch call. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_ids: Option<Vec<TagId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ids: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_activation_status: Option<ActivationStatus>,
}

impl DriverPatch {
    pub fn is_empty(&self) -> bool {
        self == &DriverPatch::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("", EmploymentStatus::Active)]
    #[case("Active", EmploymentStatus::Active)]
    #[case("Terminated", EmploymentStatus::Inactive)]
    #[case("On Leave", EmploymentStatus::Inactive)]
    #[case("Retired", EmploymentStatus::Inactive)]
    #[case("Not Hired", EmploymentStatus::NotHired)]
    #[case("Seasonal", EmploymentStatus::Active)]
    fn status_classification(#[case] raw: &str, #[case] expected: EmploymentStatus) {
        assert_eq!(EmploymentStatus::classify(raw), expected);
    }

    #[test]
    fn full_name_skips_blank_parts() {
        assert_eq!(DriverSource::new("E1", " Jo ", "Smith").full_name(), "Jo Smith");
        assert_eq!(DriverSource::new("E1", "", "Smith").full_name(), "Smith");
    }

    #[test]
    fn employee_code_falls_back_to_legacy_key() {
        let mut d = DestinationDriver::new("1", "Jo");
        assert_eq!(d.employee_code(), None);
        d.external_ids.insert(LEGACY_EMPLOYEE_CODE_KEY.into(), "E7".into());
        assert_eq!(d.employee_code(), Some("E7"));
        d.external_ids.insert(EMPLOYEE_CODE_KEY.into(), "E8".into());
        assert_eq!(d.employee_code(), Some("E8"));
    }

    #[test]
    fn patch_serializes_only_set_fields() {
        let patch = DriverPatch {
            driver_activation_status: Some(ActivationStatus::Deactivated),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            serde_json::json!({"driverActivationStatus": "deactivated"})
        );
        assert!(DriverPatch::default().is_empty());
    }
}
