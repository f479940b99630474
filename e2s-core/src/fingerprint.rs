//! Deterministic content digests for managed records.
//!
//! A fingerprint is the SHA-256 of the record's normalized fields joined by
//! [`FIELD_DELIMITER`], rendered as 64 lowercase hex characters. The
//! normalizer always strips the delimiter, so the encoding is unambiguous.
//!
//! Field orders are fixed per [`RecordKind`]. Changing an order changes every
//! digest and forces a full rewrite of managed records on the next run.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::normalize::{normalize_phone, Normalizer, FIELD_DELIMITER};
use crate::driver::DriverSource;
use crate::types::SourceRecord;

/// Length of the prefix stored in the destination's `fingerprint` external id.
pub const SHORT_LEN: usize = 32;

/// Which fixed field order a fingerprint uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// `(name, status, address)`
    Address,
    /// `(employee code, full name, status, phone digits)`
    Driver,
}

impl RecordKind {
    pub fn field_names(self) -> &'static [&'static str] {
        match self {
            RecordKind::Address => &["name", "status", "address"],
            RecordKind::Driver => &["employee_code", "full_name", "status", "phone"],
        }
    }
}

/// A 64-character hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// Hashes already-normalized fields in the given order.
    pub fn from_fields<S: AsRef<str>>(fields: &[S]) -> Self {
        let mut hasher = Sha256::new();
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                let mut buf = [0u8; 4];
                hasher.update(FIELD_DELIMITER.encode_utf8(&mut buf).as_bytes());
            }
            hasher.update(field.as_ref().as_bytes());
        }
        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// Fingerprint of an address record: normalized `(name, status, address)`.
    pub fn for_address(normalizer: &Normalizer, name: &str, status: &str, address: &str) -> Self {
        Self::from_fields(&[
            normalizer.normalize(name),
            normalizer.normalize(status),
            normalizer.normalize(address),
        ])
    }

    /// Fingerprint of a driver-like record. The phone uses the digits-only rule.
    pub fn for_driver(
        normalizer: &Normalizer,
        employee_code: &str,
        full_name: &str,
        status: &str,
        phone: &str,
    ) -> Self {
        Self::from_fields(&[
            normalizer.normalize(employee_code),
            normalizer.normalize(full_name),
            normalizer.normalize(status),
            normalize_phone(phone),
        ])
    }

    /// Address fingerprint of a source record.
    pub fn of_source(normalizer: &Normalizer, record: &SourceRecord) -> Self {
        Self::for_address(
            normalizer,
            &record.name,
            record.status.as_str(),
            &record.address,
        )
    }

    /// Driver fingerprint of a payroll row.
    pub fn of_driver(normalizer: &Normalizer, driver: &DriverSource) -> Self {
        Self::for_driver(
            normalizer,
            &driver.employee_code,
            &driver.full_name(),
            driver.employment_status().as_str(),
            &driver.phone,
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix written to the destination external id.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(SHORT_LEN);
        &self.0[..end]
    }

    /// Whether a previously stored value (full or truncated) denotes this
    /// digest. Comparison is case-insensitive; an empty value never matches.
    pub fn matches(&self, stored: &str) -> bool {
        let stored = stored.trim();
        if stored.is_empty() || stored.len() > self.0.len() {
            return false;
        }
        self.0[..stored.len()].eq_ignore_ascii_case(stored)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_64_hex_chars() {
        let fp = Fingerprint::from_fields(&["a", "b", "c"]);
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn known_digest_of_joined_fields() {
        // sha256("acme store|active|1 main st")
        let fp = Fingerprint::from_fields(&["acme store", "active", "1 main st"]);
        let mut hasher = Sha256::new();
        hasher.update(b"acme store|active|1 main st");
        assert_eq!(fp.as_str(), hex::encode(hasher.finalize()));
    }

    #[test]
    fn field_boundaries_matter() {
        let a = Fingerprint::from_fields(&["ab", "c"]);
        let b = Fingerprint::from_fields(&["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn short_and_matches() {
        let fp = Fingerprint::from_fields(&["x"]);
        assert_eq!(fp.short().len(), SHORT_LEN);
        assert!(fp.matches(fp.short()));
        assert!(fp.matches(&fp.as_str().to_ascii_uppercase()));
        assert!(!fp.matches(""));
        assert!(!fp.matches("deadbeef"));
    }

    #[test]
    fn driver_phone_uses_digits_rule() {
        let n = Normalizer::default();
        let a = Fingerprint::for_driver(&n, "E1", "Jo Smith", "Active", "(512) 555-0100");
        let b = Fingerprint::for_driver(&n, "e1", "jo  smith", "ACTIVE", "512.555.0100");
        assert_eq!(a, b);
    }

    #[test]
    fn payroll_row_fingerprint_ignores_cosmetic_edits() {
        let n = Normalizer::default();
        let mut row = DriverSource::new("E1", "Jo", "Smith");
        row.phone = "(512) 555-0100".into();
        let before = Fingerprint::of_driver(&n, &row);
        row.first_name = "JO".into();
        row.phone = "512-555-0100".into();
        assert_eq!(Fingerprint::of_driver(&n, &row), before);
        row.status = Some(crate::driver::EmploymentStatus::Inactive);
        assert_ne!(Fingerprint::of_driver(&n, &row), before);
    }

    #[test]
    fn kinds_document_their_order() {
        assert_eq!(RecordKind::Address.field_names(), ["name", "status", "address"]);
        assert_eq!(RecordKind::Driver.field_names().len(), 4);
    }
}
