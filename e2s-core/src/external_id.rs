//! External-id codec: sanitization, key canonicalization and identity reads.
//!
//! The destination accepts external-id values made of `[A-Za-z0-9_.:-]`, at
//! most 32 characters long. Older syncs wrote the
//! source identifier under several historical key spellings; all of them
//! resolve to [`ENCOMPASS_ID_KEY`] through [`canonicalize_key`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::RecordError;

/// Maximum length of an external-id value.
pub const MAX_VALUE_LEN: usize = 32;

/// Canonical key holding the source identifier.
pub const ENCOMPASS_ID_KEY: &str = "encompassid";
/// Historical spellings of [`ENCOMPASS_ID_KEY`], in lookup order.
pub const LEGACY_ID_KEYS: &[&str] = &["encompass_id", "EncompassId", "ENCOMPASS_ID"];

pub const STATUS_KEY: &str = "encompassstatus";
pub const MANAGED_KEY: &str = "encompassmanaged";
pub const FINGERPRINT_KEY: &str = "fingerprint";
pub const TYPE_KEY: &str = "encompasstype";
/// Quarantine marker used when the quarantine tag is unavailable.
pub const DELETE_MARKER_KEY: &str = "encompassdeletecandidate";

/// Value of [`MANAGED_KEY`] on records this tool owns.
pub const MANAGED_FLAG: &str = "1";

const MARKER_TS_FORMAT: &str = "%Y%m%dT%H%M%S";

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')
}

/// Replaces disallowed characters with `_` and truncates to
/// [`MAX_VALUE_LEN`] characters.
pub fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if is_allowed(c) { c } else { '_' })
        .take(MAX_VALUE_LEN)
        .collect();
    if cleaned != raw {
        tracing::warn!("external id value {raw:?} sanitized to {cleaned:?}");
    }
    cleaned
}

/// Sanitizes a required identifier. Fails on blank input and on input with
/// no ASCII character to keep.
pub fn sanitize_required(field: &str, raw: &str) -> Result<String, RecordError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.chars().any(|c| c.is_ascii()) {
        return Err(RecordError::validation(
            field,
            format!("{raw:?} has no usable characters"),
        ));
    }
    Ok(sanitize(trimmed))
}

/// Maps legacy aliases to [`ENCOMPASS_ID_KEY`]; other keys pass through.
pub fn canonicalize_key(key: &str) -> &str {
    if key == ENCOMPASS_ID_KEY || LEGACY_ID_KEYS.contains(&key) {
        ENCOMPASS_ID_KEY
    } else {
        key
    }
}

/// Whether `key` is the canonical id key or one of its aliases.
pub fn is_id_key(key: &str) -> bool {
    canonicalize_key(key) == ENCOMPASS_ID_KEY
}

/// Every distinct sanitized identifier value, canonical key first.
pub fn source_id_values(ids: &BTreeMap<String, String>) -> Vec<(&'static str, String)> {
    let mut out: Vec<(&'static str, String)> = Vec::new();
    for key in std::iter::once(ENCOMPASS_ID_KEY).chain(LEGACY_ID_KEYS.iter().copied()) {
        let Some(value) = ids.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) else {
            continue;
        };
        let value = sanitize(value);
        if !out.iter().any(|(_, v)| *v == value) {
            out.push((key, value));
        }
    }
    out
}

/// Reads the source identifier from a destination's external ids.
///
/// The canonical key is checked first, then each alias. Blank values are
/// ignored. Two different non-blank values are a conflict; the caller must
/// not guess which one is right.
pub fn read_source_id(ids: &BTreeMap<String, String>) -> Result<Option<String>, RecordError> {
    let mut values = source_id_values(ids);
    match values.len() {
        0 => Ok(None),
        1 => Ok(values.pop().map(|(_, v)| v)),
        _ => {
            let listed: Vec<String> = values
                .iter()
                .map(|(k, v)| format!("{k}={v:?}"))
                .collect();
            Err(RecordError::conflict(format!(
                "external ids disagree: {}",
                listed.join(", ")
            )))
        }
    }
}

/// Returns `ids` with legacy aliases folded into the canonical key.
///
/// The canonical value wins when present; otherwise the first non-blank alias
/// in lookup order is moved over.
pub fn canonicalize_ids(ids: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let mut id_value: Option<String> = None;
    for key in std::iter::once(ENCOMPASS_ID_KEY).chain(LEGACY_ID_KEYS.iter().copied()) {
        if id_value.is_some() {
            break;
        }
        if let Some(v) = ids.get(key).filter(|v| !v.trim().is_empty()) {
            id_value = Some(v.clone());
        }
    }
    for (k, v) in ids {
        if !is_id_key(k) {
            out.insert(k.clone(), v.clone());
        }
    }
    if let Some(v) = id_value {
        out.insert(ENCOMPASS_ID_KEY.to_owned(), v);
    }
    out
}

/// Whether [`MANAGED_KEY`] is set to [`MANAGED_FLAG`].
pub fn has_managed_flag(ids: &BTreeMap<String, String>) -> bool {
    ids.get(MANAGED_KEY).map(|v| v.trim()) == Some(MANAGED_FLAG)
}

/// Value of the delete marker: `YYYYMMDDTHHMMSS-<destination id>`, sanitized.
pub fn delete_marker_value(destination_id: &str, now: DateTime<Utc>) -> String {
    sanitize(&format!(
        "{}-{}",
        now.format(MARKER_TS_FORMAT),
        destination_id
    ))
}
