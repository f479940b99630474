//! Error types for e2s-core.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from loading configuration and supporting files.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Underlying I/O failure, with the path that was being read.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience constructor for [`CoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.into(),
        source,
    }
}

/// A problem confined to one source or destination record.
///
/// These never abort a run: the reconciler turns them into `ERROR` actions
/// and carries on with the remaining records.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordError {
    /// A required field is missing or malformed.
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// A category label has no usable tag in the destination directory.
    #[error("cannot resolve {category} tag {label:?}")]
    Resolution { category: String, label: String },

    /// Identity is ambiguous: duplicate ids, tied matches, conflicting
    /// external ids.
    #[error("conflict: {message}")]
    Conflict { message: String },
}

impl RecordError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        RecordError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn resolution(category: impl Into<String>, label: impl Into<String>) -> Self {
        RecordError::Resolution {
            category: category.into(),
            label: label.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        RecordError::Conflict {
            message: message.into(),
        }
    }

    /// Stable machine-readable reason code used in reports.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RecordError::Validation { .. } => "VALIDATION_ERROR",
            RecordError::Resolution { .. } => "RESOLUTION_ERROR",
            RecordError::Conflict { .. } => "CONFLICT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_error_messages() {
        let err = RecordError::validation("coordinates", "latitude out of range");
        assert_eq!(err.to_string(), "invalid coordinates: latitude out of range");
        assert_eq!(err.reason_code(), "VALIDATION_ERROR");

        let err = RecordError::resolution("location", "North");
        assert_eq!(err.to_string(), "cannot resolve location tag \"North\"");
        assert_eq!(err.reason_code(), "RESOLUTION_ERROR");
    }

    #[test]
    fn record_error_serializes_with_kind_tag() {
        let err = RecordError::conflict("duplicate source id C1");
        let json = serde_json::to_value(&err).expect("serialize");
        assert_eq!(json["kind"], "conflict");
        assert_eq!(json["message"], "duplicate source id C1");
    }
}
