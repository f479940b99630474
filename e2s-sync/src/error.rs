//! Error types for e2s-sync.

use std::path::PathBuf;
use std::time::Duration;

use e2s_core::{AddressId, CoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Run-fatal errors. Record-scoped problems never surface here.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An error from configuration or other core loading.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error (state store, action log).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The state file exists but cannot be read as any known layout.
    #[error("state file {path} is corrupt: {source}")]
    StateCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Another run holds the state lock.
    #[error("state store {path} is locked by another run")]
    StateLocked { path: PathBuf },

    /// A mutation was about to target a protected record. Internal invariant
    /// breach; the run stops before anything is applied.
    #[error("safety violation on destination {destination}: {reason}")]
    SafetyViolation {
        destination: AddressId,
        reason: String,
    },

    /// Fetching the destination snapshot failed.
    #[error("destination API error: {0}")]
    Api(#[from] ApiError),
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

/// Typed failure of a single API call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApiError {
    /// Rate limit or server-side failure (429, 500, 502, 503, 504). Retried.
    #[error("transient HTTP {status}: {message}")]
    Transient {
        status: u16,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },

    /// Any other 4xx. Not retried.
    #[error("HTTP {status}: {message}")]
    Persistent { status: u16, message: String },

    /// No HTTP response at all (connect, TLS, timeout). Retried.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    /// Classifies a status code with its response body.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<&str>) -> Self {
        let message = message.into();
        if is_transient_status(status) {
            ApiError::Transient {
                status,
                message,
                retry_after_secs: retry_after.and_then(parse_retry_after),
            }
        } else {
            ApiError::Persistent { status, message }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transient { .. } | ApiError::Transport(_))
    }

    /// Server-requested wait, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::Transient {
                retry_after_secs: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Largest fractional `Retry-After` accepted; larger values are ignored.
const MAX_RETRY_AFTER_SECS: u64 = 86_400;

/// Parses a delta-seconds `Retry-After` header value.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    value.parse::<u64>().ok().or_else(|| {
        value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0 && *v <= MAX_RETRY_AFTER_SECS as f64)
            .map(|v| v.ceil() as u64)
    })
}
