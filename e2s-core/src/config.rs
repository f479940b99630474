//! Run configuration.
//!
//! Every field has a default, so an absent or partial YAML file is valid.
//! Command-line flags are applied on top by the binary.
//!
//! ```yaml
//! radius_m: 75
//! retention_days: 14
//! scope_tag: "ManagedBy:EncompassSync"
//! retry:
//!   max_attempts: 5
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, CoreError};
use crate::normalize::Normalizer;

pub const DEFAULT_RADIUS_M: u32 = 50;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_DISTANCE_THRESHOLD_M: f64 = 25.0;
pub const DEFAULT_SCOPE_TAG: &str = "ManagedBy:EncompassSync";
pub const DEFAULT_QUARANTINE_TAG: &str = "CandidateDelete";
pub const DEFAULT_DRIVER_SCOPE_TAG: &str = "ManagedBy:PaycomSync";

/// Backoff contract for API calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Random extra fraction added to each delay, e.g. `0.25` → up to +25%.
    pub jitter: f64,
    /// Minimum spacing between consecutive requests. `0` disables throttling.
    pub min_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.25,
            min_interval_ms: 0,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `max_delay_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Loads a policy from a YAML or JSON file. Unknown keys are ignored.
    pub fn load_at(path: &Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        let policy: RetryPolicy = serde_yaml::from_str(&text).map_err(|source| CoreError::Parse {
            path: path.to_owned(),
            source,
        })?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_attempts == 0 {
            return Err(CoreError::InvalidConfig(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !self.jitter.is_finite() || self.jitter < 0.0 {
            return Err(CoreError::InvalidConfig(
                "retry.jitter must be a non-negative number".into(),
            ));
        }
        Ok(())
    }
}

/// Reconciliation settings for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Circle radius for geofences built from source coordinates.
    pub radius_m: u32,
    /// Days an orphan stays quarantined before it may be hard-deleted.
    pub retention_days: u32,
    /// Upper bound on name-match distance for probable matching.
    pub distance_threshold_m: f64,
    pub scope_tag: String,
    pub quarantine_tag: String,
    /// Tag added to every driver the payroll sync manages.
    pub driver_scope_tag: String,
    /// Explicit punctuation characters to strip; defaults to every
    /// non-alphanumeric, non-whitespace, non-underscore character.
    pub strip_punctuation: Option<String>,
    /// Hard-delete matured orphans. Without it they wait indefinitely.
    pub confirm_delete: bool,
    /// Route INACTIVE source records through the orphan lifecycle instead of
    /// skipping them.
    pub delete_inactive: bool,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            radius_m: DEFAULT_RADIUS_M,
            retention_days: DEFAULT_RETENTION_DAYS,
            distance_threshold_m: DEFAULT_DISTANCE_THRESHOLD_M,
            scope_tag: DEFAULT_SCOPE_TAG.to_owned(),
            quarantine_tag: DEFAULT_QUARANTINE_TAG.to_owned(),
            driver_scope_tag: DEFAULT_DRIVER_SCOPE_TAG.to_owned(),
            strip_punctuation: None,
            confirm_delete: false,
            delete_inactive: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Reads and validates a YAML config file.
    pub fn load_at(path: &Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        let config: SyncConfig = serde_yaml::from_str(&text).map_err(|source| CoreError::Parse {
            path: path.to_owned(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.radius_m == 0 {
            return Err(CoreError::InvalidConfig("radius_m must be positive".into()));
        }
        if !self.distance_threshold_m.is_finite() || self.distance_threshold_m < 0.0 {
            return Err(CoreError::InvalidConfig(
                "distance_threshold_m must be a non-negative number".into(),
            ));
        }
        if self.scope_tag.trim().is_empty() {
            return Err(CoreError::InvalidConfig("scope_tag must not be empty".into()));
        }
        if self.quarantine_tag.trim().is_empty() {
            return Err(CoreError::InvalidConfig(
                "quarantine_tag must not be empty".into(),
            ));
        }
        if self.driver_scope_tag.trim().is_empty() {
            return Err(CoreError::InvalidConfig(
                "driver_scope_tag must not be empty".into(),
            ));
        }
        self.retry.validate()
    }

    pub fn normalizer(&self) -> Normalizer {
        match &self.strip_punctuation {
            Some(chars) => Normalizer::with_punctuation(chars),
            None => Normalizer::default(),
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let c = SyncConfig::default();
        assert_eq!(c.radius_m, 50);
        assert_eq!(c.retention_days, 30);
        assert_eq!(c.distance_threshold_m, 25.0);
        assert_eq!(c.scope_tag, "ManagedBy:EncompassSync");
        assert_eq!(c.quarantine_tag, "CandidateDelete");
        assert_eq!(c.driver_scope_tag, "ManagedBy:PaycomSync");
        assert!(!c.confirm_delete);
        assert_eq!(c.retry.max_attempts, 8);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("e2s.yaml");
        std::fs::write(&path, "radius_m: 75\nretry:\n  max_attempts: 3\n").unwrap();
        let c = SyncConfig::load_at(&path).unwrap();
        assert_eq!(c.radius_m, 75);
        assert_eq!(c.retry.max_attempts, 3);
        assert_eq!(c.retry.base_delay_ms, 500);
        assert_eq!(c.retention_days, 30);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("e2s.yaml");
        std::fs::write(&path, "radius_m: 0\n").unwrap();
        assert!(matches!(
            SyncConfig::load_at(&path),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn parse_error_names_the_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("e2s.yaml");
        std::fs::write(&path, "radius_m: [oops\n").unwrap();
        let err = SyncConfig::load_at(&path).unwrap_err();
        assert!(err.to_string().contains("e2s.yaml"));
    }

    #[test]
    fn retry_policy_reads_json_and_ignores_unknown_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("rate.json");
        std::fs::write(&path, r#"{"max_attempts": 4, "requests_per_second": 5}"#).unwrap();
        let p = RetryPolicy::load_at(&path).unwrap();
        assert_eq!(p.max_attempts, 4);
        assert_eq!(p.max_delay_ms, 30_000);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff(1), Duration::from_millis(500));
        assert_eq!(p.backoff(2), Duration::from_millis(1000));
        assert_eq!(p.backoff(4), Duration::from_millis(4000));
        assert_eq!(p.backoff(20), Duration::from_millis(30_000));
    }
}
