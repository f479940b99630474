//! State store: per-destination fingerprints and quarantine timestamps.
//!
//! Persists a [`StateFile`] JSON document at `<dir>/state.json`, guarded by
//! an exclusive lock on `<dir>/state.lock` for the lifetime of a
//! [`StateStore`]. Writes use the atomic `.tmp` + rename pattern.
//!
//! Two older layouts are still read:
//! - `{"fingerprints": {id: fp}, "candidate_deletes": {id: timestamp}}`
//! - a flat `{id: fp}` map
//!
//! Both are rewritten in the current layout on the next save.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use e2s_core::AddressId;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{io_err, SyncError};

pub const STATE_FILE: &str = "state.json";
pub const LOCK_FILE: &str = "state.lock";

/// What is remembered about one destination address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    /// Last synced fingerprint; empty when never synced by this tool.
    #[serde(default)]
    pub fingerprint: String,
    /// First time the address was seen as an orphan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantined_since: Option<DateTime<Utc>>,
}

/// State transition proposed by an action; committed only if the action
/// succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum StateChange {
    #[default]
    None,
    /// Record the fingerprint and clear any quarantine.
    Track { fingerprint: String },
    /// Start the retention clock.
    Quarantine { since: DateTime<Utc> },
    /// Drop the entry (hard-deleted).
    Forget,
}

impl StateChange {
    pub fn is_none(&self) -> bool {
        matches!(self, StateChange::None)
    }
}

/// In-memory state mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    pub saved_at: Option<DateTime<Utc>>,
    pub records: BTreeMap<AddressId, StateEntry>,
}

impl StateSnapshot {
    pub fn get(&self, id: &AddressId) -> Option<&StateEntry> {
        self.records.get(id)
    }

    pub fn apply(&mut self, id: &AddressId, change: &StateChange) {
        match change {
            StateChange::None => {}
            StateChange::Track { fingerprint } => {
                self.records.insert(
                    id.clone(),
                    StateEntry {
                        fingerprint: fingerprint.clone(),
                        quarantined_since: None,
                    },
                );
            }
            StateChange::Quarantine { since } => {
                let entry = self.records.entry(id.clone()).or_default();
                if entry.quarantined_since.is_none() {
                    entry.quarantined_since = Some(*since);
                }
            }
            StateChange::Forget => {
                self.records.remove(id);
            }
        }
    }

    /// Drops entries for addresses that no longer exist. Returns how many.
    pub fn prune(&mut self, live: &BTreeSet<AddressId>) -> usize {
        let before = self.records.len();
        self.records.retain(|id, _| live.contains(id));
        let removed = before - self.records.len();
        if removed > 0 {
            tracing::info!("pruned {removed} stale state entries");
        }
        removed
    }

    pub fn quarantined(&self) -> impl Iterator<Item = (&AddressId, DateTime<Utc>)> {
        self.records
            .iter()
            .filter_map(|(id, e)| e.quarantined_since.map(|since| (id, since)))
    }
}

/// On-disk payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateFile {
    pub saved_at: DateTime<Utc>,
    pub records: BTreeMap<AddressId, StateEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StateCompat {
    Structured(StructuredCompat),
    Flat(HashMap<String, String>),
    Legacy(LegacyCompat),
}

#[derive(Debug, Deserialize)]
struct StructuredCompat {
    saved_at: Option<DateTime<Utc>>,
    records: BTreeMap<AddressId, StateEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LegacyCompat {
    #[serde(default)]
    fingerprints: HashMap<String, String>,
    #[serde(default)]
    candidate_deletes: HashMap<String, String>,
}

/// Lenient timestamp parse for the older layout: RFC 3339, or a naive
/// ISO-8601 value taken as UTC.
fn parse_legacy_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|n| Utc.from_utc_datetime(&n))
        })
}

fn from_compat(compat: StateCompat) -> StateSnapshot {
    match compat {
        StateCompat::Structured(s) => StateSnapshot {
            saved_at: s.saved_at,
            records: s.records,
        },
        StateCompat::Legacy(l) => {
            let mut records: BTreeMap<AddressId, StateEntry> = l
                .fingerprints
                .into_iter()
                .map(|(id, fingerprint)| {
                    (
                        AddressId::from(id),
                        StateEntry {
                            fingerprint,
                            quarantined_since: None,
                        },
                    )
                })
                .collect();
            for (id, ts) in l.candidate_deletes {
                match parse_legacy_timestamp(&ts) {
                    Some(since) => {
                        records.entry(AddressId::from(id)).or_default().quarantined_since =
                            Some(since);
                    }
                    None => {
                        tracing::warn!("ignoring unreadable quarantine timestamp {ts:?} for {id}");
                    }
                }
            }
            StateSnapshot {
                saved_at: None,
                records,
            }
        }
        StateCompat::Flat(map) => StateSnapshot {
            saved_at: None,
            records: map
                .into_iter()
                .map(|(id, fingerprint)| {
                    (
                        AddressId::from(id),
                        StateEntry {
                            fingerprint,
                            quarantined_since: None,
                        },
                    )
                })
                .collect(),
        },
    }
}

/// `<dir>/state.json`
pub fn state_path_at(dir: &Path) -> PathBuf {
    dir.join(STATE_FILE)
}

/// Load state from `<dir>/state.json` without taking the lock.
///
/// Returns an empty snapshot if the file does not yet exist.
pub fn load_at(dir: &Path) -> Result<StateSnapshot, SyncError> {
    let path = state_path_at(dir);
    if !path.exists() {
        return Ok(StateSnapshot::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let compat: StateCompat = serde_json::from_str(&contents)
        .map_err(|source| SyncError::StateCorrupt { path, source })?;
    Ok(from_compat(compat))
}

/// Save state atomically: write `<path>.tmp`, then rename.
pub fn save_at(dir: &Path, snapshot: &StateSnapshot, now: DateTime<Utc>) -> Result<(), SyncError> {
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let path = state_path_at(dir);
    let file = StateFile {
        saved_at: now,
        records: snapshot.records.clone(),
    };
    let json = serde_json::to_string_pretty(&file)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, &path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(&path, e));
    }
    Ok(())
}

/// Exclusive handle on a state directory. The lock is released on drop.
#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    lock: File,
}

impl StateStore {
    /// Takes the run lock, failing fast if another run holds it.
    pub fn open_at(dir: &Path) -> Result<Self, SyncError> {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        let lock_path = dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| io_err(&lock_path, e))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(SyncError::StateLocked { path: lock_path });
        }
        tracing::debug!("acquired state lock {}", lock_path.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load(&self) -> Result<StateSnapshot, SyncError> {
        load_at(&self.dir)
    }

    pub fn save(&self, snapshot: &StateSnapshot, now: DateTime<Utc>) -> Result<(), SyncError> {
        save_at(&self.dir, snapshot, now)
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn empty_snapshot_when_file_missing() {
        let tmp = TempDir::new().unwrap();
        let snapshot = load_at(tmp.path()).unwrap();
        assert!(snapshot.records.is_empty());
    }

    #[test]
    fn roundtrip_save_load() {
        let tmp = TempDir::new().unwrap();
        let mut snapshot = StateSnapshot::default();
        snapshot.apply(
            &AddressId::from("1"),
            &StateChange::Track {
                fingerprint: "ab".into(),
            },
        );
        snapshot.apply(&AddressId::from("2"), &StateChange::Quarantine { since: ts(3) });
        save_at(tmp.path(), &snapshot, ts(5)).unwrap();

        let loaded = load_at(tmp.path()).unwrap();
        assert_eq!(loaded.records, snapshot.records);
        assert_eq!(loaded.saved_at, Some(ts(5)));
    }

    #[test]
    fn tmp_file_cleaned_up_after_save() {
        let tmp = TempDir::new().unwrap();
        save_at(tmp.path(), &StateSnapshot::default(), ts(1)).unwrap();
        assert!(!tmp.path().join("state.json.tmp").exists());
        assert!(tmp.path().join("state.json").exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(STATE_FILE), "{not json").unwrap();
        assert!(matches!(
            load_at(tmp.path()),
            Err(SyncError::StateCorrupt { .. })
        ));
    }

    #[test]
    fn legacy_layout_is_migrated() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(STATE_FILE),
            r#"{"fingerprints":{"1":"aa"},
                "candidate_deletes":{"2":"2024-01-03T00:00:00+00:00","3":"2024-01-04T00:00:00.123","4":"soon"}}"#,
        )
        .unwrap();
        let loaded = load_at(tmp.path()).unwrap();
        assert_eq!(loaded.get(&"1".into()).unwrap().fingerprint, "aa");
        assert_eq!(loaded.get(&"2".into()).unwrap().quarantined_since, Some(ts(3)));
        assert!(loaded.get(&"3".into()).unwrap().quarantined_since.is_some());
        assert!(loaded.get(&"4".into()).is_none());
    }

    #[test]
    fn malformed_current_layout_is_corrupt_not_empty() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(STATE_FILE),
            r#"{"saved_at":"2024-01-01T00:00:00Z","records":{"1":{"quarantined_since":"soon"}}}"#,
        )
        .unwrap();
        assert!(matches!(
            load_at(tmp.path()),
            Err(SyncError::StateCorrupt { .. })
        ));
    }

    #[test]
    fn flat_map_is_read_as_fingerprints() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(STATE_FILE), r#"{"9":"ff"}"#).unwrap();
        let loaded = load_at(tmp.path()).unwrap();
        assert_eq!(loaded.get(&"9".into()).unwrap().fingerprint, "ff");
    }

    #[test]
    fn apply_transitions() {
        let id = AddressId::from("1");
        let mut s = StateSnapshot::default();
        s.apply(&id, &StateChange::Quarantine { since: ts(1) });
        s.apply(&id, &StateChange::Quarantine { since: ts(9) });
        assert_eq!(s.get(&id).unwrap().quarantined_since, Some(ts(1)));

        s.apply(&id, &StateChange::Track { fingerprint: "f".into() });
        assert_eq!(s.get(&id).unwrap().quarantined_since, None);

        s.apply(&id, &StateChange::Forget);
        assert!(s.get(&id).is_none());
    }

    #[test]
    fn prune_drops_unknown_ids() {
        let mut s = StateSnapshot::default();
        s.apply(&"1".into(), &StateChange::Track { fingerprint: "a".into() });
        s.apply(&"2".into(), &StateChange::Track { fingerprint: "b".into() });
        let live: BTreeSet<AddressId> = [AddressId::from("1")].into_iter().collect();
        assert_eq!(s.prune(&live), 1);
        assert!(s.get(&"2".into()).is_none());
    }

    #[test]
    fn second_store_fails_fast_while_locked() {
        let tmp = TempDir::new().unwrap();
        let first = StateStore::open_at(tmp.path()).unwrap();
        let second = StateStore::open_at(tmp.path());
        assert!(matches!(second, Err(SyncError::StateLocked { .. })));
        drop(first);
        assert!(StateStore::open_at(tmp.path()).is_ok());
    }
}
