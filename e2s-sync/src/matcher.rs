//! Pairs source records with destination records.
//!
//! Matching happens in two passes over a [`DestinationIndex`] that is built
//! completely before any source is looked at:
//!
//! 1. **Exact.** The sanitized source id is looked up among the identifiers
//!    stored in destination external ids (canonical key or legacy alias).
//! 2. **Probable.** Sources left over are scored against scoped destinations
//!    that carry no identifier. Candidates rank in tiers:
//!    - tier 0: same normalized name and same normalized address
//!    - tier 1: same normalized name within the distance threshold, nearer wins
//!    - tier 2: same normalized address
//!
//!    A tie for the best score is never broken; it becomes a conflict, as does
//!    a destination that is the best candidate of more than one source.
//!
//! Managed destinations nobody claims are orphans (full runs only).
//! Unmanaged destinations never produce a pairing.

use std::collections::{BTreeMap, BTreeSet};

use e2s_core::external_id;
use e2s_core::geo::haversine_m;
use e2s_core::{
    DestinationRecord, GeoPoint, Normalizer, RecordError, RowAction, SourceId, SourceRecord,
    TagResolver,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Which roster a run was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Complete roster. Unclaimed managed destinations are orphans.
    Full,
    /// Delta roster. Only rows present are acted upon.
    Daily,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchConfidence {
    Exact,
    Probable,
}

/// Outcome of matching for one record (or one source/destination pair).
///
/// Indices refer to the slices handed to [`match_records`].
#[derive(Debug, Clone, PartialEq)]
pub enum Pairing {
    Matched {
        source: usize,
        destination: usize,
        key: SourceId,
        confidence: MatchConfidence,
    },
    New {
        source: usize,
        key: SourceId,
    },
    Orphan {
        destination: usize,
    },
    Rejected {
        source: Option<usize>,
        destination: Option<usize>,
        error: RecordError,
    },
}

/// Whether the record is under this tool's management: scope marker present
/// or a recognized source identifier stored.
pub fn is_managed(resolver: &TagResolver, record: &DestinationRecord) -> bool {
    resolver.is_scoped(record) || !external_id::source_id_values(&record.external_ids).is_empty()
}

// ---------------------------------------------------------------------------
// Destination index
// ---------------------------------------------------------------------------

/// Destination records keyed by stored source identifier.
#[derive(Debug, Default)]
pub struct DestinationIndex {
    /// Identifier → destinations holding it without ambiguity.
    by_source_id: BTreeMap<String, Vec<usize>>,
    /// Identifier → destinations whose own id keys disagree and mention it.
    conflicted_ids: BTreeMap<String, Vec<usize>>,
    /// Destinations whose id keys disagree, with the conflict.
    id_conflicts: BTreeMap<usize, RecordError>,
    /// Scoped destinations without any identifier.
    unlinked: Vec<usize>,
    /// Destinations that are managed at all.
    managed: BTreeSet<usize>,
}

impl DestinationIndex {
    pub fn build(destinations: &[DestinationRecord], resolver: &TagResolver) -> Self {
        let mut index = DestinationIndex::default();
        for (i, dest) in destinations.iter().enumerate() {
            let values = external_id::source_id_values(&dest.external_ids);
            match values.len() {
                0 => {
                    if resolver.is_scoped(dest) {
                        index.unlinked.push(i);
                        index.managed.insert(i);
                    }
                }
                1 => {
                    let (_, id) = &values[0];
                    index.by_source_id.entry(id.clone()).or_default().push(i);
                    index.managed.insert(i);
                }
                _ => {
                    if let Err(error) = external_id::read_source_id(&dest.external_ids) {
                        index.id_conflicts.insert(i, error);
                    }
                    for (_, id) in values {
                        index.conflicted_ids.entry(id).or_default().push(i);
                    }
                    index.managed.insert(i);
                }
            }
        }
        tracing::debug!(
            "indexed {} destinations: {} by id, {} unlinked, {} conflicting",
            destinations.len(),
            index.by_source_id.len(),
            index.unlinked.len(),
            index.id_conflicts.len()
        );
        index
    }

    pub fn lookup(&self, id: &str) -> &[usize] {
        self.by_source_id.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_managed(&self, destination: usize) -> bool {
        self.managed.contains(&destination)
    }

    pub fn unlinked(&self) -> &[usize] {
        &self.unlinked
    }
}

// ---------------------------------------------------------------------------
// Probable-match scoring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
struct Score {
    tier: u8,
    distance_m: f64,
}

struct Comparable {
    name: String,
    address: String,
    point: Option<GeoPoint>,
}

fn score(src: &Comparable, dst: &Comparable, threshold_m: f64) -> Option<Score> {
    let same_name = !src.name.is_empty() && src.name == dst.name;
    let same_address = !src.address.is_empty() && src.address == dst.address;
    if same_name && same_address {
        return Some(Score {
            tier: 0,
            distance_m: 0.0,
        });
    }
    if same_name {
        if let (Some(a), Some(b)) = (src.point, dst.point) {
            let d = haversine_m(a, b);
            if d <= threshold_m {
                return Some(Score {
                    tier: 1,
                    distance_m: d,
                });
            }
        }
    }
    if same_address {
        return Some(Score {
            tier: 2,
            distance_m: 0.0,
        });
    }
    None
}

/// Best-scoring candidates for one source; more than one means a tie.
fn best_candidates(
    src: &Comparable,
    candidates: &[(usize, Comparable)],
    threshold_m: f64,
) -> Vec<usize> {
    let mut best: Option<Score> = None;
    let mut winners = Vec::new();
    for (idx, dst) in candidates {
        let Some(s) = score(src, dst, threshold_m) else {
            continue;
        };
        match best {
            Some(b) if s > b => {}
            Some(b) if s == b => winners.push(*idx),
            _ => {
                best = Some(s);
                winners.clear();
                winners.push(*idx);
            }
        }
    }
    winners
}

// ---------------------------------------------------------------------------
// match_records
// ---------------------------------------------------------------------------

/// Settings the matcher needs from the run configuration.
#[derive(Debug, Clone)]
pub struct MatchOptions<'a> {
    pub mode: RunMode,
    pub normalizer: &'a Normalizer,
    pub distance_threshold_m: f64,
}

/// Pairs every source and every managed destination.
///
/// Output order: one entry per source in input order, then destination-only
/// entries (orphans, flagged destinations) in input order.
pub fn match_records(
    sources: &[SourceRecord],
    destinations: &[DestinationRecord],
    resolver: &TagResolver,
    options: &MatchOptions<'_>,
) -> Vec<Pairing> {
    let index = DestinationIndex::build(destinations, resolver);

    // Sanitized keys and duplicate detection.
    let keys: Vec<Result<SourceId, RecordError>> = sources
        .iter()
        .map(|s| external_id::sanitize_required("customer id", &s.id.0).map(SourceId::from))
        .collect();
    let mut key_counts: BTreeMap<&SourceId, usize> = BTreeMap::new();
    for key in keys.iter().flatten() {
        *key_counts.entry(key).or_default() += 1;
    }

    let mut source_out: Vec<Option<Pairing>> = vec![None; sources.len()];
    let mut claimed: BTreeSet<usize> = BTreeSet::new();
    let mut flagged: BTreeMap<usize, RecordError> = index.id_conflicts.clone();
    let mut needs_probable: Vec<usize> = Vec::new();

    for (si, key) in keys.iter().enumerate() {
        let key = match key {
            Ok(k) => k,
            Err(error) => {
                source_out[si] = Some(Pairing::Rejected {
                    source: Some(si),
                    destination: None,
                    error: error.clone(),
                });
                continue;
            }
        };
        let hits = index.lookup(&key.0);

        if key_counts.get(key).copied().unwrap_or(0) > 1 {
            let error = RecordError::conflict(format!("duplicate source id {key}"));
            for &d in hits {
                flagged.entry(d).or_insert_with(|| error.clone());
            }
            source_out[si] = Some(Pairing::Rejected {
                source: Some(si),
                destination: None,
                error,
            });
            continue;
        }

        if let Some(conflicting) = index.conflicted_ids.get(&key.0) {
            let ids: Vec<String> = conflicting
                .iter()
                .map(|&d| destinations[d].id.to_string())
                .collect();
            source_out[si] = Some(Pairing::Rejected {
                source: Some(si),
                destination: None,
                error: RecordError::conflict(format!(
                    "destinations {} carry conflicting ids including {key}",
                    ids.join(", ")
                )),
            });
            continue;
        }

        match hits {
            [] => needs_probable.push(si),
            [d] => {
                claimed.insert(*d);
                source_out[si] = Some(Pairing::Matched {
                    source: si,
                    destination: *d,
                    key: key.clone(),
                    confidence: MatchConfidence::Exact,
                });
            }
            many => {
                let ids: Vec<String> = many
                    .iter()
                    .map(|&d| destinations[d].id.to_string())
                    .collect();
                let error = RecordError::conflict(format!(
                    "source id {key} is held by destinations {}",
                    ids.join(", ")
                ));
                for &d in many {
                    flagged.entry(d).or_insert_with(|| error.clone());
                }
                source_out[si] = Some(Pairing::Rejected {
                    source: Some(si),
                    destination: None,
                    error,
                });
            }
        }
    }

    // Probable matching for upsert rows only.
    let comparable = |name: &str, address: &str, point: Option<GeoPoint>| Comparable {
        name: options.normalizer.normalize(name),
        address: options.normalizer.normalize(address),
        point,
    };
    let candidates: Vec<(usize, Comparable)> = index
        .unlinked()
        .iter()
        .map(|&d| {
            let dest = &destinations[d];
            (
                d,
                comparable(
                    &dest.name,
                    &dest.formatted_address,
                    dest.geofence.as_ref().and_then(|g| g.center()),
                ),
            )
        })
        .collect();

    let (probable, new_only): (Vec<usize>, Vec<usize>) = needs_probable
        .into_iter()
        .partition(|&si| sources[si].action != Some(RowAction::Delete) && !candidates.is_empty());

    let bests: Vec<(usize, Vec<usize>)> = probable
        .par_iter()
        .map(|&si| {
            let src = &sources[si];
            let cmp = comparable(&src.name, &src.address, src.coordinates.point());
            (si, best_candidates(&cmp, &candidates, options.distance_threshold_m))
        })
        .collect();

    let mut claims: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (si, best) in &bests {
        for &d in best {
            claims.entry(d).or_default().push(*si);
        }
    }

    for (si, best) in bests {
        let key = match &keys[si] {
            Ok(k) => k.clone(),
            Err(_) => continue,
        };
        match best.as_slice() {
            [] => {
                source_out[si] = Some(Pairing::New { source: si, key });
            }
            [d] if claims.get(d).map(Vec::len) == Some(1) => {
                tracing::info!(
                    "probable match: source {key} -> destination {}",
                    destinations[*d].id
                );
                claimed.insert(*d);
                source_out[si] = Some(Pairing::Matched {
                    source: si,
                    destination: *d,
                    key,
                    confidence: MatchConfidence::Probable,
                });
            }
            tied => {
                let ids: Vec<String> = tied
                    .iter()
                    .map(|&d| destinations[d].id.to_string())
                    .collect();
                let error = if tied.len() > 1 {
                    RecordError::conflict(format!(
                        "ambiguous probable match for {key}: destinations {}",
                        ids.join(", ")
                    ))
                } else {
                    RecordError::conflict(format!(
                        "destination {} is the probable match of several sources",
                        ids.join(", ")
                    ))
                };
                for &d in tied {
                    flagged.entry(d).or_insert_with(|| error.clone());
                }
                source_out[si] = Some(Pairing::Rejected {
                    source: Some(si),
                    destination: None,
                    error,
                });
            }
        }
    }

    for si in new_only {
        if let Ok(key) = &keys[si] {
            source_out[si] = Some(Pairing::New {
                source: si,
                key: key.clone(),
            });
        }
    }

    let mut out: Vec<Pairing> = source_out.into_iter().flatten().collect();

    for di in 0..destinations.len() {
        if let Some(error) = flagged.remove(&di) {
            out.push(Pairing::Rejected {
                source: None,
                destination: Some(di),
                error,
            });
        } else if options.mode == RunMode::Full
            && index.is_managed(di)
            && !claimed.contains(&di)
        {
            out.push(Pairing::Orphan { destination: di });
        }
    }
    out
}
