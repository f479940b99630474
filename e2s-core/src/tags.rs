//! Tag directory lookups and scope/quarantine tag recognition.
//!
//! The directory is fetched once per run and is read-only. Tags are never
//! created: a label without exactly one matching tag fails closed.

use std::collections::BTreeMap;

use crate::error::RecordError;
use crate::external_id;
use crate::types::{DestinationRecord, Tag, TagId};

/// Name → id index over the destination's tags.
#[derive(Debug, Clone, Default)]
pub struct TagDirectory {
    by_name: BTreeMap<String, Vec<TagId>>,
}

impl TagDirectory {
    pub fn new(tags: impl IntoIterator<Item = Tag>) -> Self {
        let mut by_name: BTreeMap<String, Vec<TagId>> = BTreeMap::new();
        for tag in tags {
            if tag.name.is_empty() || tag.id.0.is_empty() {
                continue;
            }
            let ids = by_name.entry(tag.name).or_default();
            if !ids.contains(&tag.id) {
                ids.push(tag.id);
            }
        }
        Self { by_name }
    }

    /// Exact, case-sensitive lookup. Names shared by several tags resolve to
    /// nothing.
    pub fn lookup(&self, name: &str) -> Option<&TagId> {
        match self.by_name.get(name).map(Vec::as_slice) {
            Some([only]) => Some(only),
            _ => None,
        }
    }

    pub fn is_ambiguous(&self, name: &str) -> bool {
        self.by_name.get(name).is_some_and(|ids| ids.len() > 1)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Resolves category labels and recognizes the run's special tags.
#[derive(Debug, Clone)]
pub struct TagResolver {
    directory: TagDirectory,
    scope: Option<TagId>,
    quarantine: Option<TagId>,
}

impl TagResolver {
    pub fn new(directory: TagDirectory, scope_tag: &str, quarantine_tag: &str) -> Self {
        let scope = directory.lookup(scope_tag).cloned();
        if scope.is_none() {
            tracing::warn!(
                "scope tag {scope_tag:?} not found in tag directory; \
                 records are marked through external ids only"
            );
        }
        let quarantine = directory.lookup(quarantine_tag).cloned();
        if quarantine.is_none() {
            tracing::warn!(
                "quarantine tag {quarantine_tag:?} not found in tag directory; \
                 falling back to the {} external id",
                external_id::DELETE_MARKER_KEY
            );
        }
        Self {
            directory,
            scope,
            quarantine,
        }
    }

    /// Tag id for a category label. Blank labels resolve to `None`; unknown
    /// or ambiguous labels are a resolution error.
    pub fn resolve_category(
        &self,
        category: &str,
        label: &str,
    ) -> Result<Option<TagId>, RecordError> {
        let label = label.trim();
        if label.is_empty() {
            return Ok(None);
        }
        match self.directory.lookup(label) {
            Some(id) => Ok(Some(id.clone())),
            None => {
                if self.directory.is_ambiguous(label) {
                    tracing::warn!("{category} tag {label:?} matches several tags");
                }
                Err(RecordError::resolution(category, label))
            }
        }
    }

    pub fn scope_tag(&self) -> Option<&TagId> {
        self.scope.as_ref()
    }

    pub fn quarantine_tag(&self) -> Option<&TagId> {
        self.quarantine.as_ref()
    }

    /// Whether the record carries the scope marker: the scope tag or the
    /// managed external-id flag.
    pub fn is_scoped(&self, record: &DestinationRecord) -> bool {
        self.scope
            .as_ref()
            .is_some_and(|id| record.tag_ids.contains(id))
            || external_id::has_managed_flag(&record.external_ids)
    }
}
