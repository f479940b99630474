//! Destination records that are never mutated ("warehouses").

use std::collections::BTreeSet;

use crate::types::{AddressId, DestinationRecord};

/// Ids are matched exactly; names case-insensitively after trimming.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Denylist {
    ids: BTreeSet<AddressId>,
    names: BTreeSet<String>,
}

impl Denylist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_id(&mut self, id: &str) {
        let id = id.trim();
        if !id.is_empty() {
            self.ids.insert(AddressId::from(id));
        }
    }

    pub fn add_name(&mut self, name: &str) {
        let name = name.trim().to_lowercase();
        if !name.is_empty() {
            self.names.insert(name);
        }
    }

    pub fn contains_id(&self, id: &AddressId) -> bool {
        self.ids.contains(id)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.names.contains(&name.trim().to_lowercase())
    }

    /// Whether the record matches the denylist by id or by name.
    pub fn matches(&self, record: &DestinationRecord) -> bool {
        self.contains_id(&record.id) || self.contains_name(&record.name)
    }

    pub fn len(&self) -> usize {
        self.ids.len() + self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.names.is_empty()
    }
}
