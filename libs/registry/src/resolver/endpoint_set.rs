use std::collections::{BTreeMap, BTreeSet};

use crate::endpoint::EndpointDescriptor;

/// How far the local view is from the store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Initial read not finished yet.
    #[default]
    Syncing,
    /// Reflects the store up to the watch propagation delay.
    Synced,
    /// The watch could not be re-established; the set is empty until it is.
    Degraded,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Degraded => "degraded",
        })
    }
}

/// Live endpoints of one service, keyed by registry key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSet {
    entries: BTreeMap<String, EndpointDescriptor>,
    state: SyncState,
}

/// Addresses that appeared and disappeared between two sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl EndpointDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl EndpointSet {
    pub(crate) fn from_entries(
        entries: impl IntoIterator<Item = (String, EndpointDescriptor)>,
        state: SyncState,
    ) -> Self {
        Self {
            entries: entries.into_iter().collect(),
            state,
        }
    }

    pub(crate) fn degraded() -> Self {
        Self {
            entries: BTreeMap::new(),
            state: SyncState::Degraded,
        }
    }

    /// Insert or replace. Returns whether anything changed.
    pub(crate) fn upsert(&mut self, key: String, descriptor: EndpointDescriptor) -> bool {
        if self.entries.get(&key) == Some(&descriptor) {
            return false;
        }
        self.entries.insert(key, descriptor);
        true
    }

    pub(crate) fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        self.state
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct addresses, sorted.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        self.entries
            .values()
            .map(|d| d.address.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &EndpointDescriptor> {
        self.entries.values()
    }

    /// One descriptor per address, sorted by address. An address registered
    /// under several versions keeps the descriptor with the lowest key.
    #[must_use]
    pub fn unique_endpoints(&self) -> Vec<&EndpointDescriptor> {
        let mut by_address: BTreeMap<&str, &EndpointDescriptor> = BTreeMap::new();
        for d in self.entries.values() {
            by_address.entry(d.address.as_str()).or_insert(d);
        }
        by_address.into_values().collect()
    }

    #[must_use]
    pub fn contains_address(&self, address: &str) -> bool {
        self.entries.values().any(|d| d.address == address)
    }

    /// Address-level changes from `previous` to `self`.
    #[must_use]
    pub fn diff(&self, previous: &Self) -> EndpointDiff {
        let now: BTreeSet<String> = self.addresses().into_iter().collect();
        let before: BTreeSet<String> = previous.addresses().into_iter().collect();
        EndpointDiff {
            added: now.difference(&before).cloned().collect(),
            removed: before.difference(&now).cloned().collect(),
        }
    }
}
