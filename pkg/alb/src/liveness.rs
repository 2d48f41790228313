//! Mark-and-sweep tracking of top-level reconciliation units.
//!
//! Each cycle starts by marking every tracked unit [`Liveness::Stale`]. Units still
//! demanded by an Ingress are visited back to [`Liveness::Live`]; whatever stays
//! stale is swept by the caller. Units adopted from the remote side start as
//! [`Liveness::Unknown`] so that a sweep can only happen after a full mark.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Tracked but not yet evaluated by a mark.
    Unknown,
    /// Marked and not visited this cycle.
    Stale,
    /// Visited this cycle.
    Live,
}

struct Entry<T> {
    liveness: Liveness,
    unit: T,
}

/// Units keyed by Ingress identifier.
pub struct LivenessTracker<T> {
    entries: BTreeMap<String, Entry<T>>,
}

impl<T> Default for LivenessTracker<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> LivenessTracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `unit` without an opinion on its liveness. Replaces any unit already under `id`.
    pub fn insert_unknown(&mut self, id: &str, unit: T) {
        self.entries.insert(
            id.to_string(),
            Entry {
                liveness: Liveness::Unknown,
                unit,
            },
        );
    }

    /// Flag every tracked unit stale.
    pub fn mark(&mut self) {
        for entry in self.entries.values_mut() {
            entry.liveness = Liveness::Stale;
        }
    }

    /// Return the unit for `id` flagged live, creating it with `create` when untracked.
    pub fn visit_with(&mut self, id: &str, create: impl FnOnce() -> T) -> &mut T {
        let entry = self.entries.entry(id.to_string()).or_insert_with(|| Entry {
            liveness: Liveness::Live,
            unit: create(),
        });
        entry.liveness = Liveness::Live;
        &mut entry.unit
    }

    /// Flag an already tracked unit live without handing it out. Returns whether it was tracked.
    pub fn touch(&mut self, id: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.liveness = Liveness::Live;
                true
            }
            None => false,
        }
    }

    /// Identifiers of units that were marked and not visited since.
    pub fn stale_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.liveness == Liveness::Stale)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.entries.get(id).map(|e| &e.unit)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.entries.get_mut(id).map(|e| &mut e.unit)
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        self.entries.remove(id).map(|e| e.unit)
    }

    /// End of cycle: live units go back to unknown until the next mark.
    pub fn settle(&mut self) {
        for entry in self.entries.values_mut() {
            if entry.liveness == Liveness::Live {
                entry.liveness = Liveness::Unknown;
            }
        }
    }

    pub fn liveness(&self, id: &str) -> Option<Liveness> {
        self.entries.get(id).map(|e| e.liveness)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
