//! In-memory triple store
//!
//! Backs the reference [`MemoryBackend`](crate::session::MemoryBackend).
//! Triples keep their insertion order; subject and predicate indices narrow
//! pattern lookups.

use super::types::{RdfPredicate, RdfSubject, Triple, TriplePattern};
use indexmap::IndexSet;
use rustc_hash::{FxHashMap, FxHashSet};

/// Triple set with subject (SP-O) and predicate (P-OS) indices
#[derive(Debug, Clone, Default)]
pub struct TripleStore {
    /// All triples (primary storage, insertion ordered)
    triples: IndexSet<Triple>,

    /// Subject -> triples with that subject
    by_subject: FxHashMap<RdfSubject, FxHashSet<Triple>>,

    /// Predicate -> triples with that predicate
    by_predicate: FxHashMap<RdfPredicate, FxHashSet<Triple>>,
}

impl TripleStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a triple; returns false if it was already present
    pub fn insert(&mut self, triple: Triple) -> bool {
        if self.triples.contains(&triple) {
            return false;
        }

        self.by_subject
            .entry(triple.subject.clone())
            .or_default()
            .insert(triple.clone());
        self.by_predicate
            .entry(triple.predicate.clone())
            .or_default()
            .insert(triple.clone());
        self.triples.insert(triple);
        true
    }

    /// Remove a triple; returns false if it was absent
    pub fn remove(&mut self, triple: &Triple) -> bool {
        if !self.triples.shift_remove(triple) {
            return false;
        }

        if let Some(set) = self.by_subject.get_mut(&triple.subject) {
            set.remove(triple);
            if set.is_empty() {
                self.by_subject.remove(&triple.subject);
            }
        }
        if let Some(set) = self.by_predicate.get_mut(&triple.predicate) {
            set.remove(triple);
            if set.is_empty() {
                self.by_predicate.remove(&triple.predicate);
            }
        }
        true
    }

    /// Check if a triple exists in the store
    pub fn contains(&self, triple: &Triple) -> bool {
        self.triples.contains(triple)
    }

    /// Get the total number of triples
    pub fn len(&self) -> usize {
        self.triples.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    /// Clear all triples
    pub fn clear(&mut self) {
        self.triples.clear();
        self.by_subject.clear();
        self.by_predicate.clear();
    }

    /// Triples matching a pattern, in insertion order
    pub fn query(&self, pattern: &TriplePattern) -> Vec<Triple> {
        let candidates = match (&pattern.subject, &pattern.predicate) {
            (Some(subject), _) => self.by_subject.get(subject),
            (None, Some(predicate)) => self.by_predicate.get(predicate),
            (None, None) => {
                return self
                    .triples
                    .iter()
                    .filter(|triple| pattern.matches(triple))
                    .cloned()
                    .collect();
            }
        };

        let Some(candidates) = candidates else {
            return Vec::new();
        };
        let mut matched: Vec<(usize, &Triple)> = candidates
            .iter()
            .filter(|triple| pattern.matches(triple))
            .filter_map(|triple| self.triples.get_index_of(triple).map(|idx| (idx, triple)))
            .collect();
        matched.sort_unstable_by_key(|(idx, _)| *idx);
        matched.into_iter().map(|(_, triple)| triple.clone()).collect()
    }

    /// Get an iterator over all triples
    pub fn iter(&self) -> impl Iterator<Item = &Triple> {
        self.triples.iter()
    }
}
