use log::{debug, info};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Counters describing a tracker's growth, used in summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoverageStats {
    pub total_tokens: usize,
    pub updates: u64,
    pub discovery_events: usize,
}

/// The monotonically growing set of coverage tokens discovered during a run.
///
/// Each token remembers the iteration it was first seen at. Tokens are never removed,
/// so `total()` is non-decreasing over the life of the tracker.
#[derive(Debug, Clone)]
pub struct CoverageTracker {
    name: String,
    known: BTreeMap<String, u64>,
    history: Vec<(u64, usize)>,
    discovery_iterations: Vec<u64>,
    updates: u64,
}

impl CoverageTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            known: BTreeMap::new(),
            history: Vec::new(),
            discovery_iterations: Vec::new(),
            updates: 0,
        }
    }

    /// Rebuilds a tracker from a checkpointed token set. Restored tokens are attributed
    /// to the checkpoint iteration.
    pub fn restore(name: impl Into<String>, tokens: BTreeSet<String>, iteration: u64) -> Self {
        let mut tracker = Self::new(name);
        tracker.known = tokens.into_iter().map(|t| (t, iteration)).collect();
        tracker.history.push((iteration, tracker.known.len()));
        tracker
    }

    /// Merges `tokens` into the known set and returns how many of them were new.
    pub fn update<'a, T>(&mut self, tokens: T, iteration: u64) -> usize
    where
        T: IntoIterator<Item = &'a String>,
    {
        self.updates += 1;
        let mut fresh = 0;
        for token in tokens {
            if !self.known.contains_key(token) {
                self.known.insert(token.clone(), iteration);
                fresh += 1;
            }
        }
        self.history.push((iteration, self.known.len()));

        if fresh > 0 {
            self.discovery_iterations.push(iteration);
            info!(
                "[{}] iteration {}: {} new tokens (total {})",
                self.name,
                iteration,
                fresh,
                self.known.len()
            );
        } else {
            debug!("[{}] iteration {}: no new tokens", self.name, iteration);
        }
        fresh
    }

    pub fn total(&self) -> usize {
        self.known.len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contains(&self, token: &str) -> bool {
        self.known.contains_key(token)
    }

    /// Iteration at which `token` was first observed.
    pub fn first_seen(&self, token: &str) -> Option<u64> {
        self.known.get(token).copied()
    }

    pub fn tokens(&self) -> impl Iterator<Item = &String> {
        self.known.keys()
    }

    pub fn token_set(&self) -> BTreeSet<String> {
        self.known.keys().cloned().collect()
    }

    /// `(iteration, total)` after every update, in call order.
    pub fn history(&self) -> &[(u64, usize)] {
        &self.history
    }

    pub fn discovery_iterations(&self) -> &[u64] {
        &self.discovery_iterations
    }

    /// Tokens this tracker found that `other` did not.
    pub fn exclusive(&self, other: &CoverageTracker) -> BTreeSet<String> {
        self.known
            .keys()
            .filter(|t| !other.known.contains_key(*t))
            .cloned()
            .collect()
    }

    /// Tokens found by both trackers.
    pub fn overlap(&self, other: &CoverageTracker) -> BTreeSet<String> {
        self.known
            .keys()
            .filter(|t| other.known.contains_key(*t))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> CoverageStats {
        CoverageStats {
            total_tokens: self.known.len(),
            updates: self.updates,
            discovery_events: self.discovery_iterations.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(tokens: &[&str]) -> BTreeSet<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn update_counts_only_fresh_tokens() {
        let mut tracker = CoverageTracker::new("t");
        assert_eq!(tracker.update(&set(&["a", "b"]), 0), 2);
        assert_eq!(tracker.update(&set(&["b", "c"]), 1), 1);
        assert_eq!(tracker.update(&set(&["a"]), 2), 0);
        assert_eq!(tracker.total(), 3);
        assert_eq!(tracker.first_seen("c"), Some(1));
        assert_eq!(tracker.first_seen("zzz"), None);
        assert_eq!(tracker.history(), &[(0, 2), (1, 3), (2, 3)]);
        assert_eq!(tracker.discovery_iterations(), &[0, 1]);
    }

    #[test]
    fn total_matches_union_and_never_decreases() {
        let batches = [
            set(&["k1", "k2"]),
            set(&[]),
            set(&["k2", "k3", "k4"]),
            set(&["k1"]),
            set(&["k5"]),
        ];
        let mut tracker = CoverageTracker::new("t");
        let mut union = BTreeSet::new();
        let mut previous = 0;
        for (i, batch) in batches.iter().enumerate() {
            tracker.update(batch, i as u64);
            union.extend(batch.iter().cloned());
            assert_eq!(tracker.total(), union.len());
            assert!(tracker.total() >= previous);
            previous = tracker.total();
        }
    }

    #[test]
    fn exclusive_and_overlap_compare_two_trackers() {
        let mut left = CoverageTracker::new("left");
        let mut right = CoverageTracker::new("right");
        left.update(&set(&["a", "b", "c"]), 0);
        right.update(&set(&["b", "c", "d"]), 0);

        assert_eq!(left.exclusive(&right), set(&["a"]));
        assert_eq!(right.exclusive(&left), set(&["d"]));
        assert_eq!(left.overlap(&right), set(&["b", "c"]));
    }

    #[test]
    fn restore_attributes_tokens_to_checkpoint_iteration() {
        let tracker = CoverageTracker::restore("t", set(&["x", "y"]), 41);
        assert_eq!(tracker.total(), 2);
        assert_eq!(tracker.first_seen("x"), Some(41));
        assert_eq!(tracker.history(), &[(41, 2)]);
        assert_eq!(tracker.token_set(), set(&["x", "y"]));
    }
}
