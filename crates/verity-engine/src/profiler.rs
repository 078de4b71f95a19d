//! Per-constraint execution time accounting

use serde::{Deserialize, Serialize};
use std::time::Duration;
use indexmap::IndexMap;

/// Cumulative execution time per qualified constraint name
///
/// Merging sums durations, so merge order does not affect the totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profiler {
    times: IndexMap<String, Duration>,
}

impl Profiler {
    /// Create an empty profiler
    pub fn new() -> Self {
        Self::default()
    }

    /// Add time spent on a constraint
    pub fn add(&mut self, name: &str, elapsed: Duration) {
        match self.times.get_mut(name) {
            Some(total) => *total += elapsed,
            None => {
                self.times.insert(name.to_string(), elapsed);
            }
        }
    }

    /// Fold another profiler into this one
    pub fn merge(&mut self, other: &Profiler) {
        for (name, elapsed) in &other.times {
            self.add(name, *elapsed);
        }
    }

    /// Total time recorded for a constraint
    pub fn get(&self, name: &str) -> Option<Duration> {
        self.times.get(name).copied()
    }

    /// Sum over every constraint
    pub fn total(&self) -> Duration {
        self.times.values().sum()
    }

    /// Iterate (name, total) pairs in first-seen order
    pub fn iter(&self) -> impl Iterator<Item = (&str, Duration)> {
        self.times.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Names sorted by descending total time
    pub fn slowest(&self) -> Vec<(&str, Duration)> {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}
