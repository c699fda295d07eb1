//! Run Metrics
//!
//! Per-country counters for one pipeline run. Shared between concurrent
//! fact tasks, so every counter sits behind a lock.

use crate::etl::records::SkipReason;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Counters recorded for one source country
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryCounters {
    pub movies_extracted: u64,
    pub branches_extracted: u64,
    pub aggregates_read: u64,
    pub facts_loaded: u64,
    pub skipped: BTreeMap<SkipReason, u64>,
    pub commits: u64,
}

impl CountryCounters {
    pub fn total_skipped(&self) -> u64 {
        self.skipped.values().sum()
    }
}

/// Run metrics tracker
#[derive(Clone, Default)]
pub struct EtlMetrics {
    counters: Arc<Mutex<BTreeMap<String, CountryCounters>>>,
}

impl EtlMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, country: &str, f: impl FnOnce(&mut CountryCounters)) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        f(counters.entry(country.to_string()).or_default());
    }

    pub fn record_movies_extracted(&self, country: &str, count: u64) {
        self.update(country, |c| c.movies_extracted += count);
    }

    pub fn record_branches_extracted(&self, country: &str, count: u64) {
        self.update(country, |c| c.branches_extracted += count);
    }

    pub fn record_aggregate_read(&self, country: &str) {
        self.update(country, |c| c.aggregates_read += 1);
    }

    pub fn record_facts_loaded(&self, country: &str, count: u64) {
        self.update(country, |c| c.facts_loaded += count);
    }

    pub fn record_skipped(&self, country: &str, reason: SkipReason) {
        self.update(country, |c| *c.skipped.entry(reason).or_insert(0) += 1);
    }

    pub fn record_commit(&self, country: &str) {
        self.update(country, |c| c.commits += 1);
    }

    pub fn country(&self, country: &str) -> CountryCounters {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.get(country).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, CountryCounters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_country() {
        let metrics = EtlMetrics::new();
        metrics.record_aggregate_read("GT");
        metrics.record_aggregate_read("GT");
        metrics.record_facts_loaded("GT", 1);
        metrics.record_skipped("GT", SkipReason::MissingTimeKey);
        metrics.record_commit("SV");

        let gt = metrics.country("GT");
        assert_eq!(gt.aggregates_read, 2);
        assert_eq!(gt.facts_loaded, 1);
        assert_eq!(gt.total_skipped(), 1);
        assert_eq!(gt.commits, 0);
        assert_eq!(metrics.country("SV").commits, 1);
        assert_eq!(metrics.snapshot().len(), 2);
    }

    #[test]
    fn test_clones_share_state() {
        let metrics = EtlMetrics::new();
        let handle = metrics.clone();
        handle.record_facts_loaded("SV", 1);
        assert_eq!(metrics.country("SV").facts_loaded, 1);
    }
}
