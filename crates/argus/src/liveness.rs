//! Liveness Vector
//!
//! Per-callback last-execution tick map. Callbacks stamp it themselves on
//! handled completion; a callback that dies without catching never stamps and
//! shows up unhealthy within two of its intervals. This is the primary
//! self-diagnosis mechanism behind the heartbeat file.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

/// One tracked callback.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessEntry {
    pub name: String,
    pub last_execution_tick: u64,
    pub expected_interval_ticks: u64,
}

/// An entry that failed the health rule, with the observed age.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnhealthyCallback {
    pub name: String,
    pub last_execution_tick: u64,
    pub expected_interval_ticks: u64,
    pub age_ticks: u64,
}

/// Thread-safe map of callback executions.
#[derive(Default)]
pub struct LivenessVector {
    entries: RwLock<HashMap<String, LivenessEntry>>,
}

impl LivenessVector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the entry for `name` with the current tick.
    pub fn record_execution(&self, name: &str, expected_interval_ticks: u64, current_tick: u64) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.insert(
            name.to_string(),
            LivenessEntry {
                name: name.to_string(),
                last_execution_tick: current_tick,
                expected_interval_ticks: expected_interval_ticks.max(1),
            },
        );
    }

    /// A callback is stuck once its age reaches twice its expected interval.
    #[must_use]
    pub fn unhealthy_callbacks(&self, current_tick: u64) -> Vec<UnhealthyCallback> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .values()
            .filter_map(|e| {
                let age = current_tick.saturating_sub(e.last_execution_tick);
                (age >= e.expected_interval_ticks * 2).then(|| UnhealthyCallback {
                    name: e.name.clone(),
                    last_execution_tick: e.last_execution_tick,
                    expected_interval_ticks: e.expected_interval_ticks,
                    age_ticks: age,
                })
            })
            .collect()
    }

    #[must_use]
    pub fn is_healthy(&self, current_tick: u64) -> bool {
        self.unhealthy_callbacks(current_tick).is_empty()
    }

    /// Materialized copy of all entries.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LivenessEntry> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut all: Vec<_> = entries.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_overwrites() {
        let vector = LivenessVector::new();
        vector.record_execution("snapshot", 30, 10);
        vector.record_execution("snapshot", 30, 40);
        assert_eq!(vector.count(), 1);
        assert_eq!(vector.snapshot()[0].last_execution_tick, 40);
    }

    #[test]
    fn test_unhealthy_at_twice_interval() {
        let vector = LivenessVector::new();
        vector.record_execution("poll", 10, 100);

        // age 19 is still healthy, age 20 is not
        assert!(vector.is_healthy(119));
        assert!(!vector.is_healthy(120));

        let unhealthy = vector.unhealthy_callbacks(121);
        assert_eq!(unhealthy.len(), 1);
        assert_eq!(unhealthy[0].name, "poll");
        assert_eq!(unhealthy[0].age_ticks, 21);
    }

    #[test]
    fn test_healthy_after_restamp() {
        let vector = LivenessVector::new();
        vector.record_execution("poll", 10, 100);
        assert!(!vector.is_healthy(130));
        vector.record_execution("poll", 10, 130);
        assert!(vector.is_healthy(131));
    }

    #[test]
    fn test_empty_vector_is_healthy() {
        let vector = LivenessVector::new();
        assert!(vector.is_healthy(0));
        assert!(vector.is_healthy(1_000_000));
    }
}
