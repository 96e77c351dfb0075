//! Suppression Cache
//!
//! Remembers which (fingerprint, status) pairs were recently handed to the
//! NOC pipeline so the snapshot does not re-enqueue them inside their window.
//! Entries are marked at enqueue time and unmarked when dispatch fails, which
//! together with the single-consumer queue yields at-most-once delivery per
//! window. There is no sweeper; entries are overwritten or cleared on outcome.

use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

use crate::alerts::{Alert, AlertStatus};
use crate::config::DefaultNocConfig;
use crate::timer::TICK_INTERVAL_SECONDS;

/// Annotation that overrides the suppression window per alert.
pub const SUPPRESS_WINDOW_ANNOTATION: &str = "suppress_window";

#[derive(Debug, Clone, Copy)]
struct SuppressionEntry {
    processed_at_tick: u64,
    window_ticks: u64,
}

/// Per-(fingerprint, status) recently-processed windows, tick-based.
pub struct SuppressionCache {
    entries: DashMap<String, SuppressionEntry>,
    defaults: DefaultNocConfig,
}

/// Parse the duration grammar `<decimal><s|m|h|d>`.
///
/// The empty string is a valid "no suppression" zero; anything unparseable
/// returns `None` so callers can fall through to their default.
#[must_use]
pub fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Some(Duration::ZERO);
    }
    if !s.is_char_boundary(s.len() - 1) {
        return None;
    }

    let (value, unit) = s.split_at(s.len() - 1);
    let multiplier = match unit {
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        "d" => 86400.0,
        _ => return None,
    };

    let value: f64 = value.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(value * multiplier))
}

impl SuppressionCache {
    #[must_use]
    pub fn new(defaults: DefaultNocConfig) -> Self {
        Self {
            entries: DashMap::new(),
            defaults,
        }
    }

    fn key(alert: &Alert) -> String {
        format!("{}:{}", alert.fingerprint, alert.status)
    }

    /// Effective window in seconds for this alert, resolved in order:
    /// explicit field, `suppress_window` annotation, per-status default.
    fn effective_window_seconds(&self, alert: &Alert) -> u64 {
        if let Some(window) = alert.suppress_window {
            return window.as_secs();
        }

        if let Some(raw) = alert.annotations.get(SUPPRESS_WINDOW_ANNOTATION) {
            if let Some(parsed) = parse_duration_str(raw) {
                return parsed.as_secs();
            }
            // unparseable annotation falls through to the default
        }

        let behavior = match alert.status {
            AlertStatus::Create => &self.defaults.create_noc_behavior,
            AlertStatus::Cancel => &self.defaults.cancel_noc_behavior,
        };
        behavior
            .suppress_window_duration()
            .map_or(0, |d| d.as_secs())
    }

    /// Whether this (fingerprint, status) is inside a suppression window.
    #[must_use]
    pub fn was_recently_processed(&self, alert: &Alert, current_tick: u64) -> bool {
        if self.effective_window_seconds(alert) == 0 {
            return false;
        }
        self.entries.get(&Self::key(alert)).is_some_and(|entry| {
            current_tick.saturating_sub(entry.processed_at_tick) < entry.window_ticks
        })
    }

    /// Record a processed alert. A zero window records nothing.
    pub fn mark_as_processed(&self, alert: &Alert, current_tick: u64) {
        let window_seconds = self.effective_window_seconds(alert);
        if window_seconds == 0 {
            return;
        }
        let window_ticks = (window_seconds / TICK_INTERVAL_SECONDS).max(1);
        debug!(
            fingerprint = %alert.fingerprint,
            status = %alert.status,
            window_ticks,
            "Marked as processed"
        );
        self.entries.insert(
            Self::key(alert),
            SuppressionEntry {
                processed_at_tick: current_tick,
                window_ticks,
            },
        );
    }

    /// Drop the single (fingerprint, status) entry, re-arming the snapshot.
    pub fn unmark_as_processed(&self, alert: &Alert) {
        self.entries.remove(&Self::key(alert));
    }

    /// Drop both CREATE and CANCEL entries for a fingerprint.
    pub fn clear_fingerprint(&self, fingerprint: &str) {
        self.entries
            .remove(&format!("{fingerprint}:{}", AlertStatus::Create));
        self.entries
            .remove(&format!("{fingerprint}:{}", AlertStatus::Cancel));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
