//! Alerts Vector
//!
//! The serialization point for alert state: a fingerprint-keyed map behind
//! one lock. Sources upsert into it, the snapshot reads it priority-ordered,
//! and the dispatcher removes entries after a successful CANCEL round-trip.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::suppression::SuppressionCache;
use crate::timer::CentralTimer;

use super::{Alert, AlertStatus};

/// Lifecycle counters for the status readers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorCounters {
    pub active: usize,
    pub created_total: u64,
    pub resolved_total: u64,
    pub expired_total: u64,
}

/// Priority-ordered mapping of fingerprint to alert.
pub struct AlertsVector {
    entries: RwLock<HashMap<String, Alert>>,
    timer: Arc<CentralTimer>,
    suppression: Arc<SuppressionCache>,
    ttl_ticks: u64,
    created_count: AtomicU64,
    resolved_count: AtomicU64,
    expired_count: AtomicU64,
}

impl AlertsVector {
    #[must_use]
    pub fn new(timer: Arc<CentralTimer>, suppression: Arc<SuppressionCache>, ttl_ticks: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            timer,
            suppression,
            ttl_ticks,
            created_count: AtomicU64::new(0),
            resolved_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    /// Upsert an alert.
    ///
    /// A CANCEL can never introduce an entry: cancelling something the vector
    /// does not hold is a no-op. Every accepted mutation stamps `lastSeen`
    /// from the central timer.
    pub async fn update_alert(&self, mut alert: Alert) {
        if alert.fingerprint.is_empty() {
            warn!(name = %alert.name, "Rejecting alert with empty fingerprint");
            return;
        }

        alert.last_seen_tick = self.timer.current_tick();
        alert.last_seen_timestamp = self.timer.heartbeat_timestamp();

        let mut entries = self.entries.write().await;
        let previous_status = entries.get(&alert.fingerprint).map(|c| c.status);

        match previous_status {
            None => {
                if alert.status == AlertStatus::Cancel {
                    debug!(
                        fingerprint = %alert.fingerprint,
                        "CANCEL for unknown fingerprint, ignoring"
                    );
                    return;
                }
                info!(
                    fingerprint = %alert.fingerprint,
                    name = %alert.name,
                    priority = alert.priority,
                    execution_id = %alert.execution_id,
                    "Alert created"
                );
                self.created_count.fetch_add(1, Ordering::Relaxed);
                entries.insert(alert.fingerprint.clone(), alert);
            }
            Some(AlertStatus::Cancel) if alert.status == AlertStatus::Cancel => {
                // refresh only; a repeated CANCEL is not news
                if let Some(current) = entries.get_mut(&alert.fingerprint) {
                    current.last_seen_tick = alert.last_seen_tick;
                    current.last_seen_timestamp = alert.last_seen_timestamp;
                }
            }
            Some(previous) => {
                match (previous, alert.status) {
                    (AlertStatus::Cancel, AlertStatus::Create) => {
                        info!(
                            fingerprint = %alert.fingerprint,
                            name = %alert.name,
                            previous_status = %previous,
                            execution_id = %alert.execution_id,
                            "Alert created"
                        );
                        self.created_count.fetch_add(1, Ordering::Relaxed);
                    }
                    (AlertStatus::Create, AlertStatus::Cancel) => {
                        info!(
                            fingerprint = %alert.fingerprint,
                            name = %alert.name,
                            execution_id = %alert.execution_id,
                            "Alert resolved"
                        );
                    }
                    _ => {
                        debug!(
                            fingerprint = %alert.fingerprint,
                            status = %alert.status,
                            "Alert refreshed"
                        );
                    }
                }
                entries.insert(alert.fingerprint.clone(), alert);
            }
        }
    }

    /// Remove an alert and its suppression entries. Returns whether an entry
    /// was actually removed.
    pub async fn remove_alert(&self, fingerprint: &str) -> bool {
        let removed = self.entries.write().await.remove(fingerprint).is_some();
        if removed {
            self.suppression.clear_fingerprint(fingerprint);
            self.resolved_count.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint = %fingerprint, "Alert removed from vector");
        }
        removed
    }

    /// Current alert by fingerprint, if held.
    pub async fn get(&self, fingerprint: &str) -> Option<Alert> {
        self.entries.read().await.get(fingerprint).cloned()
    }

    /// Materialized copy ordered by priority ascending, then timestamp
    /// ascending. This ordering is the authoritative priority downstream.
    pub async fn get_snapshot(&self) -> Vec<Alert> {
        let entries = self.entries.read().await;
        let mut snapshot: Vec<Alert> = entries.values().cloned().collect();
        snapshot.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        });
        snapshot
    }

    /// Evict entries not refreshed within the TTL, clearing their
    /// suppression state.
    pub async fn cleanup_expired(&self, current_tick: u64) {
        let mut entries = self.entries.write().await;
        let expired: Vec<String> = entries
            .values()
            .filter(|a| current_tick.saturating_sub(a.last_seen_tick) > self.ttl_ticks)
            .map(|a| a.fingerprint.clone())
            .collect();

        for fingerprint in expired {
            if let Some(alert) = entries.remove(&fingerprint) {
                warn!(
                    fingerprint = %fingerprint,
                    name = %alert.name,
                    last_seen_tick = alert.last_seen_tick,
                    current_tick,
                    "Alert expired from vector"
                );
                self.suppression.clear_fingerprint(&fingerprint);
                self.expired_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Empty the map. Test surface.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn counters(&self) -> VectorCounters {
        VectorCounters {
            active: self.len().await,
            created_total: self.created_count.load(Ordering::Relaxed),
            resolved_total: self.resolved_count.load(Ordering::Relaxed),
            expired_total: self.expired_count.load(Ordering::Relaxed),
        }
    }
}
