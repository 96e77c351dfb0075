//! Alertmanager push ingestion.
//!
//! The ingress handler hands the Alertmanager v2 alert array to this source.
//! Only alerts labelled `platform=argus` are ours; the rest of the cluster's
//! fan-out is counted and dropped. Firing alerts named like the watchdog
//! feed only the watchdog heartbeat, never the vector directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::alerts::{Alert, AlertStatus, AlertsVector};
use crate::config::DefaultNocConfig;
use crate::watchdog::Watchdog;

/// Label every Argus-owned alert must carry.
pub const PLATFORM_LABEL: &str = "platform";
pub const PLATFORM_VALUE: &str = "argus";

/// Alertmanager v2 alert as POSTed to `/api/v2/alerts`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiV2Alert {
    /// "firing" or "resolved"
    pub status: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fingerprint: String,
}

impl ApiV2Alert {
    /// Alert name from the `alertname` label.
    #[must_use]
    pub fn name(&self) -> &str {
        self.labels
            .get("alertname")
            .map_or("unknown", String::as_str)
    }

    #[must_use]
    pub fn platform(&self) -> Option<&str> {
        self.labels.get(PLATFORM_LABEL).map(String::as_str)
    }

    #[must_use]
    pub fn is_firing(&self) -> bool {
        self.status == "firing"
    }

    #[must_use]
    pub fn summary(&self) -> &str {
        self.annotations.get("summary").map_or("", String::as_str)
    }

    #[must_use]
    pub fn description(&self) -> &str {
        self.annotations
            .get("description")
            .map_or("", String::as_str)
    }

    /// Priority label; pushed alerts never go below 0.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.labels
            .get("priority")
            .and_then(|p| p.parse::<i32>().ok())
            .unwrap_or(0)
            .max(0)
    }
}

/// Ingestion counters for the status readers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestCounters {
    pub ingested_total: u64,
    pub filtered_total: u64,
    pub watchdog_heartbeats_total: u64,
}

/// Event-driven source fed by the HTTP ingress.
pub struct PrometheusSource {
    vector: Arc<AlertsVector>,
    watchdog: Arc<Watchdog>,
    defaults: DefaultNocConfig,
    watchdog_alert_name: String,
    ingested_count: AtomicU64,
    filtered_count: AtomicU64,
    watchdog_count: AtomicU64,
}

impl PrometheusSource {
    #[must_use]
    pub fn new(
        vector: Arc<AlertsVector>,
        watchdog: Arc<Watchdog>,
        defaults: DefaultNocConfig,
        watchdog_alert_name: String,
    ) -> Self {
        Self {
            vector,
            watchdog,
            defaults,
            watchdog_alert_name,
            ingested_count: AtomicU64::new(0),
            filtered_count: AtomicU64::new(0),
            watchdog_count: AtomicU64::new(0),
        }
    }

    /// Ingest one pushed batch.
    pub async fn ingest(&self, alerts: Vec<ApiV2Alert>) {
        for alert in alerts {
            if alert.platform() != Some(PLATFORM_VALUE) {
                self.filtered_count.fetch_add(1, Ordering::Relaxed);
                debug!(
                    name = %alert.name(),
                    platform = alert.platform().unwrap_or("<none>"),
                    "Filtered foreign alert"
                );
                continue;
            }

            if alert.status != "firing" && alert.status != "resolved" {
                warn!(
                    name = %alert.name(),
                    status = %alert.status,
                    "Rejecting alert with unknown status"
                );
                continue;
            }

            if alert.name() == self.watchdog_alert_name {
                if alert.is_firing() {
                    self.watchdog_count.fetch_add(1, Ordering::Relaxed);
                    self.watchdog.record_heartbeat().await;
                }
                continue;
            }

            self.ingested_count.fetch_add(1, Ordering::Relaxed);
            let converted = self.convert(alert);
            self.vector.update_alert(converted).await;
        }
    }

    /// Map the DTO onto the internal alert record with a fresh execution id.
    fn convert(&self, alert: ApiV2Alert) -> Alert {
        let status = if alert.is_firing() {
            AlertStatus::Create
        } else {
            AlertStatus::Cancel
        };
        let behavior = match status {
            AlertStatus::Create => &self.defaults.create_noc_behavior,
            AlertStatus::Cancel => &self.defaults.cancel_noc_behavior,
        };
        let execution_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let source = alert
            .labels
            .get("source")
            .cloned()
            .unwrap_or_else(|| "prometheus".to_string());
        let severity = alert.labels.get("severity").cloned().unwrap_or_default();

        let mut converted = Alert::new(
            alert.fingerprint.clone(),
            alert.priority(),
            alert.name(),
            source,
            status,
        )
        .with_summary(alert.summary())
        .with_description(alert.description())
        .with_send_to_noc(behavior.send_to_noc)
        .with_execution_id(execution_id)
        .with_annotations(alert.annotations);
        if let Some(starts_at) = alert.starts_at {
            converted.timestamp = starts_at;
        }
        converted.payload.severity = severity;
        converted
    }

    #[must_use]
    pub fn counters(&self) -> IngestCounters {
        IngestCounters {
            ingested_total: self.ingested_count.load(Ordering::Relaxed),
            filtered_total: self.filtered_count.load(Ordering::Relaxed),
            watchdog_heartbeats_total: self.watchdog_count.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchdogConfig;
    use crate::liveness::LivenessVector;
    use crate::suppression::SuppressionCache;
    use crate::timer::CentralTimer;

    fn push_alert(name: &str, platform: Option<&str>, status: &str, fingerprint: &str) -> ApiV2Alert {
        let mut labels = HashMap::from([("alertname".to_string(), name.to_string())]);
        if let Some(platform) = platform {
            labels.insert(PLATFORM_LABEL.to_string(), platform.to_string());
        }
        ApiV2Alert {
            status: status.to_string(),
            labels,
            annotations: HashMap::new(),
            starts_at: Some(Utc::now()),
            ends_at: None,
            fingerprint: fingerprint.to_string(),
        }
    }

    fn source() -> (PrometheusSource, Arc<AlertsVector>, Arc<Watchdog>) {
        let timer = Arc::new(CentralTimer::new(30, 1.0));
        let suppression = Arc::new(SuppressionCache::new(DefaultNocConfig::default()));
        let vector = Arc::new(AlertsVector::new(
            Arc::clone(&timer),
            suppression,
            3600,
        ));
        let watchdog = Arc::new(Watchdog::new(
            Arc::clone(&timer),
            Arc::clone(&vector),
            Arc::new(LivenessVector::new()),
            WatchdogConfig::default(),
        ));
        (
            PrometheusSource::new(
                Arc::clone(&vector),
                Arc::clone(&watchdog),
                DefaultNocConfig::default(),
                "Watchdog".to_string(),
            ),
            vector,
            watchdog,
        )
    }

    #[tokio::test]
    async fn test_foreign_platform_filtered() {
        let (source, vector, _) = source();
        source
            .ingest(vec![
                push_alert("SomeAlert", None, "firing", "fp-1"),
                push_alert("OtherAlert", Some("other-team"), "firing", "fp-2"),
            ])
            .await;

        assert!(vector.is_empty().await);
        assert_eq!(source.counters().filtered_total, 2);
        assert_eq!(source.counters().ingested_total, 0);
    }

    #[tokio::test]
    async fn test_argus_alert_ingested() {
        let (source, vector, _) = source();
        let mut alert = push_alert("HighLatency", Some(PLATFORM_VALUE), "firing", "fp-1");
        alert
            .annotations
            .insert("summary".to_string(), "latency high".to_string());
        alert
            .labels
            .insert("priority".to_string(), "5".to_string());

        source.ingest(vec![alert]).await;

        let stored = vector.get("fp-1").await.unwrap();
        assert_eq!(stored.status, AlertStatus::Create);
        assert_eq!(stored.priority, 5);
        assert_eq!(stored.summary, "latency high");
        assert!(!stored.execution_id.is_empty());
        assert_eq!(source.counters().ingested_total, 1);
    }

    #[tokio::test]
    async fn test_negative_priority_clamped() {
        let (source, vector, _) = source();
        let mut alert = push_alert("Sneaky", Some(PLATFORM_VALUE), "firing", "fp-1");
        alert
            .labels
            .insert("priority".to_string(), "-5".to_string());

        source.ingest(vec![alert]).await;
        assert_eq!(vector.get("fp-1").await.unwrap().priority, 0);
    }

    #[tokio::test]
    async fn test_resolved_maps_to_cancel() {
        let (source, vector, _) = source();
        source
            .ingest(vec![push_alert(
                "HighLatency",
                Some(PLATFORM_VALUE),
                "firing",
                "fp-1",
            )])
            .await;
        source
            .ingest(vec![push_alert(
                "HighLatency",
                Some(PLATFORM_VALUE),
                "resolved",
                "fp-1",
            )])
            .await;

        assert_eq!(vector.get("fp-1").await.unwrap().status, AlertStatus::Cancel);
    }

    #[tokio::test]
    async fn test_watchdog_feeds_heartbeat_not_vector() {
        let (source, vector, watchdog) = source();
        source
            .ingest(vec![push_alert(
                "Watchdog",
                Some(PLATFORM_VALUE),
                "firing",
                "wd-fp",
            )])
            .await;

        assert!(vector.is_empty().await);
        assert_eq!(source.counters().watchdog_heartbeats_total, 1);
        assert!(watchdog.snapshot().await.last_heartbeat_tick.is_some());
    }

    #[tokio::test]
    async fn test_resolved_watchdog_ignored() {
        let (source, vector, watchdog) = source();
        source
            .ingest(vec![push_alert(
                "Watchdog",
                Some(PLATFORM_VALUE),
                "resolved",
                "wd-fp",
            )])
            .await;

        assert!(vector.is_empty().await);
        assert!(watchdog.snapshot().await.last_heartbeat_tick.is_none());
    }

    #[tokio::test]
    async fn test_per_alert_execution_ids_differ() {
        let (source, vector, _) = source();
        source
            .ingest(vec![
                push_alert("A", Some(PLATFORM_VALUE), "firing", "fp-a"),
                push_alert("B", Some(PLATFORM_VALUE), "firing", "fp-b"),
            ])
            .await;

        let a = vector.get("fp-a").await.unwrap();
        let b = vector.get("fp-b").await.unwrap();
        assert_ne!(a.execution_id, b.execution_id);
    }
}
