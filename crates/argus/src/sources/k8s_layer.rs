//! K8s layer source.
//!
//! Every polling cycle checks, in parallel, that the API server answers,
//! that the Prometheus pod is up, and that kube-state-metrics is up, and
//! emits one alert per check — CREATE or CANCEL, always, so the vector
//! reflects current state. All three alerts of a cycle share one execution
//! id.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::alerts::types::{PRIORITY_K8S_API, PRIORITY_KSM_POD, PRIORITY_PROMETHEUS_POD};
use crate::alerts::{Alert, AlertStatus, AlertsVector};
use crate::config::{DefaultNocConfig, K8sLayerConfig, RestartTrackingConfig};
use crate::liveness::LivenessVector;
use crate::timer::TickContext;

/// Liveness name of the polling callback.
pub const CALLBACK_NAME: &str = "k8s-layer";

pub const FP_API: &str = "k8s-layer-api";
pub const FP_PROMETHEUS: &str = "k8s-layer-prometheus";
pub const FP_KSM: &str = "k8s-layer-ksm";

/// One probe result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub detail: String,
}

impl ProbeOutcome {
    #[must_use]
    pub fn healthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: true,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: detail.into(),
        }
    }
}

/// Result of the latest polling cycle, served by `/api/k8s/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sLayerStatus {
    pub api: ProbeOutcome,
    pub prometheus: ProbeOutcome,
    pub ksm: ProbeOutcome,
    pub checked_at: DateTime<Utc>,
    pub execution_id: String,
}

/// The three checks behind a seam; the polling loop is the interesting part.
#[async_trait]
pub trait K8sProbes: Send + Sync {
    async fn api_reachable(&self) -> ProbeOutcome;
    async fn prometheus_healthy(&self) -> ProbeOutcome;
    async fn ksm_healthy(&self) -> ProbeOutcome;
}

/// Sliding window over observed restart totals. The pod counts as restarting
/// when the delta across the window reaches the threshold.
struct RestartWindow {
    samples: Mutex<VecDeque<u32>>,
    cfg: RestartTrackingConfig,
}

impl RestartWindow {
    fn new(cfg: RestartTrackingConfig) -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            cfg,
        }
    }

    /// Record a total and report whether the windowed delta is excessive.
    fn observe(&self, total_restarts: u32) -> bool {
        let mut samples = self
            .samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        samples.push_back(total_restarts);
        while samples.len() > self.cfg.window_size.max(1) {
            samples.pop_front();
        }
        let min = samples.iter().min().copied().unwrap_or(0);
        let max = samples.iter().max().copied().unwrap_or(0);
        max.saturating_sub(min) >= self.cfg.restart_threshold
    }
}

/// kube-backed probes.
pub struct KubeProbes {
    client: Client,
    cfg: K8sLayerConfig,
    prometheus_restarts: RestartWindow,
    ksm_restarts: RestartWindow,
}

impl KubeProbes {
    #[must_use]
    pub fn new(client: Client, cfg: K8sLayerConfig) -> Self {
        let tracking = cfg.restart_tracking.clone();
        Self {
            client,
            cfg,
            prometheus_restarts: RestartWindow::new(tracking.clone()),
            ksm_restarts: RestartWindow::new(tracking),
        }
    }

    /// A selector is healthy when at least one matching pod is Running and
    /// Ready, and the restart window stays below the threshold.
    async fn pods_healthy(&self, selector: &str, window: &RestartWindow) -> ProbeOutcome {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.cfg.namespace);
        let list = match pods
            .list(&ListParams::default().labels(selector))
            .await
        {
            Ok(list) => list,
            Err(e) => {
                return ProbeOutcome::unhealthy(format!("pod list failed: {e}"));
            }
        };

        if list.items.is_empty() {
            return ProbeOutcome::unhealthy(format!("no pods match selector {selector}"));
        }

        let mut total_restarts: u32 = 0;
        let mut ready = false;
        for pod in &list.items {
            let status = pod.status.clone().unwrap_or_default();
            let running = status.phase.as_deref() == Some("Running");
            let pod_ready = status
                .conditions
                .unwrap_or_default()
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True");
            if running && pod_ready {
                ready = true;
            }
            for cs in status.container_statuses.unwrap_or_default() {
                total_restarts = total_restarts.saturating_add(cs.restart_count.unsigned_abs());
            }
        }

        let restarting = window.observe(total_restarts);
        if !ready {
            return ProbeOutcome::unhealthy(format!("no ready pod for selector {selector}"));
        }
        if restarting {
            return ProbeOutcome::unhealthy(format!(
                "pods for selector {selector} are restarting (total {total_restarts})"
            ));
        }
        ProbeOutcome::healthy(format!("ready, {total_restarts} restarts observed"))
    }
}

#[async_trait]
impl K8sProbes for KubeProbes {
    async fn api_reachable(&self) -> ProbeOutcome {
        match self.client.apiserver_version().await {
            Ok(info) => ProbeOutcome::healthy(format!("API {}.{}", info.major, info.minor)),
            Err(e) => ProbeOutcome::unhealthy(format!("API unreachable: {e}")),
        }
    }

    async fn prometheus_healthy(&self) -> ProbeOutcome {
        self.pods_healthy(&self.cfg.prometheus_pod_selector, &self.prometheus_restarts)
            .await
    }

    async fn ksm_healthy(&self) -> ProbeOutcome {
        self.pods_healthy(&self.cfg.ksm_pod_selector, &self.ksm_restarts)
            .await
    }
}

/// The polling callback.
pub struct K8sLayerSource {
    probes: Arc<dyn K8sProbes>,
    vector: Arc<AlertsVector>,
    liveness: Arc<LivenessVector>,
    defaults: DefaultNocConfig,
    last_status: RwLock<Option<K8sLayerStatus>>,
    interval_ticks: u64,
}

impl K8sLayerSource {
    #[must_use]
    pub fn new(
        probes: Arc<dyn K8sProbes>,
        vector: Arc<AlertsVector>,
        liveness: Arc<LivenessVector>,
        defaults: DefaultNocConfig,
        interval_ticks: u64,
    ) -> Self {
        Self {
            probes,
            vector,
            liveness,
            defaults,
            last_status: RwLock::new(None),
            interval_ticks: interval_ticks.max(1),
        }
    }

    /// Latest cycle outcome for the HTTP reader.
    pub async fn last_status(&self) -> Option<K8sLayerStatus> {
        self.last_status.read().await.clone()
    }

    fn alert_for(
        &self,
        fingerprint: &str,
        priority: i32,
        name: &str,
        outcome: &ProbeOutcome,
        execution_id: &str,
    ) -> Alert {
        let status = if outcome.healthy {
            AlertStatus::Cancel
        } else {
            AlertStatus::Create
        };
        let behavior = match status {
            AlertStatus::Create => &self.defaults.create_noc_behavior,
            AlertStatus::Cancel => &self.defaults.cancel_noc_behavior,
        };
        Alert::new(fingerprint, priority, name, "k8s-layer", status)
            .with_summary(outcome.detail.clone())
            .with_send_to_noc(behavior.send_to_noc)
            .with_execution_id(execution_id)
    }

    /// One polling cycle: all three probes in parallel, three upserts.
    ///
    /// # Errors
    /// Infallible; probe failures become CREATE alerts, not errors.
    pub async fn run_poll(&self, ctx: TickContext) -> Result<()> {
        let execution_id = uuid::Uuid::new_v4().to_string()[..8].to_string();

        let (api, prometheus, ksm) = tokio::join!(
            self.probes.api_reachable(),
            self.probes.prometheus_healthy(),
            self.probes.ksm_healthy(),
        );

        if !api.healthy || !prometheus.healthy || !ksm.healthy {
            warn!(
                api = api.healthy,
                prometheus = prometheus.healthy,
                ksm = ksm.healthy,
                execution_id = %execution_id,
                "K8s layer probe found unhealthy components"
            );
        } else {
            debug!(execution_id = %execution_id, "K8s layer probe healthy");
        }

        self.vector
            .update_alert(self.alert_for(FP_API, PRIORITY_K8S_API, "K8sApiUnreachable", &api, &execution_id))
            .await;
        self.vector
            .update_alert(self.alert_for(
                FP_PROMETHEUS,
                PRIORITY_PROMETHEUS_POD,
                "PrometheusPodUnhealthy",
                &prometheus,
                &execution_id,
            ))
            .await;
        self.vector
            .update_alert(self.alert_for(FP_KSM, PRIORITY_KSM_POD, "KsmPodUnhealthy", &ksm, &execution_id))
            .await;

        *self.last_status.write().await = Some(K8sLayerStatus {
            api,
            prometheus,
            ksm,
            checked_at: Utc::now(),
            execution_id,
        });

        self.liveness
            .record_execution(CALLBACK_NAME, self.interval_ticks, ctx.tick);
        Ok(())
    }
}
