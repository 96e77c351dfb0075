//! Argus Configuration
//!
//! One hierarchical YAML document with a single `argus` root section, mounted
//! into the pod (ConfigMap) and read once at startup. Unknown or missing
//! fields fall back to serde defaults so a partial file is always usable.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::suppression::parse_duration_str;

/// Root document: `argus:` wraps everything.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RootConfig {
    /// The one root section
    #[serde(default)]
    pub argus: ArgusConfig,
}

/// Main Argus configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgusConfig {
    /// K8s layer source configuration
    #[serde(default)]
    pub k8s_layer: K8sLayerConfig,

    /// Watchdog configuration
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Default NOC behaviors applied when an alert carries none
    #[serde(default)]
    pub default_noc: DefaultNocConfig,

    /// Alerts vector configuration
    #[serde(default)]
    pub alerts_vector: AlertsVectorConfig,

    /// NOC client configuration
    #[serde(default)]
    pub noc: NocConfig,

    /// Heartbeat service configuration
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Central timer / snapshot coordination
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Leader election configuration
    #[serde(default)]
    pub leader_election: LeaderElectionConfig,

    /// Status filesystem probe configuration
    #[serde(default)]
    pub status_file_system: StatusFileSystemConfig,

    /// HTTP ingress bind address
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ArgusConfig {
    fn default() -> Self {
        Self {
            k8s_layer: K8sLayerConfig::default(),
            watchdog: WatchdogConfig::default(),
            default_noc: DefaultNocConfig::default(),
            alerts_vector: AlertsVectorConfig::default(),
            noc: NocConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            coordinator: CoordinatorConfig::default(),
            leader_election: LeaderElectionConfig::default(),
            status_file_system: StatusFileSystemConfig::default(),
            listen_address: default_listen_address(),
        }
    }
}

/// K8s layer source: API, Prometheus pod, and KSM pod probes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sLayerConfig {
    /// Seconds between probe cycles
    #[serde(default = "default_k8s_polling")]
    pub polling_interval_seconds: u64,

    /// Namespace the Prometheus / KSM pods live in
    #[serde(default = "default_observability_namespace")]
    pub namespace: String,

    /// Label selector for the Prometheus server pod
    #[serde(default = "default_prometheus_selector")]
    pub prometheus_pod_selector: String,

    /// Label selector for the kube-state-metrics pod
    #[serde(default = "default_ksm_selector")]
    pub ksm_pod_selector: String,

    /// Pod restart tracking
    #[serde(default)]
    pub restart_tracking: RestartTrackingConfig,
}

impl Default for K8sLayerConfig {
    fn default() -> Self {
        Self {
            polling_interval_seconds: default_k8s_polling(),
            namespace: default_observability_namespace(),
            prometheus_pod_selector: default_prometheus_selector(),
            ksm_pod_selector: default_ksm_selector(),
            restart_tracking: RestartTrackingConfig::default(),
        }
    }
}

fn default_k8s_polling() -> u64 {
    30
}
fn default_observability_namespace() -> String {
    "observability".to_string()
}
fn default_prometheus_selector() -> String {
    "app.kubernetes.io/name=prometheus".to_string()
}
fn default_ksm_selector() -> String {
    "app.kubernetes.io/name=kube-state-metrics".to_string()
}

/// Sliding window over observed container restart counts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartTrackingConfig {
    /// Number of polling cycles retained
    #[serde(default = "default_restart_window")]
    pub window_size: usize,

    /// Restarts within the window that flip the pod unhealthy
    #[serde(default = "default_restart_threshold")]
    pub restart_threshold: u32,
}

impl Default for RestartTrackingConfig {
    fn default() -> Self {
        Self {
            window_size: default_restart_window(),
            restart_threshold: default_restart_threshold(),
        }
    }
}

fn default_restart_window() -> usize {
    10
}
fn default_restart_threshold() -> u32 {
    3
}

/// Watchdog heartbeat expiration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchdogConfig {
    /// Prometheus alert name that carries the heartbeat
    #[serde(default = "default_watchdog_alert_name")]
    pub alert_name: String,

    /// Seconds without a heartbeat before the watchdog is missing
    #[serde(default = "default_watchdog_timeout")]
    pub timeout_seconds: u64,

    /// NOC behavior for the CREATE (missing) side
    #[serde(default = "default_create_behavior")]
    pub create_noc_behavior: NocBehavior,

    /// NOC behavior for the CANCEL (healthy) side
    #[serde(default = "default_cancel_behavior")]
    pub cancel_noc_behavior: NocBehavior,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            alert_name: default_watchdog_alert_name(),
            timeout_seconds: default_watchdog_timeout(),
            create_noc_behavior: default_create_behavior(),
            cancel_noc_behavior: default_cancel_behavior(),
        }
    }
}

fn default_watchdog_alert_name() -> String {
    "Watchdog".to_string()
}
fn default_watchdog_timeout() -> u64 {
    60
}

/// How an alert of a given status is forwarded to the NOC.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NocBehavior {
    /// Whether the alert is sent at all
    #[serde(default = "default_true")]
    pub send_to_noc: bool,

    /// Suppression window as a duration string (`30s`, `5m`, `1h`, `1d`);
    /// empty means no suppression
    #[serde(default)]
    pub suppress_window: String,
}

impl NocBehavior {
    /// Resolve the suppress window string; unparseable values count as none.
    #[must_use]
    pub fn suppress_window_duration(&self) -> Option<Duration> {
        parse_duration_str(&self.suppress_window)
    }
}

fn default_true() -> bool {
    true
}

fn default_create_behavior() -> NocBehavior {
    NocBehavior {
        send_to_noc: true,
        suppress_window: "5m".to_string(),
    }
}

fn default_cancel_behavior() -> NocBehavior {
    NocBehavior {
        send_to_noc: true,
        suppress_window: "1m".to_string(),
    }
}

/// Fallback NOC behaviors used when an alert carries no explicit window.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultNocConfig {
    #[serde(default = "default_create_behavior")]
    pub create_noc_behavior: NocBehavior,

    #[serde(default = "default_cancel_behavior")]
    pub cancel_noc_behavior: NocBehavior,
}

impl Default for DefaultNocConfig {
    fn default() -> Self {
        Self {
            create_noc_behavior: default_create_behavior(),
            cancel_noc_behavior: default_cancel_behavior(),
        }
    }
}

/// Alerts vector retention.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertsVectorConfig {
    /// TTL as a duration string; entries not refreshed within it are evicted
    #[serde(default = "default_alert_ttl")]
    pub alert_ttl: String,
}

impl Default for AlertsVectorConfig {
    fn default() -> Self {
        Self {
            alert_ttl: default_alert_ttl(),
        }
    }
}

impl AlertsVectorConfig {
    /// TTL in ticks (ticks are one second). Unparseable strings fall back
    /// to the default.
    #[must_use]
    pub fn ttl_ticks(&self) -> u64 {
        parse_duration_str(&self.alert_ttl)
            .filter(|d| !d.is_zero())
            .unwrap_or_else(|| {
                parse_duration_str(&default_alert_ttl()).unwrap_or(Duration::from_secs(3600))
            })
            .as_secs()
    }
}

fn default_alert_ttl() -> String {
    "1h".to_string()
}

/// NOC endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NocConfig {
    /// Master kill-switch for all NOC HTTP traffic
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub http_client: NocHttpClientConfig,
}

impl Default for NocConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            circuit_breaker: CircuitBreakerConfig::default(),
            http_client: NocHttpClientConfig::default(),
        }
    }
}

/// Consecutive-failure circuit breaker.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}

/// NOC HTTP transport.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NocHttpClientConfig {
    /// Phase-1 send endpoint
    #[serde(default)]
    pub send_endpoint: String,

    /// Phase-2 verify endpoint
    #[serde(default)]
    pub verify_endpoint: String,

    /// Per-request timeout
    #[serde(default = "default_noc_timeout")]
    pub timeout_seconds: u64,

    /// Accept invalid TLS certificates
    #[serde(default)]
    pub bypass_ssl_validation: bool,

    /// Optional address override bypassing DNS resolution
    #[serde(default)]
    pub connect_ip_address: Option<String>,

    #[serde(default)]
    pub connect_port: Option<u16>,

    /// HTTP basic auth; empty username disables auth
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Defaults for empty payload fields
    #[serde(default)]
    pub team_name: String,

    #[serde(default)]
    pub system_name: String,

    #[serde(default)]
    pub host_name: String,
}

fn default_noc_timeout() -> u64 {
    30
}

/// Heartbeat service: NOC heartbeat plus leader-only file heartbeat.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_seconds: u64,

    #[serde(default)]
    pub file: HeartbeatFileConfig,

    #[serde(default)]
    pub http: HeartbeatHttpConfig,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_heartbeat_interval(),
            file: HeartbeatFileConfig::default(),
            http: HeartbeatHttpConfig::default(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    30
}

/// On-disk liveness heartbeat consumed by an external monitor.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatFileConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Final path; writes go through `<path>.tmp` + rename
    #[serde(default = "default_heartbeat_path")]
    pub destination_path: String,
}

impl Default for HeartbeatFileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            destination_path: default_heartbeat_path(),
        }
    }
}

fn default_heartbeat_path() -> String {
    "/var/run/argus/heartbeat.json".to_string()
}

/// NOC heartbeat over the two-phase protocol.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatHttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for HeartbeatHttpConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Central timer coordination.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorConfig {
    /// Seconds between NOC snapshots
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_seconds: u64,

    /// Grace period = snapshot interval x this multiplier (floored at 1.0)
    #[serde(default = "default_grace_multiplier")]
    pub startup_grace_period_multiplier: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_seconds: default_snapshot_interval(),
            startup_grace_period_multiplier: default_grace_multiplier(),
        }
    }
}

fn default_snapshot_interval() -> u64 {
    30
}
fn default_grace_multiplier() -> f64 {
    2.0
}

/// Kubernetes lease leader election.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElectionConfig {
    #[serde(default = "default_lease_name")]
    pub lease_name: String,

    /// Namespace holding the lease; defaults to the pod namespace mount
    #[serde(default = "default_lease_namespace")]
    pub lease_namespace: String,

    #[serde(default = "default_lease_duration")]
    pub lease_duration_seconds: u64,

    /// Must stay below the lease duration
    #[serde(default = "default_renew_interval")]
    pub renew_interval_seconds: u64,

    #[serde(default = "default_retry_interval")]
    pub retry_interval_seconds: u64,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lease_name: default_lease_name(),
            lease_namespace: default_lease_namespace(),
            lease_duration_seconds: default_lease_duration(),
            renew_interval_seconds: default_renew_interval(),
            retry_interval_seconds: default_retry_interval(),
        }
    }
}

fn default_lease_name() -> String {
    "argus-leader".to_string()
}
fn default_lease_namespace() -> String {
    "default".to_string()
}
fn default_lease_duration() -> u64 {
    30
}
fn default_renew_interval() -> u64 {
    10
}
fn default_retry_interval() -> u64 {
    5
}

/// Heartbeat destination directory probe.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusFileSystemConfig {
    #[serde(default = "default_fs_polling")]
    pub polling_interval_seconds: u64,
}

impl Default for StatusFileSystemConfig {
    fn default() -> Self {
        Self {
            polling_interval_seconds: default_fs_polling(),
        }
    }
}

fn default_fs_polling() -> u64 {
    60
}

impl ArgusConfig {
    /// Load configuration from a mounted YAML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", config_path, e))?;

        let root: RootConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {}", e))?;

        root.argus.validate();
        Ok(root.argus)
    }

    /// Load from `ARGUS_CONFIG_PATH` (default `/config/config.yaml`),
    /// falling back to defaults with a warning when the file is unusable.
    #[must_use]
    pub fn load() -> Self {
        let override_path = std::env::var("ARGUS_CONFIG_PATH").ok();
        let config_path = override_path
            .as_deref()
            .filter(|path| Path::new(path).exists())
            .unwrap_or("/config/config.yaml");

        match Self::from_mounted_file(config_path) {
            Ok(cfg) => {
                info!("Loaded configuration from {}", config_path);
                cfg
            }
            Err(err) => {
                warn!(
                    "Failed to load configuration from {}: {}. Using defaults.",
                    config_path, err
                );
                let cfg = Self::default();
                cfg.validate();
                cfg
            }
        }
    }

    /// Sanity-check cross-field invariants, warning rather than failing.
    fn validate(&self) {
        if self.leader_election.renew_interval_seconds >= self.leader_election.lease_duration_seconds
        {
            warn!(
                renew = self.leader_election.renew_interval_seconds,
                lease = self.leader_election.lease_duration_seconds,
                "leaderElection.renewIntervalSeconds should be below leaseDurationSeconds"
            );
        }
        if self.noc.enabled && self.noc.http_client.send_endpoint.is_empty() {
            warn!("NOC is enabled but httpClient.sendEndpoint is empty");
        }
    }

    /// Behavior bundle for a status from the `defaultNoc` section.
    #[must_use]
    pub fn default_behavior(&self, status: crate::alerts::AlertStatus) -> &NocBehavior {
        match status {
            crate::alerts::AlertStatus::Create => &self.default_noc.create_noc_behavior,
            crate::alerts::AlertStatus::Cancel => &self.default_noc.cancel_noc_behavior,
        }
    }
}
