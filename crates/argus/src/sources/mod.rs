//! Alert sources: the K8s layer probes, the Alertmanager push path, and the
//! heartbeat-directory filesystem probe.

pub mod k8s_layer;
pub mod prometheus;
pub mod status_fs;

pub use k8s_layer::{K8sLayerSource, K8sLayerStatus, K8sProbes, KubeProbes, ProbeOutcome};
pub use prometheus::{ApiV2Alert, PrometheusSource};
pub use status_fs::StatusFileSystemSource;
