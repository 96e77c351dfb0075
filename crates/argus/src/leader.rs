//! Leader election over a Kubernetes coordination/v1 Lease.
//!
//! Every replica runs the same election callback; exactly one holds the
//! lease at a time. All replicas compute the same decisions, but only the
//! leader performs the mutating NOC send and writes the heartbeat file.
//! Leadership changes are published edge-triggered through a watch channel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, PostParams};
use kube::core::ObjectMeta;
use kube::{Client, Error as KubeError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::LeaderElectionConfig;
use crate::liveness::LivenessVector;
use crate::timer::TickContext;

/// Liveness name of the election callback.
pub const CALLBACK_NAME: &str = "leader-election";

/// Errors from the lease API, reduced to what the state machine reacts to.
#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("lease conflict")]
    Conflict,

    #[error("lease not found")]
    NotFound,

    #[error("Kubernetes API error: {0}")]
    Api(String),
}

impl From<KubeError> for LeaseError {
    fn from(e: KubeError) -> Self {
        match &e {
            KubeError::Api(response) if response.code == 409 => Self::Conflict,
            KubeError::Api(response) if response.code == 404 => Self::NotFound,
            _ => Self::Api(e.to_string()),
        }
    }
}

/// The lease fields the election reads and writes.
#[derive(Debug, Clone, Default)]
pub struct LeaseRecord {
    pub holder_identity: Option<String>,
    pub lease_duration_seconds: Option<i32>,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
}

/// Seam over the Kubernetes lease API so the state machine is testable.
#[async_trait]
pub trait LeaseClient: Send + Sync {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaseError>;
    async fn create(&self, record: &LeaseRecord) -> Result<(), LeaseError>;
    async fn update(&self, record: &LeaseRecord) -> Result<(), LeaseError>;
}

/// kube-backed lease client.
pub struct KubeLeaseClient {
    api: Api<Lease>,
    name: String,
}

impl KubeLeaseClient {
    #[must_use]
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }

    fn spec_from_record(record: &LeaseRecord) -> LeaseSpec {
        LeaseSpec {
            holder_identity: record.holder_identity.clone(),
            lease_duration_seconds: record.lease_duration_seconds,
            acquire_time: record.acquire_time.map(MicroTime),
            renew_time: record.renew_time.map(MicroTime),
            ..Default::default()
        }
    }

    fn record_from_lease(lease: &Lease) -> LeaseRecord {
        let spec = lease.spec.clone().unwrap_or_default();
        LeaseRecord {
            holder_identity: spec.holder_identity,
            lease_duration_seconds: spec.lease_duration_seconds,
            acquire_time: spec.acquire_time.map(|t| t.0),
            renew_time: spec.renew_time.map(|t| t.0),
        }
    }
}

#[async_trait]
impl LeaseClient for KubeLeaseClient {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaseError> {
        let lease = self.api.get_opt(&self.name).await.map_err(LeaseError::from)?;
        Ok(lease.as_ref().map(Self::record_from_lease))
    }

    async fn create(&self, record: &LeaseRecord) -> Result<(), LeaseError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                ..Default::default()
            },
            spec: Some(Self::spec_from_record(record)),
        };
        self.api
            .create(&PostParams::default(), &lease)
            .await
            .map_err(LeaseError::from)?;
        Ok(())
    }

    async fn update(&self, record: &LeaseRecord) -> Result<(), LeaseError> {
        // read-modify-write keeps the resourceVersion so a concurrent writer
        // surfaces as a 409
        let Some(mut lease) = self.api.get_opt(&self.name).await.map_err(LeaseError::from)?
        else {
            return Err(LeaseError::NotFound);
        };
        lease.spec = Some(Self::spec_from_record(record));
        self.api
            .replace(&self.name, &PostParams::default(), &lease)
            .await
            .map_err(LeaseError::from)?;
        Ok(())
    }
}

/// Leadership state for the status readers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadershipStatus {
    pub is_leader: bool,
    pub pod_identity: String,
    pub current_leader: Option<String>,
}

/// The per-replica election state machine.
pub struct LeaderElection {
    client: Arc<dyn LeaseClient>,
    cfg: LeaderElectionConfig,
    identity: String,
    is_leader: AtomicBool,
    current_leader: RwLock<Option<String>>,
    leadership_tx: watch::Sender<bool>,
    transitions: AtomicU64,
    liveness: Arc<LivenessVector>,
    interval_ticks: u64,
}

impl LeaderElection {
    /// Returns the election and the receiver side of the leadership channel.
    #[must_use]
    pub fn new(
        client: Arc<dyn LeaseClient>,
        cfg: LeaderElectionConfig,
        identity: String,
        liveness: Arc<LivenessVector>,
    ) -> (Arc<Self>, watch::Receiver<bool>) {
        let (leadership_tx, leadership_rx) = watch::channel(false);
        let interval_ticks = cfg.renew_interval_seconds.max(1);
        (
            Arc::new(Self {
                client,
                cfg,
                identity,
                is_leader: AtomicBool::new(false),
                current_leader: RwLock::new(None),
                leadership_tx,
                transitions: AtomicU64::new(0),
                liveness,
                interval_ticks,
            }),
            leadership_rx,
        )
    }

    /// Holder identity for this replica: `POD_NAME` when set, else a fresh
    /// random identifier.
    #[must_use]
    pub fn pod_identity() -> String {
        std::env::var("POD_NAME").unwrap_or_else(|_| {
            let suffix = uuid::Uuid::new_v4().to_string()[..8].to_string();
            format!("argus-{suffix}")
        })
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn status(&self) -> LeadershipStatus {
        LeadershipStatus {
            is_leader: self.is_leader(),
            pod_identity: self.identity.clone(),
            current_leader: self
                .current_leader
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone(),
        }
    }

    /// Total leadership flips, one per actual change of role.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transitions.load(Ordering::SeqCst)
    }

    /// One election step: renew when leading, otherwise try to acquire.
    ///
    /// # Errors
    /// Infallible; lease API failures are absorbed into the state machine.
    pub async fn run_election(&self, ctx: TickContext) -> anyhow::Result<()> {
        if self.is_leader() {
            self.renew().await;
        } else {
            self.try_acquire().await;
        }
        self.liveness
            .record_execution(CALLBACK_NAME, self.interval_ticks, ctx.tick);
        Ok(())
    }

    /// Demote without publishing noise. Called on shutdown; the lease is
    /// left to expire on its own.
    pub fn shutdown(&self) {
        if self.is_leader.swap(false, Ordering::SeqCst) {
            debug!(identity = %self.identity, "Demoting on shutdown");
            self.leadership_tx.send(false).ok();
        }
    }

    async fn renew(&self) {
        match self.client.get().await {
            Ok(Some(lease)) => {
                if lease.holder_identity.as_deref() != Some(self.identity.as_str()) {
                    warn!(
                        holder = lease.holder_identity.as_deref().unwrap_or("unknown"),
                        "Lease taken over by another replica"
                    );
                    self.transition(false, lease.holder_identity);
                    return;
                }

                let record = LeaseRecord {
                    holder_identity: Some(self.identity.clone()),
                    lease_duration_seconds: Some(self.lease_duration_i32()),
                    acquire_time: lease.acquire_time,
                    renew_time: Some(Utc::now()),
                };
                match self.client.update(&record).await {
                    Ok(()) => {
                        debug!(identity = %self.identity, "Lease renewed");
                    }
                    Err(LeaseError::Conflict | LeaseError::NotFound) => {
                        warn!("Lease renewal rejected, demoting");
                        self.transition(false, None);
                    }
                    Err(e) => {
                        warn!(error = %e, "Lease renewal failed, keeping state");
                    }
                }
            }
            Ok(None) | Err(LeaseError::NotFound | LeaseError::Conflict) => {
                warn!("Lease gone during renewal, demoting");
                self.transition(false, None);
            }
            Err(e) => {
                warn!(error = %e, "Lease read failed during renewal, keeping state");
            }
        }
    }

    async fn try_acquire(&self) {
        match self.client.get().await {
            Ok(None) | Err(LeaseError::NotFound) => {
                let now = Utc::now();
                let record = LeaseRecord {
                    holder_identity: Some(self.identity.clone()),
                    lease_duration_seconds: Some(self.lease_duration_i32()),
                    acquire_time: Some(now),
                    renew_time: Some(now),
                };
                match self.client.create(&record).await {
                    Ok(()) => {
                        self.transition(true, Some(self.identity.clone()));
                    }
                    Err(LeaseError::Conflict) => {
                        // lost the creation race; remember who won
                        if let Ok(Some(lease)) = self.client.get().await {
                            self.remember_holder(lease.holder_identity);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Lease creation failed");
                    }
                }
            }
            Ok(Some(lease)) => {
                let ours = lease.holder_identity.as_deref() == Some(self.identity.as_str());
                if self.lease_expired(&lease) || ours {
                    let now = Utc::now();
                    let record = LeaseRecord {
                        holder_identity: Some(self.identity.clone()),
                        lease_duration_seconds: Some(self.lease_duration_i32()),
                        acquire_time: lease.acquire_time.or(Some(now)),
                        renew_time: Some(now),
                    };
                    match self.client.update(&record).await {
                        Ok(()) => {
                            self.transition(true, Some(self.identity.clone()));
                        }
                        Err(LeaseError::Conflict) => {
                            debug!("Lost lease claim race, remaining follower");
                        }
                        Err(LeaseError::NotFound) => {
                            // vanished between read and write; next tick creates
                        }
                        Err(e) => {
                            warn!(error = %e, "Lease claim failed");
                        }
                    }
                } else {
                    self.remember_holder(lease.holder_identity);
                }
            }
            Err(e) => {
                warn!(error = %e, "Lease read failed during acquisition");
            }
        }
    }

    fn lease_expired(&self, lease: &LeaseRecord) -> bool {
        let Some(renew_time) = lease.renew_time else {
            return true;
        };
        let duration = i64::from(
            lease
                .lease_duration_seconds
                .unwrap_or(self.lease_duration_i32()),
        );
        (Utc::now() - renew_time).num_seconds() > duration
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn lease_duration_i32(&self) -> i32 {
        self.cfg.lease_duration_seconds.min(i64::from(i32::MAX) as u64) as i32
    }

    /// Apply a role change, publishing only on an actual flip.
    fn transition(&self, to_leader: bool, holder: Option<String>) {
        let was_leader = self.is_leader.swap(to_leader, Ordering::SeqCst);
        *self
            .current_leader
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = holder;

        if was_leader != to_leader {
            self.transitions.fetch_add(1, Ordering::SeqCst);
            info!(
                identity = %self.identity,
                is_leader = to_leader,
                "Leadership changed"
            );
            self.leadership_tx.send(to_leader).ok();
        }
    }

    fn remember_holder(&self, holder: Option<String>) {
        *self
            .current_leader
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = holder;
    }
}
