//! Heartbeat service.
//!
//! Both roles send the NOC heartbeat through the same two-phase protocol as
//! alerts; only the leader writes the on-disk heartbeat file an external
//! monitor watches. When the liveness vector degrades or the NOC circuit
//! breaker trips, one last FINAL DIAGNOSTIC file is written and file output
//! stops until the condition clears, so a stale file is itself the signal.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{HeartbeatConfig, NocHttpClientConfig};
use crate::liveness::{LivenessVector, UnhealthyCallback};
use crate::noc::payload::{NocPayload, NocVerifyFilter};
use crate::noc::{NocHealth, NocTransport};
use crate::timer::TickContext;

/// Liveness name of the heartbeat callback.
pub const CALLBACK_NAME: &str = "heartbeat";

/// `unhealthyReason` written when the liveness vector degraded.
pub const REASON_LIVENESS_FAILURE: &str = "LIVENESS_FAILURE";
/// `unhealthyReason` written when the NOC circuit breaker tripped.
pub const REASON_NOC_FAILURE: &str = "NOC_FAILURE";

/// Suppression key of the NOC heartbeat payload.
pub const HEARTBEAT_SUPPRESSION_KEY: &str = "argus-heartbeat";

/// The non-grace-aware heartbeat callback.
pub struct HeartbeatService {
    liveness: Arc<LivenessVector>,
    noc_health: Arc<NocHealth>,
    leadership: watch::Receiver<bool>,
    transport: Arc<dyn NocTransport>,
    cfg: HeartbeatConfig,
    http_cfg: NocHttpClientConfig,
    noc_enabled: bool,
    interval_ticks: u64,
    liveness_was_unhealthy: AtomicBool,
    breaker_was_tripped: AtomicBool,
}

impl HeartbeatService {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        liveness: Arc<LivenessVector>,
        noc_health: Arc<NocHealth>,
        leadership: watch::Receiver<bool>,
        transport: Arc<dyn NocTransport>,
        cfg: HeartbeatConfig,
        http_cfg: NocHttpClientConfig,
        noc_enabled: bool,
    ) -> Self {
        let interval_ticks = cfg.interval_seconds.max(1);
        Self {
            liveness,
            noc_health,
            leadership,
            transport,
            cfg,
            http_cfg,
            noc_enabled,
            interval_ticks,
            liveness_was_unhealthy: AtomicBool::new(false),
            breaker_was_tripped: AtomicBool::new(false),
        }
    }

    fn is_leader(&self) -> bool {
        *self.leadership.borrow()
    }

    fn destination(&self) -> &Path {
        Path::new(&self.cfg.file.destination_path)
    }

    /// One heartbeat cycle.
    ///
    /// # Errors
    /// Infallible; every failure mode is handled in place.
    pub async fn run_heartbeat(&self, ctx: TickContext) -> Result<()> {
        let unhealthy = self.liveness.unhealthy_callbacks(ctx.tick);
        let liveness_healthy = unhealthy.is_empty();
        let was_unhealthy = self.liveness_was_unhealthy.load(Ordering::SeqCst);

        if !liveness_healthy {
            if !was_unhealthy {
                self.liveness_was_unhealthy.store(true, Ordering::SeqCst);
                warn!(
                    tick = ctx.tick,
                    unhealthy = unhealthy.len(),
                    "Liveness vector degraded, writing FINAL DIAGNOSTIC heartbeat"
                );
                if self.is_leader() && self.cfg.file.enabled {
                    let doc = self.build_document(
                        &ctx,
                        "UNHEALTHY",
                        Some(REASON_LIVENESS_FAILURE),
                        &unhealthy,
                    );
                    self.write_file_logged(&doc).await;
                }
            }
            // no NOC heartbeat and no further file writes while degraded
            self.stamp(ctx.tick);
            return Ok(());
        }

        if was_unhealthy {
            self.liveness_was_unhealthy.store(false, Ordering::SeqCst);
            info!(tick = ctx.tick, "Liveness vector recovered, resuming heartbeats");
        }

        if self.noc_enabled && self.cfg.http.enabled {
            self.send_noc_heartbeat(&ctx).await;
        }

        let breaker_healthy = self.noc_health.is_healthy();
        let was_tripped = self.breaker_was_tripped.load(Ordering::SeqCst);

        if !breaker_healthy {
            if !was_tripped {
                self.breaker_was_tripped.store(true, Ordering::SeqCst);
                warn!(
                    tick = ctx.tick,
                    "NOC circuit breaker tripped, writing FINAL DIAGNOSTIC heartbeat"
                );
                if self.is_leader() && self.cfg.file.enabled {
                    let doc =
                        self.build_document(&ctx, "UNHEALTHY", Some(REASON_NOC_FAILURE), &[]);
                    self.write_file_logged(&doc).await;
                }
            }
            // NOC heartbeats keep going above so a single success can
            // recover the breaker; only file output pauses
            self.stamp(ctx.tick);
            return Ok(());
        }

        if was_tripped {
            self.breaker_was_tripped.store(false, Ordering::SeqCst);
            info!(
                tick = ctx.tick,
                "NOC circuit breaker recovered, resuming heartbeat file writes"
            );
        }

        if self.is_leader() && self.cfg.file.enabled {
            let doc = self.build_document(&ctx, "HEALTHY", None, &[]);
            self.write_file_logged(&doc).await;
        }

        self.stamp(ctx.tick);
        Ok(())
    }

    fn stamp(&self, tick: u64) {
        self.liveness
            .record_execution(CALLBACK_NAME, self.interval_ticks, tick);
    }

    fn heartbeat_payload(&self) -> NocPayload {
        let mut payload = NocPayload {
            level: 0,
            message: "argus heartbeat".to_string(),
            severity: "info".to_string(),
            source: "argus".to_string(),
            suppression_key: HEARTBEAT_SUPPRESSION_KEY.to_string(),
            visible: false,
            ..Default::default()
        };
        payload.fill_defaults(&self.http_cfg);
        payload
    }

    /// Two-phase NOC heartbeat: Phase-1 send leader-only, Phase-2 verify on
    /// both roles. The outcome feeds the shared circuit breaker.
    async fn send_noc_heartbeat(&self, ctx: &TickContext) {
        let payload = self.heartbeat_payload();

        if self.is_leader() {
            if let Err(e) = self.transport.send(&payload).await {
                warn!(
                    correlation_id = %ctx.correlation_id,
                    error = %e,
                    "NOC heartbeat send failed, continuing to verify"
                );
            }
        }

        let filter = NocVerifyFilter::from(&payload);
        let verified = match self.transport.verify(&filter).await {
            Ok(received) => NocPayload::comparison_matches(&payload, &received),
            Err(e) => {
                warn!(
                    correlation_id = %ctx.correlation_id,
                    error = %e,
                    "NOC heartbeat verify failed"
                );
                false
            }
        };

        if verified {
            debug!(correlation_id = %ctx.correlation_id, "NOC heartbeat verified");
            self.noc_health.record_success();
        } else {
            self.noc_health.record_failure();
        }
    }

    fn build_document(
        &self,
        ctx: &TickContext,
        status: &str,
        unhealthy_reason: Option<&str>,
        unhealthy: &[UnhealthyCallback],
    ) -> serde_json::Value {
        let total = self.liveness.count();
        json!({
            "tick": ctx.tick,
            "correlationId": ctx.correlation_id,
            "timestamp": Utc::now().to_rfc3339(),
            "status": status,
            "unhealthyReason": unhealthy_reason,
            "nocCircuitBreaker": self.noc_health.status(),
            "livenessVector": {
                "isHealthy": unhealthy.is_empty(),
                "totalCount": total,
                "healthyCount": total.saturating_sub(unhealthy.len()),
                "unhealthyCount": unhealthy.len(),
                "callbacks": self.liveness.snapshot(),
                "unhealthyDetails": unhealthy,
            },
        })
    }

    async fn write_file_logged(&self, doc: &serde_json::Value) {
        if let Err(e) = self.write_file(doc).await {
            error!(
                path = %self.cfg.file.destination_path,
                error = format!("{e:#}"),
                "Heartbeat file write failed"
            );
        }
    }

    /// Atomic write: temp file in the destination directory, then rename.
    async fn write_file(&self, doc: &serde_json::Value) -> Result<()> {
        let destination = self.destination().to_path_buf();
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }

        let tmp: PathBuf = {
            let mut name = destination.as_os_str().to_owned();
            name.push(".tmp");
            PathBuf::from(name)
        };

        let body = serde_json::to_vec_pretty(doc).context("heartbeat serialization failed")?;
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("cannot write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &destination)
            .await
            .with_context(|| format!("cannot rename onto {}", destination.display()))?;

        debug!(path = %destination.display(), "Heartbeat file written");
        Ok(())
    }
}
