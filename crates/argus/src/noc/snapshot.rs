//! NOC snapshot: the periodic read of the alerts vector that decides what
//! the dispatcher should do next.
//!
//! Only the highest-priority active CREATE goes out per snapshot; that is a
//! deliberate rate limit, with concurrent incidents draining across
//! successive snapshots in priority order. CANCELs close incidents and are
//! drained in one batch.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::alerts::{Alert, AlertStatus, AlertsVector};
use crate::liveness::LivenessVector;
use crate::suppression::SuppressionCache;
use crate::timer::TickContext;

use super::queue::{NocDecision, NocQueue, QueuedDecision};

/// Liveness name of the snapshot callback.
pub const CALLBACK_NAME: &str = "noc-snapshot";

/// The grace-aware snapshot callback.
pub struct NocSnapshotJob {
    vector: Arc<AlertsVector>,
    suppression: Arc<SuppressionCache>,
    queue: Arc<NocQueue>,
    liveness: Arc<LivenessVector>,
    interval_ticks: u64,
}

impl NocSnapshotJob {
    #[must_use]
    pub fn new(
        vector: Arc<AlertsVector>,
        suppression: Arc<SuppressionCache>,
        queue: Arc<NocQueue>,
        liveness: Arc<LivenessVector>,
        interval_ticks: u64,
    ) -> Self {
        Self {
            vector,
            suppression,
            queue,
            liveness,
            interval_ticks: interval_ticks.max(1),
        }
    }

    /// One snapshot cycle.
    ///
    /// # Errors
    /// Infallible today; the signature matches the timer callback contract.
    pub async fn run_snapshot(&self, ctx: TickContext) -> Result<()> {
        self.vector.cleanup_expired(ctx.tick).await;
        let snapshot = self.vector.get_snapshot().await;
        let snapshot_time = Utc::now();

        debug!(
            tick = ctx.tick,
            correlation_id = %ctx.correlation_id,
            alerts = snapshot.len(),
            "Snapshot taken"
        );

        // at most one CREATE per snapshot: the highest-priority one
        if let Some(first_create) = snapshot.iter().find(|a| a.status == AlertStatus::Create) {
            if self.suppression.was_recently_processed(first_create, ctx.tick) {
                info!(
                    fingerprint = %first_create.fingerprint,
                    correlation_id = %ctx.correlation_id,
                    "CREATE inside suppression window, not enqueued"
                );
            } else {
                self.suppression.mark_as_processed(first_create, ctx.tick);
                self.queue
                    .enqueue(QueuedDecision {
                        decision: NocDecision::HandleCreate(first_create.clone()),
                        snapshot_time,
                        correlation_id: ctx.correlation_id.clone(),
                    })
                    .await;
            }
        }

        // every unsuppressed CANCEL goes out in one batch
        let cancels: Vec<Alert> = snapshot
            .iter()
            .filter(|a| {
                a.status == AlertStatus::Cancel
                    && !self.suppression.was_recently_processed(a, ctx.tick)
            })
            .cloned()
            .collect();

        if !cancels.is_empty() {
            for cancel in &cancels {
                self.suppression.mark_as_processed(cancel, ctx.tick);
            }
            self.queue
                .enqueue(QueuedDecision {
                    decision: NocDecision::HandleCancels(cancels),
                    snapshot_time,
                    correlation_id: ctx.correlation_id.clone(),
                })
                .await;
        }

        self.liveness
            .record_execution(CALLBACK_NAME, self.interval_ticks, ctx.tick);
        Ok(())
    }
}
