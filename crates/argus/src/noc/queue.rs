//! NOC decision queue and dispatcher.
//!
//! A FIFO queue drained by exactly one worker. Every decision is re-checked
//! against the current alerts vector before any side effect, then pushed
//! through the two-phase send/verify protocol: Phase-1 Send is leader-only,
//! Phase-2 Verify runs on both roles. Outcomes drive the circuit breaker,
//! the suppression cache, and CANCEL removal from the vector.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertStatus, AlertsVector};
use crate::config::NocHttpClientConfig;
use crate::suppression::SuppressionCache;

use super::client::NocTransport;
use super::health::NocHealth;
use super::payload::{NocPayload, NocVerifyFilter};

/// Idle wait between queue polls.
const IDLE_SLEEP: Duration = Duration::from_millis(100);
/// Backoff after a failed NOC round-trip.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What the snapshot decided to do.
#[derive(Debug, Clone)]
pub enum NocDecision {
    /// Open the single highest-priority incident
    HandleCreate(Alert),
    /// Close every resolved incident in one pass
    HandleCancels(Vec<Alert>),
}

/// A decision plus the snapshot context it was taken under.
#[derive(Debug, Clone)]
pub struct QueuedDecision {
    pub decision: NocDecision,
    pub snapshot_time: DateTime<Utc>,
    pub correlation_id: String,
}

/// Single-consumer FIFO of pending decisions.
#[derive(Default)]
pub struct NocQueue {
    inner: Mutex<VecDeque<QueuedDecision>>,
}

impl NocQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue(&self, decision: QueuedDecision) {
        self.inner.lock().await.push_back(decision);
    }

    pub async fn pop(&self) -> Option<QueuedDecision> {
        self.inner.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// The queue worker. Holds everything the two-phase protocol touches.
pub struct NocDispatcher {
    queue: Arc<NocQueue>,
    vector: Arc<AlertsVector>,
    suppression: Arc<SuppressionCache>,
    health: Arc<NocHealth>,
    transport: Arc<dyn NocTransport>,
    leadership: watch::Receiver<bool>,
    /// Phase-1 payloads by fingerprint, read back in Phase-2
    sent_cache: DashMap<String, NocPayload>,
    noc_enabled: bool,
    http_cfg: NocHttpClientConfig,
}

impl NocDispatcher {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        queue: Arc<NocQueue>,
        vector: Arc<AlertsVector>,
        suppression: Arc<SuppressionCache>,
        health: Arc<NocHealth>,
        transport: Arc<dyn NocTransport>,
        leadership: watch::Receiver<bool>,
        noc_enabled: bool,
        http_cfg: NocHttpClientConfig,
    ) -> Self {
        Self {
            queue,
            vector,
            suppression,
            health,
            transport,
            leadership,
            sent_cache: DashMap::new(),
            noc_enabled,
            http_cfg,
        }
    }

    /// Drain the queue until shutdown. Decisions are processed one at a
    /// time, strictly in enqueue order.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("NOC dispatcher started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.queue.pop().await {
                Some(item) => {
                    if self.process(item).await {
                        continue;
                    }
                    ERROR_BACKOFF
                }
                None => IDLE_SLEEP,
            };

            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("NOC dispatcher stopped");
    }

    /// Process one decision. Returns false when a round-trip failed and the
    /// worker should back off briefly.
    async fn process(&self, item: QueuedDecision) -> bool {
        match item.decision {
            NocDecision::HandleCreate(alert) => {
                self.dispatch_alert(alert, AlertStatus::Create, &item.correlation_id)
                    .await
            }
            NocDecision::HandleCancels(alerts) => {
                let mut all_ok = true;
                for alert in alerts {
                    all_ok &= self
                        .dispatch_alert(alert, AlertStatus::Cancel, &item.correlation_id)
                        .await;
                }
                all_ok
            }
        }
    }

    /// Two-phase dispatch of a single alert. Returns false only on a NOC
    /// round-trip failure; dropped decisions count as handled.
    async fn dispatch_alert(
        &self,
        queued: Alert,
        intent: AlertStatus,
        correlation_id: &str,
    ) -> bool {
        let fingerprint = queued.fingerprint.clone();

        // the vector may have moved on since the snapshot; re-read before
        // acting and drop decisions whose intent no longer holds
        let Some(current) = self.vector.get(&fingerprint).await else {
            debug!(
                fingerprint = %fingerprint,
                intent = %intent,
                "Alert no longer in vector, dropping decision"
            );
            return true;
        };
        if current.status != intent {
            debug!(
                fingerprint = %fingerprint,
                intent = %intent,
                current_status = %current.status,
                "Alert status changed since snapshot, dropping decision"
            );
            return true;
        }

        if !current.send_to_noc || !self.noc_enabled {
            if intent == AlertStatus::Cancel {
                self.vector.remove_alert(&fingerprint).await;
            }
            debug!(
                fingerprint = %fingerprint,
                send_to_noc = current.send_to_noc,
                noc_enabled = self.noc_enabled,
                "NOC send skipped"
            );
            return true;
        }

        let is_leader = *self.leadership.borrow();
        let payload = NocPayload::for_alert(&current, &self.http_cfg);

        // Phase 1: only the leader mutates the NOC. A failed send does not
        // short-circuit Phase 2; the receiver may have accepted the write
        // despite an error body.
        if is_leader {
            match self.transport.send(&payload).await {
                Ok(()) => {
                    self.sent_cache.insert(fingerprint.clone(), payload.clone());
                    info!(
                        fingerprint = %fingerprint,
                        status = %intent,
                        execution_id = %current.execution_id,
                        correlation_id = %correlation_id,
                        "NOC send accepted"
                    );
                }
                Err(e) => {
                    warn!(
                        fingerprint = %fingerprint,
                        correlation_id = %correlation_id,
                        error = %e,
                        "NOC send failed, continuing to verify"
                    );
                }
            }
        }

        // Phase 2: both roles verify. The follower has no cached payload and
        // synthesizes the same deterministic one from the alert.
        let sent = self
            .sent_cache
            .get(&fingerprint)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| payload.clone());
        let filter = NocVerifyFilter::from(&sent);

        let verified = match self.transport.verify(&filter).await {
            Ok(received) => {
                let matches = NocPayload::comparison_matches(&sent, &received);
                if !matches {
                    warn!(
                        fingerprint = %fingerprint,
                        sent_level = sent.level,
                        received_level = received.level,
                        received_key = %received.suppression_key,
                        "NOC verify comparison mismatch"
                    );
                }
                matches
            }
            Err(e) => {
                warn!(
                    fingerprint = %fingerprint,
                    correlation_id = %correlation_id,
                    error = %e,
                    "NOC verify failed"
                );
                false
            }
        };

        if verified {
            self.health.record_success();
            if intent == AlertStatus::Cancel {
                // the incident is closed downstream; forget it entirely
                self.vector.remove_alert(&fingerprint).await;
                self.sent_cache.remove(&fingerprint);
            }
            info!(
                fingerprint = %fingerprint,
                status = %intent,
                correlation_id = %correlation_id,
                "NOC round-trip verified"
            );
            true
        } else {
            self.health.record_failure();
            // re-arm the snapshot so the next cycle retries
            self.suppression.unmark_as_processed(&current);
            false
        }
    }
}
