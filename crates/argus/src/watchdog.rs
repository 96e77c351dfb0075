//! Watchdog expiration state machine.
//!
//! Two tiers on purpose: ingress records the heartbeat tick and nothing
//! else, while the tick callback is the sole writer of the watchdog alert
//! into the vector. Concurrent ingress can therefore never race the state
//! machine; the cost is a one-tick reaction delay.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertStatus, AlertsVector, types::PRIORITY_WATCHDOG};
use crate::config::WatchdogConfig;
use crate::liveness::LivenessVector;
use crate::timer::{CentralTimer, TickContext};

/// Liveness name of the watchdog callback.
pub const CALLBACK_NAME: &str = "watchdog";
/// Fingerprint of the watchdog alert in the vector.
pub const WATCHDOG_FINGERPRINT: &str = "watchdog";

/// Derived watchdog state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchdogStatus {
    /// Startup grace period still active
    Initializing,
    /// Heartbeat seen within the timeout
    Healthy,
    /// No heartbeat, or the last one is too old
    Missing,
}

#[derive(Debug, Default)]
struct WatchdogState {
    last_heartbeat_tick: Option<u64>,
    was_expired: bool,
}

/// Snapshot for the `/api/watchdog` reader.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchdogSnapshot {
    pub status: WatchdogStatus,
    pub last_heartbeat_tick: Option<u64>,
    pub timeout_ticks: u64,
}

/// Tick-based expiration of the Prometheus watchdog heartbeat.
pub struct Watchdog {
    state: RwLock<WatchdogState>,
    timer: Arc<CentralTimer>,
    vector: Arc<AlertsVector>,
    liveness: Arc<LivenessVector>,
    cfg: WatchdogConfig,
    timeout_ticks: u64,
}

impl Watchdog {
    #[must_use]
    pub fn new(
        timer: Arc<CentralTimer>,
        vector: Arc<AlertsVector>,
        liveness: Arc<LivenessVector>,
        cfg: WatchdogConfig,
    ) -> Self {
        let timeout_ticks = cfg.timeout_seconds.max(1);
        Self {
            state: RwLock::new(WatchdogState::default()),
            timer,
            vector,
            liveness,
            cfg,
            timeout_ticks,
        }
    }

    /// Interval of the tick callback, equal to the timeout.
    #[must_use]
    pub fn timeout_ticks(&self) -> u64 {
        self.timeout_ticks
    }

    /// Tier 1: record that the heartbeat fired. Does not touch the alerts
    /// vector.
    pub async fn record_heartbeat(&self) {
        let tick = self.timer.current_tick();
        let mut state = self.state.write().await;
        state.last_heartbeat_tick = Some(tick);
        debug!(tick, "Watchdog heartbeat recorded");
    }

    fn derive_status(&self, state: &WatchdogState, current_tick: u64) -> WatchdogStatus {
        if self.timer.is_grace_period_active() {
            return WatchdogStatus::Initializing;
        }
        match state.last_heartbeat_tick {
            None => WatchdogStatus::Missing,
            Some(last) => {
                if current_tick.saturating_sub(last) < self.timeout_ticks {
                    WatchdogStatus::Healthy
                } else {
                    WatchdogStatus::Missing
                }
            }
        }
    }

    /// Snapshot for the HTTP reader.
    pub async fn snapshot(&self) -> WatchdogSnapshot {
        let state = self.state.read().await;
        WatchdogSnapshot {
            status: self.derive_status(&state, self.timer.current_tick()),
            last_heartbeat_tick: state.last_heartbeat_tick,
            timeout_ticks: self.timeout_ticks,
        }
    }

    /// Tier 2: the tick callback. Sole writer of the watchdog fingerprint.
    ///
    /// # Errors
    /// Infallible; the signature matches the timer callback contract.
    pub async fn run_check(&self, ctx: TickContext) -> Result<()> {
        let mut state = self.state.write().await;
        let status = self.derive_status(&state, ctx.tick);

        match status {
            WatchdogStatus::Missing if !state.was_expired => {
                warn!(
                    tick = ctx.tick,
                    last_heartbeat_tick = state.last_heartbeat_tick,
                    "Watchdog heartbeat missing"
                );
                state.was_expired = true;
            }
            WatchdogStatus::Healthy if state.was_expired => {
                info!(tick = ctx.tick, "Watchdog heartbeat recovered");
                state.was_expired = false;
            }
            _ => {}
        }
        drop(state);

        let (alert_status, behavior, summary) = match status {
            WatchdogStatus::Missing => (
                AlertStatus::Create,
                &self.cfg.create_noc_behavior,
                format!(
                    "Prometheus watchdog heartbeat missing for over {}s",
                    self.cfg.timeout_seconds
                ),
            ),
            WatchdogStatus::Healthy | WatchdogStatus::Initializing => (
                AlertStatus::Cancel,
                &self.cfg.cancel_noc_behavior,
                "Prometheus watchdog heartbeat present".to_string(),
            ),
        };

        let execution_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let alert = Alert::new(
            WATCHDOG_FINGERPRINT,
            PRIORITY_WATCHDOG,
            &self.cfg.alert_name,
            "watchdog",
            alert_status,
        )
        .with_summary(summary)
        .with_send_to_noc(behavior.send_to_noc)
        .with_suppress_window(behavior.suppress_window_duration())
        .with_execution_id(execution_id);

        self.vector.update_alert(alert).await;
        self.liveness
            .record_execution(CALLBACK_NAME, self.timeout_ticks, ctx.tick);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultNocConfig;
    use crate::suppression::SuppressionCache;
    use tokio::sync::watch;

    struct Harness {
        timer: Arc<CentralTimer>,
        vector: Arc<AlertsVector>,
        watchdog: Watchdog,
    }

    fn harness(timeout_seconds: u64) -> Harness {
        // grace period of 2 ticks
        let timer = Arc::new(CentralTimer::new(2, 1.0));
        let suppression = Arc::new(SuppressionCache::new(DefaultNocConfig::default()));
        let vector = Arc::new(AlertsVector::new(
            Arc::clone(&timer),
            suppression,
            3600,
        ));
        let watchdog = Watchdog::new(
            Arc::clone(&timer),
            Arc::clone(&vector),
            Arc::new(LivenessVector::new()),
            WatchdogConfig {
                timeout_seconds,
                ..Default::default()
            },
        );
        Harness {
            timer,
            vector,
            watchdog,
        }
    }

    fn ctx(tick: u64) -> TickContext {
        let (_tx, rx) = watch::channel(false);
        TickContext {
            tick,
            correlation_id: format!("tick-{tick:05}-testtest"),
            shutdown: rx,
        }
    }

    fn past_grace(h: &Harness) {
        while h.timer.is_grace_period_active() {
            h.timer.advance_tick();
        }
    }

    #[tokio::test]
    async fn test_initializing_during_grace() {
        let h = harness(60);
        assert_eq!(h.watchdog.snapshot().await.status, WatchdogStatus::Initializing);
    }

    #[tokio::test]
    async fn test_missing_without_any_heartbeat() {
        let h = harness(60);
        past_grace(&h);

        let snapshot = h.watchdog.snapshot().await;
        assert_eq!(snapshot.status, WatchdogStatus::Missing);

        h.watchdog.run_check(ctx(h.timer.current_tick())).await.unwrap();
        let alert = h.vector.get(WATCHDOG_FINGERPRINT).await.unwrap();
        assert_eq!(alert.status, AlertStatus::Create);
        assert_eq!(alert.priority, PRIORITY_WATCHDOG);
    }

    #[tokio::test]
    async fn test_heartbeat_only_applies_on_next_check() {
        let h = harness(60);
        past_grace(&h);

        h.watchdog.run_check(ctx(h.timer.current_tick())).await.unwrap();
        assert_eq!(
            h.vector.get(WATCHDOG_FINGERPRINT).await.unwrap().status,
            AlertStatus::Create
        );

        // tier 1 only: the vector must not change until the next check
        h.watchdog.record_heartbeat().await;
        assert_eq!(
            h.vector.get(WATCHDOG_FINGERPRINT).await.unwrap().status,
            AlertStatus::Create
        );

        h.timer.advance_tick();
        h.watchdog.run_check(ctx(h.timer.current_tick())).await.unwrap();
        assert_eq!(
            h.vector.get(WATCHDOG_FINGERPRINT).await.unwrap().status,
            AlertStatus::Cancel
        );
    }

    #[tokio::test]
    async fn test_heartbeat_expires_after_timeout() {
        let h = harness(5);
        past_grace(&h);

        // no heartbeat yet: the CREATE seeds the vector entry
        h.watchdog.run_check(ctx(h.timer.current_tick())).await.unwrap();

        h.watchdog.record_heartbeat().await;
        let heartbeat_tick = h.timer.current_tick();

        // age 4 < 5: healthy
        h.watchdog.run_check(ctx(heartbeat_tick + 4)).await.unwrap();
        assert_eq!(
            h.vector.get(WATCHDOG_FINGERPRINT).await.unwrap().status,
            AlertStatus::Cancel
        );

        // age 5 >= 5: missing again
        h.watchdog.run_check(ctx(heartbeat_tick + 5)).await.unwrap();
        assert_eq!(
            h.vector.get(WATCHDOG_FINGERPRINT).await.unwrap().status,
            AlertStatus::Create
        );
    }

    #[tokio::test]
    async fn test_cancel_during_grace_is_noop_on_empty_vector() {
        let h = harness(60);
        // grace still active: the derived status is Initializing -> CANCEL,
        // and a CANCEL cannot introduce a vector entry
        h.watchdog.run_check(ctx(0)).await.unwrap();
        assert!(h.vector.get(WATCHDOG_FINGERPRINT).await.is_none());
    }
}
