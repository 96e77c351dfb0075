//! Central Timer
//!
//! Single 1-second tick scheduler. All periodic work in the process hangs off
//! this loop: callbacks register with a name and an interval in ticks, and
//! every launch within one tick shares one correlation id. Overlapping
//! invocations of the same callback are dropped rather than queued so a slow
//! dependency cannot stack work behind itself.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Tick length. The rest of the system converts seconds to ticks with this.
pub const TICK_INTERVAL_SECONDS: u64 = 1;

/// Per-invocation context handed to every callback.
#[derive(Clone)]
pub struct TickContext {
    /// Tick the callback was launched on
    pub tick: u64,
    /// Shared by all callbacks launched in the same tick
    pub correlation_id: String,
    /// Flips to `true` on shutdown; long-running callbacks should observe it
    pub shutdown: watch::Receiver<bool>,
}

/// Boxed async callback. Errors are counted and logged by the timer; the
/// callback itself stamps the liveness vector on handled completion.
pub type TimerCallback =
    Arc<dyn Fn(TickContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct RegisteredCallback {
    name: String,
    interval_ticks: u64,
    grace_period_aware: bool,
    callback: TimerCallback,
    /// Serializes invocations of this callback against itself
    running: Arc<AtomicBool>,
    skipped: Arc<AtomicU64>,
}

/// Counter snapshot for the status readers.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerCounters {
    pub tick_count: u64,
    pub callback_errors: u64,
    pub callbacks_skipped: u64,
}

/// The tick scheduler. One instance per process, shared as `Arc`.
pub struct CentralTimer {
    tick_count: AtomicU64,
    heartbeat_timestamp: RwLock<DateTime<Utc>>,
    grace_period_seconds: u64,
    callbacks: RwLock<Vec<RegisteredCallback>>,
    callback_errors: Arc<AtomicU64>,
}

impl CentralTimer {
    /// Create a timer. The grace period is `snapshot_interval_seconds x
    /// multiplier`, multiplier floored at 1.0.
    #[must_use]
    pub fn new(snapshot_interval_seconds: u64, grace_period_multiplier: f64) -> Self {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let grace_period_seconds =
            (snapshot_interval_seconds as f64 * grace_period_multiplier.max(1.0)).round() as u64;

        Self {
            tick_count: AtomicU64::new(0),
            heartbeat_timestamp: RwLock::new(Utc::now()),
            grace_period_seconds,
            callbacks: RwLock::new(Vec::new()),
            callback_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current tick. Zero until the loop has ticked once.
    #[must_use]
    pub fn current_tick(&self) -> u64 {
        self.tick_count.load(Ordering::SeqCst)
    }

    /// Wall clock at the last tick.
    #[must_use]
    pub fn heartbeat_timestamp(&self) -> DateTime<Utc> {
        *self
            .heartbeat_timestamp
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Grace period length in seconds (= ticks).
    #[must_use]
    pub fn grace_period_seconds(&self) -> u64 {
        self.grace_period_seconds
    }

    /// True until the tick count reaches the grace period, then latched false.
    #[must_use]
    pub fn is_grace_period_active(&self) -> bool {
        self.current_tick() < self.grace_period_seconds
    }

    /// Register a callback. Names are unique; a second registration under an
    /// existing name is rejected.
    pub fn register<F>(
        &self,
        name: &str,
        interval_ticks: u64,
        grace_period_aware: bool,
        callback: F,
    ) -> bool
    where
        F: Fn(TickContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        let interval_ticks = interval_ticks.max(1);
        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if callbacks.iter().any(|c| c.name == name) {
            warn!(callback = %name, "Callback already registered, ignoring");
            return false;
        }

        info!(
            callback = %name,
            interval_ticks,
            grace_period_aware,
            "Registered timer callback"
        );

        callbacks.push(RegisteredCallback {
            name: name.to_string(),
            interval_ticks,
            grace_period_aware,
            callback: Arc::new(callback),
            running: Arc::new(AtomicBool::new(false)),
            skipped: Arc::new(AtomicU64::new(0)),
        });
        true
    }

    /// Advance the tick count and stamp the heartbeat timestamp. Returns the
    /// new tick. The run loop calls this once per second; tests may drive it
    /// directly.
    pub fn advance_tick(&self) -> u64 {
        let tick = self.tick_count.fetch_add(1, Ordering::SeqCst) + 1;
        *self
            .heartbeat_timestamp
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Utc::now();
        tick
    }

    /// Counter snapshot for the status readers.
    #[must_use]
    pub fn counters(&self) -> TimerCounters {
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        TimerCounters {
            tick_count: self.current_tick(),
            callback_errors: self.callback_errors.load(Ordering::Relaxed),
            callbacks_skipped: callbacks
                .iter()
                .map(|c| c.skipped.load(Ordering::Relaxed))
                .sum(),
        }
    }

    /// Launch due callbacks for `tick`. Launches happen in registration
    /// order; execution is concurrent and the loop does not wait for it.
    fn dispatch_tick(&self, tick: u64, shutdown: &watch::Receiver<bool>) {
        let correlation_id = Self::correlation_id_for(tick);
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        for cb in callbacks.iter() {
            if tick % cb.interval_ticks != 0 {
                continue;
            }
            if cb.grace_period_aware && self.is_grace_period_active() {
                debug!(callback = %cb.name, tick, "Grace period active, skipping");
                continue;
            }
            if cb
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                cb.skipped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    callback = %cb.name,
                    tick,
                    "Previous invocation still running, skipping"
                );
                continue;
            }

            let ctx = TickContext {
                tick,
                correlation_id: correlation_id.clone(),
                shutdown: shutdown.clone(),
            };
            let fut = (cb.callback)(ctx);
            let running = Arc::clone(&cb.running);
            let errors = Arc::clone(&self.callback_errors);
            let name = cb.name.clone();
            let cid = correlation_id.clone();

            tokio::spawn(async move {
                if let Err(e) = fut.await {
                    errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        callback = %name,
                        correlation_id = %cid,
                        error = format!("{e:#}"),
                        "Callback failed"
                    );
                }
                running.store(false, Ordering::SeqCst);
            });
        }
    }

    /// `tick-<5-digit-tick>-<8-char-random>`
    fn correlation_id_for(tick: u64) -> String {
        let suffix = uuid::Uuid::new_v4().to_string()[..8].to_string();
        format!("tick-{tick:05}-{suffix}")
    }

    /// Run the tick loop until shutdown flips. Ticks advance once per second
    /// regardless of how long callbacks run.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SECONDS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first interval tick fires immediately; swallow it so tick 1
        // lands a full second after startup
        interval.tick().await;

        info!(
            grace_period_seconds = self.grace_period_seconds,
            "Central timer started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let tick = self.advance_tick();
                    self.dispatch_tick(tick, &shutdown);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(tick = self.current_tick(), "Central timer stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn shutdown_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[test]
    fn test_grace_period_computation() {
        let timer = CentralTimer::new(30, 2.0);
        assert_eq!(timer.grace_period_seconds(), 60);

        // multiplier floored at 1.0
        let timer = CentralTimer::new(30, 0.5);
        assert_eq!(timer.grace_period_seconds(), 30);
    }

    #[test]
    fn test_grace_period_latches_off() {
        let timer = CentralTimer::new(2, 1.0);
        assert!(timer.is_grace_period_active());
        timer.advance_tick();
        assert!(timer.is_grace_period_active());
        timer.advance_tick();
        assert!(!timer.is_grace_period_active());
        timer.advance_tick();
        assert!(!timer.is_grace_period_active());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let timer = CentralTimer::new(30, 1.0);
        assert!(timer.register("a", 1, false, |_| Box::pin(async { Ok(()) })));
        assert!(!timer.register("a", 5, false, |_| Box::pin(async { Ok(()) })));
    }

    #[test]
    fn test_correlation_id_format() {
        let id = CentralTimer::correlation_id_for(42);
        assert!(id.starts_with("tick-00042-"));
        assert_eq!(id.len(), "tick-00042-".len() + 8);
    }

    #[tokio::test]
    async fn test_dispatch_respects_interval_and_grace() {
        let timer = Arc::new(CentralTimer::new(2, 1.0));
        let runs = Arc::new(AtomicUsize::new(0));
        let grace_runs = Arc::new(AtomicUsize::new(0));

        {
            let runs = Arc::clone(&runs);
            timer.register("every-2", 2, false, move |_| {
                let runs = Arc::clone(&runs);
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            });
        }
        {
            let grace_runs = Arc::clone(&grace_runs);
            timer.register("grace-aware", 1, true, move |_| {
                let grace_runs = Arc::clone(&grace_runs);
                Box::pin(async move {
                    grace_runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            });
        }

        let (_tx, rx) = shutdown_pair();
        // grace period is 2 ticks: grace-aware must not run at tick 1
        for _ in 0..4 {
            let tick = timer.advance_tick();
            timer.dispatch_tick(tick, &rx);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // every-2 fires at ticks 2 and 4
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        // grace-aware fires at ticks 2, 3, 4 (grace covers tick 1 only)
        assert_eq!(grace_runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_overlapping_invocation_skipped() {
        let timer = Arc::new(CentralTimer::new(1, 1.0));
        let started = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = watch::channel(false);

        {
            let started = Arc::clone(&started);
            timer.register("slow", 1, false, move |_| {
                let started = Arc::clone(&started);
                let mut release = release_rx.clone();
                Box::pin(async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    // block until the test releases us
                    while !*release.borrow() {
                        if release.changed().await.is_err() {
                            break;
                        }
                    }
                    Ok(())
                })
            });
        }

        let (_tx, rx) = shutdown_pair();
        let t1 = timer.advance_tick();
        timer.dispatch_tick(t1, &rx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let t2 = timer.advance_tick();
        timer.dispatch_tick(t2, &rx);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // second launch was dropped by the running-lock
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(timer.counters().callbacks_skipped, 1);

        release_tx.send(true).ok();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let t3 = timer.advance_tick();
        timer.dispatch_tick(t3, &rx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_callback_error_counted() {
        let timer = Arc::new(CentralTimer::new(1, 1.0));
        timer.register("failing", 1, false, |_| {
            Box::pin(async { Err(anyhow::anyhow!("boom")) })
        });

        let (_tx, rx) = shutdown_pair();
        let tick = timer.advance_tick();
        timer.dispatch_tick(tick, &rx);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(timer.counters().callback_errors, 1);
    }
}
