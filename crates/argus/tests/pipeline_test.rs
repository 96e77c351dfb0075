//! End-to-end pipeline scenarios: sources feed the vector, the snapshot
//! decides, the dispatcher executes against a scripted NOC.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use argus::alerts::{Alert, AlertStatus, AlertsVector};
use argus::config::{DefaultNocConfig, WatchdogConfig};
use argus::liveness::LivenessVector;
use argus::noc::{
    NocDispatcher, NocHealth, NocPayload, NocQueue, NocSnapshotJob, NocTransport, NocVerifyFilter,
};
use argus::sources::{ApiV2Alert, PrometheusSource};
use argus::suppression::SuppressionCache;
use argus::timer::{CentralTimer, TickContext};
use argus::watchdog::{Watchdog, WATCHDOG_FINGERPRINT};

/// NOC double: send always accepted, verify echoes the filter back so the
/// three compared fields always match — unless `verify_ok` is lowered.
struct ScriptedNoc {
    verify_ok: AtomicBool,
    send_calls: AtomicUsize,
    verify_calls: AtomicUsize,
}

impl ScriptedNoc {
    fn new() -> Self {
        Self {
            verify_ok: AtomicBool::new(true),
            send_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl NocTransport for ScriptedNoc {
    async fn send(&self, _payload: &NocPayload) -> anyhow::Result<()> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn verify(&self, filter: &NocVerifyFilter) -> anyhow::Result<NocPayload> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if self.verify_ok.load(Ordering::SeqCst) {
            Ok(NocPayload {
                suppression_key: filter.suppression_key.clone(),
                level: filter.level,
                source: filter.source.clone(),
                ..Default::default()
            })
        } else {
            anyhow::bail!("verify returned 503")
        }
    }
}

struct Pipeline {
    timer: Arc<CentralTimer>,
    vector: Arc<AlertsVector>,
    suppression: Arc<SuppressionCache>,
    health: Arc<NocHealth>,
    queue: Arc<NocQueue>,
    snapshot: NocSnapshotJob,
    noc: Arc<ScriptedNoc>,
    shutdown_tx: watch::Sender<bool>,
    _leader_tx: watch::Sender<bool>,
}

fn pipeline(leader: bool) -> Pipeline {
    let timer = Arc::new(CentralTimer::new(30, 1.0));
    let suppression = Arc::new(SuppressionCache::new(DefaultNocConfig::default()));
    let vector = Arc::new(AlertsVector::new(
        Arc::clone(&timer),
        Arc::clone(&suppression),
        3600,
    ));
    let health = Arc::new(NocHealth::new(3));
    let queue = Arc::new(NocQueue::new());
    let liveness = Arc::new(LivenessVector::new());
    let noc = Arc::new(ScriptedNoc::new());
    let (leader_tx, leader_rx) = watch::channel(leader);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = NocDispatcher::new(
        Arc::clone(&queue),
        Arc::clone(&vector),
        Arc::clone(&suppression),
        Arc::clone(&health),
        Arc::clone(&noc) as Arc<dyn NocTransport>,
        leader_rx,
        true,
        argus::config::NocHttpClientConfig::default(),
    );
    tokio::spawn(dispatcher.run(shutdown_rx));

    let snapshot = NocSnapshotJob::new(
        Arc::clone(&vector),
        Arc::clone(&suppression),
        Arc::clone(&queue),
        liveness,
        30,
    );

    Pipeline {
        timer,
        vector,
        suppression,
        health,
        queue,
        snapshot,
        noc,
        shutdown_tx,
        _leader_tx: leader_tx,
    }
}

fn ctx(tick: u64) -> TickContext {
    let (_tx, rx) = watch::channel(false);
    TickContext {
        tick,
        correlation_id: format!("tick-{tick:05}-pipeline"),
        shutdown: rx,
    }
}

async fn drain(p: &Pipeline) {
    // generous: the worker backs off ~1s after a failed round-trip
    for _ in 0..100 {
        if p.queue.is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // give the worker a beat to finish the in-flight decision
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_create_and_cancel_round_trip() {
    let p = pipeline(true);

    p.vector
        .update_alert(
            Alert::new("incident", 0, "HighLatency", "prometheus", AlertStatus::Create)
                .with_summary("p99 over budget"),
        )
        .await;

    p.snapshot.run_snapshot(ctx(30)).await.unwrap();
    drain(&p).await;

    // CREATE dispatched and verified; the alert stays active
    assert!(p.vector.get("incident").await.is_some());
    assert_eq!(p.noc.send_calls.load(Ordering::SeqCst), 1);
    assert!(p.health.is_healthy());

    // the incident resolves
    p.vector
        .update_alert(Alert::new(
            "incident",
            0,
            "HighLatency",
            "prometheus",
            AlertStatus::Cancel,
        ))
        .await;
    p.snapshot.run_snapshot(ctx(60)).await.unwrap();
    drain(&p).await;

    // CANCEL round-trip removes the alert and clears suppression
    assert!(p.vector.get("incident").await.is_none());
    assert!(p.suppression.is_empty());

    p.shutdown_tx.send(true).ok();
}

#[tokio::test]
async fn test_failed_verify_retries_on_next_snapshot() {
    let p = pipeline(true);
    p.noc.verify_ok.store(false, Ordering::SeqCst);

    p.vector
        .update_alert(Alert::new("incident", 0, "n", "s", AlertStatus::Create))
        .await;
    p.vector
        .update_alert(Alert::new("incident", 0, "n", "s", AlertStatus::Cancel))
        .await;

    p.snapshot.run_snapshot(ctx(30)).await.unwrap();
    drain(&p).await;

    // failed verify: alert retained, breaker fed, suppression re-armed
    assert!(p.vector.get("incident").await.is_some());
    assert_eq!(p.health.consecutive_failures(), 1);

    // NOC recovers; the next snapshot re-enqueues the same cancel
    p.noc.verify_ok.store(true, Ordering::SeqCst);
    p.snapshot.run_snapshot(ctx(60)).await.unwrap();
    drain(&p).await;

    assert!(p.vector.get("incident").await.is_none());
    assert!(p.health.is_healthy());

    p.shutdown_tx.send(true).ok();
}

#[tokio::test]
async fn test_one_create_per_snapshot_in_priority_order() {
    let p = pipeline(true);

    p.vector
        .update_alert(Alert::new("low", 5, "n", "s", AlertStatus::Create))
        .await;
    p.vector
        .update_alert(Alert::new("high", -10, "n", "s", AlertStatus::Create))
        .await;

    // only the highest-priority incident goes out
    p.snapshot.run_snapshot(ctx(30)).await.unwrap();
    drain(&p).await;
    assert_eq!(p.noc.send_calls.load(Ordering::SeqCst), 1);

    // while it is active and suppressed, nothing else is pushed
    p.snapshot.run_snapshot(ctx(60)).await.unwrap();
    drain(&p).await;
    assert_eq!(p.noc.send_calls.load(Ordering::SeqCst), 1);

    // resolving it lets the next snapshot promote the lower-priority one
    // and drain the cancel in the same pass
    p.vector
        .update_alert(Alert::new("high", -10, "n", "s", AlertStatus::Cancel))
        .await;
    p.snapshot.run_snapshot(ctx(90)).await.unwrap();
    drain(&p).await;
    assert_eq!(p.noc.send_calls.load(Ordering::SeqCst), 3);
    assert!(p.vector.get("high").await.is_none());
    assert!(p.vector.get("low").await.is_some());

    p.shutdown_tx.send(true).ok();
}

#[tokio::test]
async fn test_watchdog_alert_flows_to_noc() {
    let p = pipeline(true);
    let liveness = Arc::new(LivenessVector::new());
    let watchdog = Arc::new(Watchdog::new(
        Arc::clone(&p.timer),
        Arc::clone(&p.vector),
        Arc::clone(&liveness),
        WatchdogConfig::default(),
    ));
    let source = PrometheusSource::new(
        Arc::clone(&p.vector),
        Arc::clone(&watchdog),
        DefaultNocConfig::default(),
        "Watchdog".to_string(),
    );

    // leave the grace period (snapshot interval 30 x 1.0)
    while p.timer.is_grace_period_active() {
        p.timer.advance_tick();
    }
    let tick = p.timer.current_tick();

    // no heartbeat ever received: the check emits CREATE
    watchdog.run_check(ctx(tick)).await.unwrap();
    let alert = p.vector.get(WATCHDOG_FINGERPRINT).await.unwrap();
    assert_eq!(alert.status, AlertStatus::Create);

    p.snapshot.run_snapshot(ctx(tick)).await.unwrap();
    drain(&p).await;
    assert_eq!(p.noc.send_calls.load(Ordering::SeqCst), 1);
    assert!(p.vector.get(WATCHDOG_FINGERPRINT).await.is_some());

    // a heartbeat arrives via the push path
    source
        .ingest(vec![ApiV2Alert {
            status: "firing".to_string(),
            labels: HashMap::from([
                ("alertname".to_string(), "Watchdog".to_string()),
                ("platform".to_string(), "argus".to_string()),
            ]),
            annotations: HashMap::new(),
            starts_at: None,
            ends_at: None,
            fingerprint: "am-watchdog".to_string(),
        }])
        .await;

    // tier 1 only: the vector still holds CREATE until the next check
    assert_eq!(
        p.vector.get(WATCHDOG_FINGERPRINT).await.unwrap().status,
        AlertStatus::Create
    );

    p.timer.advance_tick();
    watchdog.run_check(ctx(p.timer.current_tick())).await.unwrap();
    assert_eq!(
        p.vector.get(WATCHDOG_FINGERPRINT).await.unwrap().status,
        AlertStatus::Cancel
    );

    p.shutdown_tx.send(true).ok();
}
