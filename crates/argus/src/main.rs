//! Argus entrypoint: wire the timer, sources, election, NOC pipeline, and
//! HTTP ingress together and run until SIGTERM.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use argus::alerts::AlertsVector;
use argus::config::ArgusConfig;
use argus::heartbeat::{self, HeartbeatService};
use argus::leader::{self, KubeLeaseClient, LeaderElection};
use argus::liveness::LivenessVector;
use argus::noc::{
    snapshot, HttpNocTransport, NocDispatcher, NocHealth, NocQueue, NocSnapshotJob, NocTransport,
};
use argus::server::{build_router, AppState};
use argus::sources::{k8s_layer, status_fs, K8sLayerSource, KubeProbes, PrometheusSource, StatusFileSystemSource};
use argus::suppression::SuppressionCache;
use argus::timer::CentralTimer;
use argus::watchdog::{self, Watchdog};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,argus=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Argus v{}", env!("CARGO_PKG_VERSION"));

    let cfg = ArgusConfig::load();

    let kube_client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // core state
    let timer = Arc::new(CentralTimer::new(
        cfg.coordinator.snapshot_interval_seconds,
        cfg.coordinator.startup_grace_period_multiplier,
    ));
    let liveness = Arc::new(LivenessVector::new());
    let suppression = Arc::new(SuppressionCache::new(cfg.default_noc.clone()));
    let vector = Arc::new(AlertsVector::new(
        Arc::clone(&timer),
        Arc::clone(&suppression),
        cfg.alerts_vector.ttl_ticks(),
    ));
    let noc_health = Arc::new(NocHealth::new(cfg.noc.circuit_breaker.failure_threshold));

    // leader election
    let identity = LeaderElection::pod_identity();
    info!(identity = %identity, "Pod identity resolved");
    let lease_client = Arc::new(KubeLeaseClient::new(
        kube_client.clone(),
        &cfg.leader_election.lease_namespace,
        &cfg.leader_election.lease_name,
    ));
    let (election, leadership_rx) = LeaderElection::new(
        lease_client,
        cfg.leader_election.clone(),
        identity,
        Arc::clone(&liveness),
    );

    // NOC pipeline
    let transport: Arc<dyn NocTransport> = Arc::new(
        HttpNocTransport::new(cfg.noc.http_client.clone())
            .context("Failed to build NOC transport")?,
    );
    let queue = Arc::new(NocQueue::new());
    let dispatcher = NocDispatcher::new(
        Arc::clone(&queue),
        Arc::clone(&vector),
        Arc::clone(&suppression),
        Arc::clone(&noc_health),
        Arc::clone(&transport),
        leadership_rx.clone(),
        cfg.noc.enabled,
        cfg.noc.http_client.clone(),
    );
    let snapshot_job = Arc::new(NocSnapshotJob::new(
        Arc::clone(&vector),
        Arc::clone(&suppression),
        Arc::clone(&queue),
        Arc::clone(&liveness),
        cfg.coordinator.snapshot_interval_seconds,
    ));

    // watchdog and sources
    let watchdog = Arc::new(Watchdog::new(
        Arc::clone(&timer),
        Arc::clone(&vector),
        Arc::clone(&liveness),
        cfg.watchdog.clone(),
    ));
    let prometheus_source = Arc::new(PrometheusSource::new(
        Arc::clone(&vector),
        Arc::clone(&watchdog),
        cfg.default_noc.clone(),
        cfg.watchdog.alert_name.clone(),
    ));
    let k8s_source = Arc::new(K8sLayerSource::new(
        Arc::new(KubeProbes::new(kube_client.clone(), cfg.k8s_layer.clone())),
        Arc::clone(&vector),
        Arc::clone(&liveness),
        cfg.default_noc.clone(),
        cfg.k8s_layer.polling_interval_seconds,
    ));
    let heartbeat_dir = heartbeat_directory(&cfg.heartbeat.file.destination_path);
    let status_fs_source = Arc::new(StatusFileSystemSource::new(
        heartbeat_dir,
        Arc::clone(&vector),
        Arc::clone(&liveness),
        cfg.default_noc.clone(),
        cfg.status_file_system.polling_interval_seconds,
    ));
    let heartbeat_service = Arc::new(HeartbeatService::new(
        Arc::clone(&liveness),
        Arc::clone(&noc_health),
        leadership_rx,
        Arc::clone(&transport),
        cfg.heartbeat.clone(),
        cfg.noc.http_client.clone(),
        cfg.noc.enabled,
    ));

    register_callbacks(
        &timer,
        &cfg,
        &election,
        &watchdog,
        &k8s_source,
        &status_fs_source,
        &snapshot_job,
        &heartbeat_service,
    );

    // background workers
    let timer_handle = tokio::spawn(Arc::clone(&timer).run(shutdown_rx.clone()));
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx.clone()));

    // HTTP ingress
    let state = Arc::new(AppState {
        timer: Arc::clone(&timer),
        vector: Arc::clone(&vector),
        watchdog: Arc::clone(&watchdog),
        prometheus: Arc::clone(&prometheus_source),
        k8s_layer: Arc::clone(&k8s_source),
        leader: Arc::clone(&election),
        noc_health: Arc::clone(&noc_health),
        liveness: Arc::clone(&liveness),
    });
    let app = build_router(state).layer(
        ServiceBuilder::new()
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                    .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
            )
            .layer(TimeoutLayer::new(Duration::from_secs(30))),
    );

    let listener = tokio::net::TcpListener::bind(&cfg.listen_address)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.listen_address))?;
    info!(address = %cfg.listen_address, "HTTP ingress listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // drain: stop the timer and queue, demote without noise
    info!("Shutting down");
    shutdown_tx.send(true).ok();
    election.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = timer_handle.await;
        let _ = dispatcher_handle.await;
    })
    .await;

    info!("Argus stopped");
    Ok(())
}

/// Directory the heartbeat file lands in; probed by the filesystem source.
fn heartbeat_directory(destination_path: &str) -> PathBuf {
    Path::new(destination_path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Hook every periodic job into the central timer. Registration order is
/// launch order within a tick.
#[allow(clippy::too_many_arguments)]
fn register_callbacks(
    timer: &Arc<CentralTimer>,
    cfg: &ArgusConfig,
    election: &Arc<LeaderElection>,
    watchdog: &Arc<Watchdog>,
    k8s_source: &Arc<K8sLayerSource>,
    status_fs_source: &Arc<StatusFileSystemSource>,
    snapshot_job: &Arc<NocSnapshotJob>,
    heartbeat_service: &Arc<HeartbeatService>,
) {
    {
        let election = Arc::clone(election);
        timer.register(
            leader::CALLBACK_NAME,
            cfg.leader_election.renew_interval_seconds,
            false,
            move |ctx| {
                let election = Arc::clone(&election);
                Box::pin(async move { election.run_election(ctx).await })
            },
        );
    }
    {
        let k8s_source = Arc::clone(k8s_source);
        timer.register(
            k8s_layer::CALLBACK_NAME,
            cfg.k8s_layer.polling_interval_seconds,
            false,
            move |ctx| {
                let k8s_source = Arc::clone(&k8s_source);
                Box::pin(async move { k8s_source.run_poll(ctx).await })
            },
        );
    }
    {
        let status_fs_source = Arc::clone(status_fs_source);
        timer.register(
            status_fs::CALLBACK_NAME,
            cfg.status_file_system.polling_interval_seconds,
            false,
            move |ctx| {
                let status_fs_source = Arc::clone(&status_fs_source);
                Box::pin(async move { status_fs_source.run_probe(ctx).await })
            },
        );
    }
    {
        let watchdog = Arc::clone(watchdog);
        timer.register(
            watchdog::CALLBACK_NAME,
            watchdog.timeout_ticks(),
            true,
            move |ctx| {
                let watchdog = Arc::clone(&watchdog);
                Box::pin(async move { watchdog.run_check(ctx).await })
            },
        );
    }
    {
        let snapshot_job = Arc::clone(snapshot_job);
        timer.register(
            snapshot::CALLBACK_NAME,
            cfg.coordinator.snapshot_interval_seconds,
            true,
            move |ctx| {
                let snapshot_job = Arc::clone(&snapshot_job);
                Box::pin(async move { snapshot_job.run_snapshot(ctx).await })
            },
        );
    }
    {
        let heartbeat_service = Arc::clone(heartbeat_service);
        timer.register(
            heartbeat::CALLBACK_NAME,
            cfg.heartbeat.interval_seconds,
            false,
            move |ctx| {
                let heartbeat_service = Arc::clone(&heartbeat_service);
                Box::pin(async move { heartbeat_service.run_heartbeat(ctx).await })
            },
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
