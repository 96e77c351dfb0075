//! Status filesystem probe.
//!
//! Confirms the heartbeat destination directory exists and is writable by
//! creating and deleting a uniquely named probe file. A replica that cannot
//! write its heartbeat file must say so as an alert.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::alerts::types::PRIORITY_STATUS_FILESYSTEM;
use crate::alerts::{Alert, AlertStatus, AlertsVector};
use crate::config::DefaultNocConfig;
use crate::liveness::LivenessVector;
use crate::timer::TickContext;

/// Liveness name of the probe callback.
pub const CALLBACK_NAME: &str = "status-filesystem";
/// Fingerprint of the probe alert.
pub const FINGERPRINT: &str = "status-filesystem";

/// Periodic writability probe of the heartbeat directory.
pub struct StatusFileSystemSource {
    directory: PathBuf,
    vector: Arc<AlertsVector>,
    liveness: Arc<LivenessVector>,
    defaults: DefaultNocConfig,
    interval_ticks: u64,
}

impl StatusFileSystemSource {
    #[must_use]
    pub fn new(
        directory: PathBuf,
        vector: Arc<AlertsVector>,
        liveness: Arc<LivenessVector>,
        defaults: DefaultNocConfig,
        interval_ticks: u64,
    ) -> Self {
        Self {
            directory,
            vector,
            liveness,
            defaults,
            interval_ticks: interval_ticks.max(1),
        }
    }

    async fn probe(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .with_context(|| format!("cannot create {}", self.directory.display()))?;

        let probe_name = format!(
            ".argus-probe-{}",
            uuid::Uuid::new_v4().to_string()[..8].to_string()
        );
        let probe_path = self.directory.join(probe_name);

        tokio::fs::write(&probe_path, b"probe")
            .await
            .with_context(|| format!("cannot write {}", probe_path.display()))?;
        tokio::fs::remove_file(&probe_path)
            .await
            .with_context(|| format!("cannot remove {}", probe_path.display()))?;
        Ok(())
    }

    /// One probe cycle: CREATE on failure, CANCEL on success.
    ///
    /// # Errors
    /// Infallible; probe failures become alerts, not errors.
    pub async fn run_probe(&self, ctx: TickContext) -> Result<()> {
        let execution_id = uuid::Uuid::new_v4().to_string()[..8].to_string();

        let (status, detail) = match self.probe().await {
            Ok(()) => {
                debug!(directory = %self.directory.display(), "Heartbeat directory writable");
                (
                    AlertStatus::Cancel,
                    format!("{} is writable", self.directory.display()),
                )
            }
            Err(e) => {
                warn!(
                    directory = %self.directory.display(),
                    error = format!("{e:#}"),
                    "Heartbeat directory probe failed"
                );
                (AlertStatus::Create, format!("{e:#}"))
            }
        };

        let behavior = match status {
            AlertStatus::Create => &self.defaults.create_noc_behavior,
            AlertStatus::Cancel => &self.defaults.cancel_noc_behavior,
        };
        let alert = Alert::new(
            FINGERPRINT,
            PRIORITY_STATUS_FILESYSTEM,
            "StatusFileSystemUnwritable",
            "status-filesystem",
            status,
        )
        .with_summary(detail)
        .with_send_to_noc(behavior.send_to_noc)
        .with_execution_id(execution_id);

        self.vector.update_alert(alert).await;
        self.liveness
            .record_execution(CALLBACK_NAME, self.interval_ticks, ctx.tick);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suppression::SuppressionCache;
    use crate::timer::CentralTimer;
    use tokio::sync::watch;

    fn ctx(tick: u64) -> TickContext {
        let (_tx, rx) = watch::channel(false);
        TickContext {
            tick,
            correlation_id: format!("tick-{tick:05}-testtest"),
            shutdown: rx,
        }
    }

    fn source(directory: PathBuf) -> (StatusFileSystemSource, Arc<AlertsVector>) {
        let timer = Arc::new(CentralTimer::new(30, 1.0));
        let suppression = Arc::new(SuppressionCache::new(DefaultNocConfig::default()));
        let vector = Arc::new(AlertsVector::new(timer, suppression, 3600));
        (
            StatusFileSystemSource::new(
                directory,
                Arc::clone(&vector),
                Arc::new(LivenessVector::new()),
                DefaultNocConfig::default(),
                60,
            ),
            vector,
        )
    }

    #[tokio::test]
    async fn test_writable_directory_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let (source, vector) = source(dir.path().to_path_buf());

        source.run_probe(ctx(10)).await.unwrap();

        // CANCEL with no prior CREATE leaves the vector empty
        assert!(vector.get(FINGERPRINT).await.is_none());

        // no probe file left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("argus").join("heartbeat");
        let (source, vector) = source(nested.clone());

        source.run_probe(ctx(10)).await.unwrap();
        assert!(nested.is_dir());
        assert!(vector.get(FINGERPRINT).await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unwritable_directory_creates_alert() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let readonly = dir.path().join("readonly");
        std::fs::create_dir(&readonly).unwrap();
        std::fs::set_permissions(&readonly, std::fs::Permissions::from_mode(0o555)).unwrap();

        // root ignores mode bits; the scenario cannot be simulated then
        if std::fs::write(readonly.join("root-check"), b"x").is_ok() {
            return;
        }

        let (source, vector) = source(readonly.clone());
        source.run_probe(ctx(10)).await.unwrap();

        // restore so the tempdir can be cleaned up
        std::fs::set_permissions(&readonly, std::fs::Permissions::from_mode(0o755)).unwrap();

        let alert = vector.get(FINGERPRINT).await.unwrap();
        assert_eq!(alert.status, AlertStatus::Create);
        assert_eq!(alert.priority, PRIORITY_STATUS_FILESYSTEM);
    }
}
