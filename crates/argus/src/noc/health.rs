//! NOC circuit breaker: one consecutive-failure counter shared by the alert
//! dispatcher and the heartbeat service.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{info, warn};

/// Breaker state for the status readers and the heartbeat file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NocHealthStatus {
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
}

/// Binary healthy/tripped signal over a consecutive-failure counter.
pub struct NocHealth {
    consecutive_failures: AtomicU32,
    failure_threshold: u32,
}

impl NocHealth {
    #[must_use]
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Record one failed NOC round-trip. Logs when the breaker trips.
    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures == self.failure_threshold {
            warn!(
                consecutive_failures = failures,
                threshold = self.failure_threshold,
                "NOC circuit breaker tripped"
            );
        }
    }

    /// Any success resets the counter. Logs when the breaker recovers.
    pub fn record_success(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
        if previous >= self.failure_threshold {
            info!(
                previous_failures = previous,
                "NOC circuit breaker recovered"
            );
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures.load(Ordering::SeqCst) < self.failure_threshold
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn status(&self) -> NocHealthStatus {
        NocHealthStatus {
            is_healthy: self.is_healthy(),
            consecutive_failures: self.consecutive_failures(),
            failure_threshold: self.failure_threshold,
        }
    }
}
