//! Alert record carried end-to-end, from source ingestion to the NOC send.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::noc::payload::NocPayload;

/// Fixed priorities for the infrastructure alerts. Lower is more urgent;
/// Prometheus-pushed alerts use 0 and above.
pub const PRIORITY_K8S_API: i32 = -10;
pub const PRIORITY_PROMETHEUS_POD: i32 = -9;
pub const PRIORITY_KSM_POD: i32 = -8;
pub const PRIORITY_WATCHDOG: i32 = -7;
pub const PRIORITY_STATUS_FILESYSTEM: i32 = -6;

/// Firing/resolved status, mapped to distinct wire levels (3/0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertStatus {
    Create,
    Cancel,
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Cancel => write!(f, "CANCEL"),
        }
    }
}

/// A structured health assertion with a stable fingerprint.
///
/// The fingerprint is the primary key in the alerts vector and becomes the
/// NOC `suppressionKey` on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub fingerprint: String,
    /// Lower is more urgent; infrastructure alerts are negative
    pub priority: i32,
    pub name: String,
    pub source: String,
    pub status: AlertStatus,
    pub summary: String,
    pub description: String,
    /// NOC payload template; runtime overrides are applied at dispatch
    pub payload: NocPayload,
    pub send_to_noc: bool,
    /// Explicit suppression window; `None` falls back to the annotation and
    /// then the per-status default
    #[serde(skip)]
    pub suppress_window: Option<Duration>,
    /// Creation wall clock
    pub timestamp: DateTime<Utc>,
    pub last_seen_tick: u64,
    pub last_seen_timestamp: DateTime<Utc>,
    /// Assigned once on first ingestion by a source; travels unchanged to
    /// the NOC send
    pub execution_id: String,
    pub annotations: HashMap<String, String>,
}

impl Alert {
    /// Create an alert with the required identity fields. Everything else
    /// starts empty and is filled by the builder methods.
    #[must_use]
    pub fn new(
        fingerprint: impl Into<String>,
        priority: i32,
        name: impl Into<String>,
        source: impl Into<String>,
        status: AlertStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            fingerprint: fingerprint.into(),
            priority,
            name: name.into(),
            source: source.into(),
            status,
            summary: String::new(),
            description: String::new(),
            payload: NocPayload::default(),
            send_to_noc: true,
            suppress_window: None,
            timestamp: now,
            last_seen_tick: 0,
            last_seen_timestamp: now,
            execution_id: String::new(),
            annotations: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self
    }

    #[must_use]
    pub fn with_send_to_noc(mut self, send_to_noc: bool) -> Self {
        self.send_to_noc = send_to_noc;
        self
    }

    #[must_use]
    pub fn with_suppress_window(mut self, window: Option<Duration>) -> Self {
        self.suppress_window = window;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: NocPayload) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_annotations(mut self, annotations: HashMap<String, String>) -> Self {
        self.annotations = annotations;
        self
    }

    /// Wire message: description preferred, summary as fallback.
    #[must_use]
    pub fn wire_message(&self) -> &str {
        if self.description.is_empty() {
            &self.summary
        } else {
            &self.description
        }
    }
}
