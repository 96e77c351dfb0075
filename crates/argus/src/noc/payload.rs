//! NOC wire payload and the runtime overrides applied before serialization.

use serde::{Deserialize, Serialize};

use crate::alerts::{Alert, AlertStatus};
use crate::config::NocHttpClientConfig;

/// Wire level for a firing alert.
pub const LEVEL_CREATE: i32 = 3;
/// Wire level for a resolved alert. The receiver treats 0 as "close".
pub const LEVEL_CANCEL: i32 = 0;

/// Payload POSTed to the NOC send endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NocPayload {
    #[serde(default)]
    pub custom1: String,
    #[serde(default)]
    pub custom2: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub level: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub suppression_key: String,
    #[serde(default)]
    pub visible: bool,
}

/// Filter POSTed to the verify endpoint: the payload shape plus the
/// `userTga` fields, always sent empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NocVerifyFilter {
    pub custom1: String,
    pub custom2: String,
    pub host_name: String,
    pub level: i32,
    pub message: String,
    pub severity: String,
    pub source: String,
    pub suppression_key: String,
    pub visible: bool,
    #[serde(rename = "userTga1")]
    pub user_tga1: String,
    #[serde(rename = "userTga2")]
    pub user_tga2: String,
    #[serde(rename = "userTga3")]
    pub user_tga3: String,
}

impl From<&NocPayload> for NocVerifyFilter {
    fn from(p: &NocPayload) -> Self {
        Self {
            custom1: p.custom1.clone(),
            custom2: p.custom2.clone(),
            host_name: p.host_name.clone(),
            level: p.level,
            message: p.message.clone(),
            severity: p.severity.clone(),
            source: p.source.clone(),
            suppression_key: p.suppression_key.clone(),
            visible: p.visible,
            user_tga1: String::new(),
            user_tga2: String::new(),
            user_tga3: String::new(),
        }
    }
}

impl NocPayload {
    /// Build the wire payload for an alert: the alert's template with the
    /// runtime overrides applied, then empty identity fields filled from
    /// configuration.
    #[must_use]
    pub fn for_alert(alert: &Alert, cfg: &NocHttpClientConfig) -> Self {
        let mut payload = alert.payload.clone();
        payload.level = match alert.status {
            AlertStatus::Create => LEVEL_CREATE,
            AlertStatus::Cancel => LEVEL_CANCEL,
        };
        payload.message = alert.wire_message().to_string();
        payload.source = alert.source.clone();
        payload.suppression_key = alert.fingerprint.clone();
        payload.fill_defaults(cfg);
        payload
    }

    /// Fill empty `custom1`/`custom2`/`hostName` from configuration.
    pub fn fill_defaults(&mut self, cfg: &NocHttpClientConfig) {
        if self.custom1.is_empty() {
            self.custom1 = cfg.team_name.clone();
        }
        if self.custom2.is_empty() {
            self.custom2 = cfg.system_name.clone();
        }
        if self.host_name.is_empty() {
            self.host_name = cfg.host_name.clone();
        }
    }

    /// Phase-2 comparison: only `suppressionKey`, `level` and `source` must
    /// match between what was sent and what the NOC stored.
    #[must_use]
    pub fn comparison_matches(sent: &Self, received: &Self) -> bool {
        sent.suppression_key == received.suppression_key
            && sent.level == received.level
            && sent.source == received.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_cfg() -> NocHttpClientConfig {
        NocHttpClientConfig {
            team_name: "team".to_string(),
            system_name: "system".to_string(),
            host_name: "host".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_overrides_for_create() {
        let alert = Alert::new("fp-1", 0, "HighLatency", "prometheus", AlertStatus::Create)
            .with_summary("latency high")
            .with_description("p99 above threshold");
        let payload = NocPayload::for_alert(&alert, &client_cfg());

        assert_eq!(payload.level, LEVEL_CREATE);
        assert_eq!(payload.message, "p99 above threshold");
        assert_eq!(payload.source, "prometheus");
        assert_eq!(payload.suppression_key, "fp-1");
        assert_eq!(payload.custom1, "team");
        assert_eq!(payload.custom2, "system");
        assert_eq!(payload.host_name, "host");
    }

    #[test]
    fn test_overrides_for_cancel() {
        let alert = Alert::new("fp-1", 0, "HighLatency", "prometheus", AlertStatus::Cancel)
            .with_summary("resolved");
        let payload = NocPayload::for_alert(&alert, &client_cfg());
        assert_eq!(payload.level, LEVEL_CANCEL);
        assert_eq!(payload.message, "resolved");
    }

    #[test]
    fn test_template_fields_survive() {
        let template = NocPayload {
            custom1: "explicit".to_string(),
            severity: "critical".to_string(),
            visible: true,
            ..Default::default()
        };

        let alert =
            Alert::new("fp", 0, "n", "s", AlertStatus::Create).with_payload(template);
        let payload = NocPayload::for_alert(&alert, &client_cfg());

        // explicit template values are not overwritten by config defaults
        assert_eq!(payload.custom1, "explicit");
        assert_eq!(payload.severity, "critical");
        assert!(payload.visible);
    }

    #[test]
    fn test_comparison() {
        let sent = NocPayload {
            suppression_key: "fp".to_string(),
            level: 3,
            source: "argus".to_string(),
            message: "a".to_string(),
            ..Default::default()
        };
        let mut received = sent.clone();
        received.message = "receiver rewrote this".to_string();
        assert!(NocPayload::comparison_matches(&sent, &received));

        received.suppression_key = "other".to_string();
        assert!(!NocPayload::comparison_matches(&sent, &received));
    }

    #[test]
    fn test_verify_filter_serialization() {
        let filter = NocVerifyFilter::from(&NocPayload {
            suppression_key: "fp".to_string(),
            ..Default::default()
        });
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json["userTga1"], "");
        assert_eq!(json["userTga2"], "");
        assert_eq!(json["userTga3"], "");
        assert_eq!(json["suppressionKey"], "fp");
        assert_eq!(json["hostName"], "");
    }
}
