//! NOC HTTP transport: the send and verify endpoints behind a trait so the
//! dispatcher can be exercised without a live NOC.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::NocHttpClientConfig;

use super::payload::{NocPayload, NocVerifyFilter};

/// The two NOC endpoints. `send` is the Phase-1 mutation, `verify` the
/// Phase-2 read-back.
#[async_trait]
pub trait NocTransport: Send + Sync {
    /// POST the payload to the send endpoint. `Ok` means HTTP 200 or 204.
    async fn send(&self, payload: &NocPayload) -> Result<()>;

    /// POST the filter to the verify endpoint and return the stored payload.
    async fn verify(&self, filter: &NocVerifyFilter) -> Result<NocPayload>;
}

/// reqwest-backed transport.
pub struct HttpNocTransport {
    client: reqwest::Client,
    cfg: NocHttpClientConfig,
}

impl HttpNocTransport {
    /// Build the client: request timeout, optional TLS bypass, optional
    /// DNS-free address override for both endpoints.
    ///
    /// # Errors
    /// Returns an error if an endpoint URL or the override address is
    /// malformed, or the client cannot be constructed.
    pub fn new(cfg: NocHttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds.max(1)));

        if cfg.bypass_ssl_validation {
            warn!("NOC client accepts invalid TLS certificates");
            builder = builder.danger_accept_invalid_certs(true);
        }

        if let (Some(ip), Some(port)) = (cfg.connect_ip_address.as_deref(), cfg.connect_port) {
            let ip: IpAddr = ip
                .parse()
                .with_context(|| format!("Invalid connectIpAddress: {ip}"))?;
            let addr = SocketAddr::new(ip, port);
            for endpoint in [&cfg.send_endpoint, &cfg.verify_endpoint] {
                if endpoint.is_empty() {
                    continue;
                }
                let url = reqwest::Url::parse(endpoint)
                    .with_context(|| format!("Invalid NOC endpoint: {endpoint}"))?;
                if let Some(host) = url.host_str() {
                    builder = builder.resolve(host, addr);
                }
            }
        }

        let client = builder.build().context("Failed to build NOC HTTP client")?;
        Ok(Self { client, cfg })
    }

    fn request(&self, endpoint: &str) -> reqwest::RequestBuilder {
        let mut request = self.client.post(endpoint);
        if !self.cfg.username.is_empty() {
            request = request.basic_auth(&self.cfg.username, Some(&self.cfg.password));
        }
        request
    }
}

#[async_trait]
impl NocTransport for HttpNocTransport {
    async fn send(&self, payload: &NocPayload) -> Result<()> {
        debug!(
            suppression_key = %payload.suppression_key,
            level = payload.level,
            "Sending NOC payload"
        );

        let response = self
            .request(&self.cfg.send_endpoint)
            .json(payload)
            .send()
            .await
            .context("NOC send request failed")?;

        let status = response.status();
        if status == reqwest::StatusCode::OK || status == reqwest::StatusCode::NO_CONTENT {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("NOC send returned {status}: {body}")
    }

    async fn verify(&self, filter: &NocVerifyFilter) -> Result<NocPayload> {
        debug!(
            suppression_key = %filter.suppression_key,
            "Verifying NOC payload"
        );

        let response = self
            .request(&self.cfg.verify_endpoint)
            .json(filter)
            .send()
            .await
            .context("NOC verify request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("NOC verify returned {status}: {body}");
        }

        response
            .json::<NocPayload>()
            .await
            .context("Failed to parse NOC verify response")
    }
}
