//! Webhook notifications for discovered subdomains.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use log::debug;
use serde::Serialize;
use sha2::Sha256;
use tokio_util::sync::CancellationToken;

use crate::http_client::HttpClient;
use crate::output::Record;

const EVENT_NAME: &str = "subdomain.discovered";
const SIGNATURE_HEADER: &str = "X-Domain-Recon-Signature";
const EVENT_HEADER: &str = "X-Domain-Recon-Event";

#[derive(Serialize)]
struct WebhookPayload<'a> {
    event: &'static str,
    domain: &'a str,
    record: &'a Record,
    sent_at: chrono::DateTime<Utc>,
    version: &'static str,
}

/// Options for [`WebhookNotifier::new`].
pub struct WebhookOptions {
    pub endpoint: String,
    pub secret: String,
    pub domain: String,
    pub http: Arc<HttpClient>,
}

/// Posts one JSON event per surviving record, optionally signed with
/// HMAC-SHA256 over the exact request body.
pub struct WebhookNotifier {
    endpoint: String,
    secret: String,
    domain: String,
    http: Arc<HttpClient>,
}

impl WebhookNotifier {
    /// Builds a notifier; `Ok(None)` when no endpoint is configured.
    pub fn new(options: WebhookOptions) -> Result<Option<Self>> {
        let endpoint = options.endpoint.trim().to_string();
        if endpoint.is_empty() {
            return Ok(None);
        }
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(anyhow!("webhook endpoint must be an absolute URL"));
        }
        url::Url::parse(&endpoint).map_err(|err| anyhow!("invalid webhook endpoint: {err}"))?;

        Ok(Some(Self {
            endpoint,
            secret: options.secret.trim().to_string(),
            domain: options.domain.trim().to_string(),
            http: options.http,
        }))
    }

    /// Delivers one record. Non-2xx responses are errors.
    pub async fn notify(
        &self,
        cancel: &CancellationToken,
        domain: &str,
        record: &Record,
    ) -> Result<()> {
        let domain = if domain.is_empty() {
            self.domain.as_str()
        } else {
            domain
        };

        let payload = WebhookPayload {
            event: EVENT_NAME,
            domain,
            record,
            sent_at: Utc::now(),
            version: "1",
        };
        let body = serde_json::to_vec(&payload)?;

        let mut headers: Vec<(&str, &str)> = vec![(EVENT_HEADER, EVENT_NAME)];
        let signature;
        if !self.secret.is_empty() {
            signature = sign(&self.secret, &body);
            headers.push((SIGNATURE_HEADER, &signature));
        }

        let response = self
            .http
            .post_json(cancel, &self.endpoint, &headers, body)
            .await?;
        if !response.is_success() {
            return Err(anyhow!("webhook responded with status {}", response.status));
        }

        debug!("webhook delivered for {} ({domain})", record.subdomain);
        Ok(())
    }
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
