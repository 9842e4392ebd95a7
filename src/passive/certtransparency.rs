//! Certificate transparency source (crt.sh).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::http_client::HttpClient;

use super::Source;

const DEFAULT_BASE_URL: &str = "https://crt.sh";
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Deserialize)]
struct CtEntry {
    #[serde(default)]
    name_value: String,
}

/// Queries the crt.sh JSON endpoint for certificates under the apex.
///
/// 429 responses honor `Retry-After`; 5xx responses retry with exponential
/// backoff up to the configured attempt count.
pub struct CertTransparencyClient {
    http: Arc<HttpClient>,
    base_url: String,
    max_retries: u32,
    initial_backoff: Duration,
}

impl CertTransparencyClient {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        if !base_url.is_empty() {
            self.base_url = base_url.trim_end_matches('/').to_string();
        }
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        if !backoff.is_zero() {
            self.initial_backoff = backoff;
        }
        self
    }
}

#[async_trait]
impl Source for CertTransparencyClient {
    fn name(&self) -> &'static str {
        "crt.sh"
    }

    async fn enumerate(&self, cancel: &CancellationToken, domain: &str) -> Result<Vec<String>> {
        let domain = domain.trim();
        if domain.is_empty() {
            return Err(anyhow!("domain cannot be empty"));
        }

        let endpoint = format!(
            "{}/?q=%25.{}&output=json",
            self.base_url,
            urlencode(domain)
        );

        let mut backoff = self.initial_backoff;
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => backoff *= 2,
                    _ = cancel.cancelled() => return Err(anyhow!("cancelled")),
                }
            }

            match self.http.get(cancel, &endpoint).await {
                Ok(response) => match response.status {
                    200 => return parse_response(&response.body, domain),
                    429 => {
                        last_err = Some(anyhow!("received 429 Too Many Requests from crt.sh"));
                        if let Some(delay) = response
                            .header("Retry-After")
                            .and_then(parse_retry_after)
                        {
                            backoff = delay;
                        }
                    }
                    status @ (500 | 502 | 503 | 504) => {
                        last_err = Some(anyhow!("received {status} response from crt.sh"));
                    }
                    status => {
                        return Err(anyhow!("unexpected status code {status} from crt.sh"));
                    }
                },
                Err(err) => {
                    if cancel.is_cancelled() {
                        return Err(err);
                    }
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("failed to fetch certificate transparency data")))
    }
}

/// Parses the crt.sh JSON array. Wildcard names are dropped and only hosts
/// under the apex (or the apex itself) are kept.
fn parse_response(body: &[u8], domain: &str) -> Result<Vec<String>> {
    let entries: Vec<CtEntry> =
        serde_json::from_slice(body).context("decoding crt.sh response")?;

    let suffix = format!(".{}", domain.trim_start_matches('.'));
    let mut subdomains = std::collections::BTreeSet::new();

    for entry in entries {
        for name in entry.name_value.lines() {
            let name = name.trim().to_ascii_lowercase();
            if name.is_empty() || name.contains('*') {
                continue;
            }
            if !name.ends_with(&suffix) && name != domain {
                continue;
            }
            subdomains.insert(name);
        }
    }

    Ok(subdomains.into_iter().collect())
}

fn parse_retry_after(header: &str) -> Option<Duration> {
    header.trim().parse::<u64>().map(Duration::from_secs).ok()
}

pub(crate) fn urlencode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}
