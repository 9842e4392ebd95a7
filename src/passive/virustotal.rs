//! VirusTotal subdomains source (paginated v3 API, API-key auth).

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::http_client::HttpClient;

use super::Source;

const DEFAULT_BASE_URL: &str = "https://www.virustotal.com";
const PAGE_LIMIT: u32 = 40;

#[derive(Deserialize, Default)]
struct VtResponse {
    #[serde(default)]
    data: Vec<VtEntry>,
    #[serde(default)]
    links: VtLinks,
    #[serde(default)]
    error: Option<VtError>,
}

#[derive(Deserialize)]
struct VtEntry {
    #[serde(default)]
    id: String,
}

#[derive(Deserialize, Default)]
struct VtLinks {
    #[serde(default)]
    next: String,
}

#[derive(Deserialize)]
struct VtError {
    #[serde(default)]
    message: String,
}

pub struct VirusTotalClient {
    api_key: String,
    http: Arc<HttpClient>,
    base_url: String,
}

impl VirusTotalClient {
    pub fn new(api_key: &str, http: Arc<HttpClient>) -> Self {
        Self {
            api_key: api_key.trim().to_string(),
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        if !base_url.is_empty() {
            self.base_url = base_url.trim_end_matches('/').to_string();
        }
        self
    }
}

#[async_trait]
impl Source for VirusTotalClient {
    fn name(&self) -> &'static str {
        "virustotal"
    }

    async fn enumerate(&self, cancel: &CancellationToken, domain: &str) -> Result<Vec<String>> {
        let domain = domain.trim();
        if domain.is_empty() {
            return Err(anyhow!("domain cannot be empty"));
        }
        if self.api_key.is_empty() {
            return Err(anyhow!("virustotal api key is required"));
        }

        let mut endpoint = format!(
            "{}/api/v3/domains/{domain}/subdomains?limit={PAGE_LIMIT}",
            self.base_url
        );
        let mut subdomains = std::collections::BTreeSet::new();

        while !endpoint.is_empty() {
            if cancel.is_cancelled() {
                return Err(anyhow!("cancelled"));
            }

            let response = self
                .http
                .get_with_headers(cancel, &endpoint, &[("x-apikey", &self.api_key)])
                .await?;

            let parsed: VtResponse =
                serde_json::from_slice(&response.body).context("decoding virustotal response")?;

            if response.status != 200 {
                if let Some(error) = parsed.error {
                    if !error.message.is_empty() {
                        return Err(anyhow!("virustotal error: {}", error.message));
                    }
                }
                return Err(anyhow!("virustotal unexpected status: {}", response.status));
            }

            for entry in parsed.data {
                let name = entry.id.trim().to_ascii_lowercase();
                if !name.is_empty() {
                    subdomains.insert(name);
                }
            }

            endpoint = parsed.links.next.trim().to_string();
        }

        Ok(subdomains.into_iter().collect())
    }
}
