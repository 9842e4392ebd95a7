//! HackerTarget hostsearch source (CSV lines of `host,ip`).

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::http_client::HttpClient;

use super::certtransparency::urlencode;
use super::Source;

const DEFAULT_BASE_URL: &str = "https://api.hackertarget.com/hostsearch/";

pub struct HackerTargetClient {
    http: Arc<HttpClient>,
    base_url: String,
}

impl HackerTargetClient {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        if !base_url.is_empty() {
            self.base_url = format!("{}/", base_url.trim_end_matches('/'));
        }
        self
    }
}

#[async_trait]
impl Source for HackerTargetClient {
    fn name(&self) -> &'static str {
        "hackertarget"
    }

    async fn enumerate(&self, cancel: &CancellationToken, domain: &str) -> Result<Vec<String>> {
        let domain = domain.trim();
        if domain.is_empty() {
            return Err(anyhow!("domain cannot be empty"));
        }

        let endpoint = format!(
            "{}?q={}",
            self.base_url.trim_end_matches('/'),
            urlencode(domain)
        );
        let response = self.http.get(cancel, &endpoint).await?;
        if response.status != 200 {
            return Err(anyhow!("hackertarget unexpected status: {}", response.status));
        }

        Ok(parse_response(&response.text()))
    }
}

fn parse_response(body: &str) -> Vec<String> {
    let mut subdomains = std::collections::BTreeSet::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let name = line
            .split(',')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if !name.is_empty() {
            subdomains.insert(name);
        }
    }
    subdomains.into_iter().collect()
}
