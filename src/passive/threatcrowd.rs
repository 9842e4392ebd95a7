//! ThreatCrowd domain report source.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::http_client::HttpClient;

use super::certtransparency::urlencode;
use super::Source;

const DEFAULT_BASE_URL: &str = "https://www.threatcrowd.org/searchApi/v2/domain/report/";

#[derive(Deserialize)]
struct Report {
    #[serde(default)]
    response: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    subdomains: Vec<String>,
}

pub struct ThreatCrowdClient {
    http: Arc<HttpClient>,
    base_url: String,
}

impl ThreatCrowdClient {
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
impl Source for ThreatCrowdClient {
    fn name(&self) -> &'static str {
        "threatcrowd"
    }

    async fn enumerate(&self, cancel: &CancellationToken, domain: &str) -> Result<Vec<String>> {
        let domain = domain.trim();
        if domain.is_empty() {
            return Err(anyhow!("domain cannot be empty"));
        }

        let endpoint = format!(
            "{}?domain={}",
            self.base_url.trim_end_matches('/'),
            urlencode(domain)
        );
        let response = self.http.get(cancel, &endpoint).await?;
        if response.status != 200 {
            return Err(anyhow!("threatcrowd unexpected status: {}", response.status));
        }

        let report: Report =
            serde_json::from_slice(&response.body).context("decoding threatcrowd response")?;

        if report.response.eq_ignore_ascii_case("error") {
            let message = report.message.trim();
            let message = if message.is_empty() {
                "unknown error"
            } else {
                message
            };
            return Err(anyhow!("threatcrowd error: {message}"));
        }

        let mut subdomains = std::collections::BTreeSet::new();
        for subdomain in report.subdomains {
            let name = subdomain.trim().to_ascii_lowercase();
            if !name.is_empty() {
                subdomains.insert(name);
            }
        }
        Ok(subdomains.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::HttpClientOptions;
    use std::time::Duration;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http() -> Arc<HttpClient> {
        HttpClient::new(HttpClientOptions {
            timeout: Duration::from_secs(5),
            user_agent: "domain_recon-test".into(),
            limiter: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn enumerate_parses_subdomain_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("domain", "example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"response":"1","subdomains":["API.example.com","www.example.com",""]}"#,
            ))
            .mount(&server)
            .await;

        let client = ThreatCrowdClient::new(http()).with_base_url(&server.uri());
        let cancel = CancellationToken::new();
        let result = client.enumerate(&cancel, "example.com").await.unwrap();
        assert_eq!(result, vec!["api.example.com", "www.example.com"]);
    }

    #[tokio::test]
    async fn enumerate_surfaces_api_error_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"response":"error","message":"domain not found"}"#),
            )
            .mount(&server)
            .await;

        let client = ThreatCrowdClient::new(http()).with_base_url(&server.uri());
        let cancel = CancellationToken::new();
        let err = client.enumerate(&cancel, "example.com").await.unwrap_err();
        assert!(err.to_string().contains("domain not found"));
    }
}
