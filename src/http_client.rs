//! Shared HTTP transport for passive sources, probing, export, and webhooks.
//!
//! The transport is layered inside-out, mirroring how every outbound HTTP
//! call in the pipeline behaves:
//!
//! 1. base `reqwest` client: connection reuse, proxy from environment,
//!    5 s dial timeout, 30 s keep-alive, 90 s idle timeout, HTTP/2;
//! 2. retry: GETs retry transport errors and 5xx responses up to three
//!    attempts with exponential backoff (200 ms base);
//! 3. coalescing: concurrent GETs for the same URL share one upstream
//!    request whose buffered body is replayed to every waiter;
//! 4. rate gate: when a limiter is configured, every request acquires a
//!    token before anything else happens.
//!
//! Coalesced bodies are buffered in memory and capped at 4 MiB; a larger
//! upstream response fails the request for all waiters.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::future::Shared;
use futures::FutureExt;
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::ratelimit::RateLimiter;

const MAX_BUFFERED_BODY: usize = 4 * 1024 * 1024;
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// A fully buffered HTTP response, safe to replay to multiple waiters.
#[derive(Debug)]
pub struct BufferedResponse {
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    pub body: Vec<u8>,
}

impl BufferedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

type SharedResponse = Result<Arc<BufferedResponse>, Arc<anyhow::Error>>;
type InflightFuture = Shared<Pin<Box<dyn Future<Output = SharedResponse> + Send>>>;

/// Options for [`HttpClient::new`].
pub struct HttpClientOptions {
    pub timeout: Duration,
    pub user_agent: String,
    pub limiter: Option<Arc<RateLimiter>>,
}

/// The shared transport. Cheap to clone via `Arc`.
pub struct HttpClient {
    inner: reqwest::Client,
    limiter: Option<Arc<RateLimiter>>,
    inflight: tokio::sync::Mutex<HashMap<String, InflightFuture>>,
}

impl HttpClient {
    pub fn new(options: HttpClientOptions) -> Result<Arc<Self>> {
        let timeout = if options.timeout.is_zero() {
            Duration::from_secs(30)
        } else {
            options.timeout
        };

        let inner = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(timeout)
            .user_agent(options.user_agent)
            .build()
            .context("building HTTP client")?;

        Ok(Arc::new(Self {
            inner,
            limiter: options.limiter,
            inflight: tokio::sync::Mutex::new(HashMap::new()),
        }))
    }

    /// Rate-gated, coalesced, retried GET.
    pub async fn get(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        url: &str,
    ) -> Result<Arc<BufferedResponse>> {
        self.get_with_headers(cancel, url, &[]).await
    }

    /// GET with extra request headers. Requests for the same URL coalesce
    /// onto a single upstream call regardless of headers, so per-request
    /// headers are only honoured by the flight that goes upstream.
    pub async fn get_with_headers(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<Arc<BufferedResponse>> {
        self.acquire_token(cancel).await?;

        let key = format!("GET {url}");
        let flight = {
            let mut inflight = self.inflight.lock().await;
            if let Some(existing) = inflight.get(&key) {
                existing.clone()
            } else {
                // The upstream request runs on its own task so that one
                // waiter going away does not cancel its peers.
                let client = self.inner.clone();
                let request_url = url.to_string();
                let owned_headers: Vec<(String, String)> = headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                let run_cancel = cancel.clone();
                let handle = tokio::spawn(async move {
                    get_with_retry(client, request_url, owned_headers, run_cancel).await
                });

                let future: InflightFuture = async move {
                    match handle.await {
                        Ok(Ok(resp)) => Ok(Arc::new(resp)),
                        Ok(Err(err)) => Err(Arc::new(err)),
                        Err(join_err) => Err(Arc::new(anyhow!("request task failed: {join_err}"))),
                    }
                }
                .boxed()
                .shared();
                inflight.insert(key.clone(), future.clone());
                future
            }
        };

        let result = flight.await;
        self.inflight.lock().await.remove(&key);

        result.map_err(|err| anyhow!("{err}"))
    }

    /// Rate-gated JSON POST. POSTs are neither retried nor coalesced here;
    /// callers that need retry (the exporter) implement their own policy.
    pub async fn post_json(
        &self,
        cancel: &CancellationToken,
        url: &str,
        headers: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<BufferedResponse> {
        self.acquire_token(cancel).await?;

        let mut request = self
            .inner
            .post(url)
            .header("Content-Type", "application/json")
            .body(body);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request.send().await.context("sending POST request")?;
        buffer_response(response).await
    }

    async fn acquire_token(&self, cancel: &CancellationToken) -> Result<()> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire(cancel).await?;
        }
        Ok(())
    }
}

async fn get_with_retry(
    client: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
    cancel: CancellationToken,
) -> Result<BufferedResponse> {
    let mut last_err: Option<anyhow::Error> = None;
    let mut last_resp: Option<BufferedResponse> = None;

    for attempt in 0..RETRY_ATTEMPTS {
        if attempt > 0 {
            let backoff = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => {
                    return Err(last_err.unwrap_or_else(|| anyhow!("request cancelled")));
                }
            }
        }

        let mut request = client.get(&url);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }

        match request.send().await {
            Ok(response) => match buffer_response(response).await {
                Ok(buffered) => {
                    if buffered.status < 500 {
                        return Ok(buffered);
                    }
                    debug!("GET {url} returned {} (attempt {})", buffered.status, attempt + 1);
                    last_resp = Some(buffered);
                    last_err = None;
                }
                Err(err) => {
                    debug!("GET {url} body read failed (attempt {}): {err}", attempt + 1);
                    last_err = Some(err);
                }
            },
            Err(err) => {
                debug!("GET {url} failed (attempt {}): {err}", attempt + 1);
                last_err = Some(err.into());
            }
        }
    }

    if let Some(resp) = last_resp {
        return Ok(resp);
    }
    Err(last_err.unwrap_or_else(|| anyhow!("GET {url} failed")))
}

async fn buffer_response(response: reqwest::Response) -> Result<BufferedResponse> {
    let status = response.status().as_u16();
    let headers = response.headers().clone();

    let mut body = Vec::new();
    let mut stream = response;
    while let Some(chunk) = stream.chunk().await.context("reading response body")? {
        if body.len() + chunk.len() > MAX_BUFFERED_BODY {
            return Err(anyhow!(
                "response body exceeds {} byte buffer limit",
                MAX_BUFFERED_BODY
            ));
        }
        body.extend_from_slice(&chunk);
    }

    Ok(BufferedResponse {
        status,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn client() -> Arc<HttpClient> {
        HttpClient::new(HttpClientOptions {
            timeout: Duration::from_secs(5),
            user_agent: "domain_recon-test".into(),
            limiter: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn get_buffers_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let http = client();
        let cancel = CancellationToken::new();
        let resp = http
            .get(&cancel, &format!("{}/data", server.uri()))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hello");
    }

    #[tokio::test]
    async fn get_retries_5xx_then_succeeds() {
        struct FlakyResponder {
            calls: AtomicUsize,
        }
        impl Respond for FlakyResponder {
            fn respond(&self, _req: &Request) -> ResponseTemplate {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    ResponseTemplate::new(502)
                } else {
                    ResponseTemplate::new(200).set_body_string("recovered")
                }
            }
        }

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(FlakyResponder {
                calls: AtomicUsize::new(0),
            })
            .expect(2)
            .mount(&server)
            .await;

        let http = client();
        let cancel = CancellationToken::new();
        let resp = http
            .get(&cancel, &format!("{}/flaky", server.uri()))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.text(), "recovered");
    }

    #[tokio::test]
    async fn get_returns_last_5xx_after_exhaustion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let http = client();
        let cancel = CancellationToken::new();
        let resp = http
            .get(&cancel, &format!("{}/down", server.uri()))
            .await
            .unwrap();
        assert_eq!(resp.status, 503);
    }

    #[tokio::test]
    async fn concurrent_gets_coalesce_to_one_upstream_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("shared")
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let http = client();
        let cancel = CancellationToken::new();
        let url = format!("{}/slow", server.uri());

        let (a, b) = tokio::join!(http.get(&cancel, &url), http.get(&cancel, &url));
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.body, b.body);
        assert_eq!(a.text(), "shared");
    }

    #[tokio::test]
    async fn post_json_sends_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .and(wiremock::matchers::header("Authorization", "Bearer k"))
            .and(wiremock::matchers::body_string("{\"a\":1}"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let http = client();
        let cancel = CancellationToken::new();
        let resp = http
            .post_json(
                &cancel,
                &format!("{}/ingest", server.uri()),
                &[("Authorization", "Bearer k")],
                b"{\"a\":1}".to_vec(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 201);
        assert!(resp.is_success());
    }
}
