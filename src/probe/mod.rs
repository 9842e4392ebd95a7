//! HTTP/HTTPS probing of discovered hostnames.

mod screenshot;

use std::path::PathBuf;
use std::sync::Arc;

use log::debug;
use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;

use crate::http_client::HttpClient;
use crate::output::HttpService;

const DEFAULT_MAX_BODY_SIZE: usize = 512 * 1024;
const SNIPPET_LIMIT: usize = 160;

/// Options for [`ProbeClient::new`].
pub struct ProbeOptions {
    pub http: Arc<HttpClient>,
    pub max_body_size: usize,
    /// Directory for rendered PNG summaries; `None` disables screenshots.
    pub screenshot_dir: Option<PathBuf>,
}

/// Fetches `http://host` and `https://host` and extracts service metadata.
pub struct ProbeClient {
    http: Arc<HttpClient>,
    max_body_size: usize,
    screenshot_dir: Option<PathBuf>,
}

impl ProbeClient {
    pub fn new(options: ProbeOptions) -> Self {
        let screenshot_dir = options.screenshot_dir.filter(|dir| {
            if let Err(err) = std::fs::create_dir_all(dir) {
                debug!("creating screenshot dir {}: {err}", dir.display());
                return false;
            }
            true
        });

        Self {
            http: options.http,
            max_body_size: if options.max_body_size == 0 {
                DEFAULT_MAX_BODY_SIZE
            } else {
                options.max_body_size
            },
            screenshot_dir,
        }
    }

    /// Probes both schemes for one hostname. Transport failures produce a
    /// service entry with `error` set rather than being dropped.
    pub async fn probe(&self, cancel: &CancellationToken, hostname: &str) -> Vec<HttpService> {
        let hostname = hostname.trim();
        if hostname.is_empty() {
            return Vec::new();
        }

        let mut services = Vec::with_capacity(2);
        for scheme in ["http", "https"] {
            let url = format!("{scheme}://{hostname}");

            let mut service = match self.http.get(cancel, &url).await {
                Ok(response) => {
                    let banner = response
                        .header("Server")
                        .map(str::trim)
                        .unwrap_or_default()
                        .to_string();
                    let body = &response.body[..response.body.len().min(self.max_body_size)];

                    let mut service = HttpService {
                        url: url.clone(),
                        status_code: response.status,
                        banner,
                        ..HttpService::default()
                    };
                    if !body.is_empty() {
                        let text = String::from_utf8_lossy(body);
                        service.title = extract_title(&text);
                        service.snippet = extract_snippet(&text, SNIPPET_LIMIT);
                    }
                    service
                }
                Err(err) => HttpService {
                    url: url.clone(),
                    error: err.to_string(),
                    ..HttpService::default()
                },
            };

            if let Some(dir) = &self.screenshot_dir {
                match screenshot::capture(dir, hostname, scheme, &service) {
                    Ok(path) => service.screenshot_path = path,
                    Err(err) => {
                        let message = format!("screenshot: {err}");
                        if service.error.is_empty() {
                            service.error = message;
                        } else {
                            service.error = format!("{}; {message}", service.error);
                        }
                    }
                }
            }

            services.push(service);
        }

        services
    }
}

/// First `<title>` content with entities decoded and whitespace collapsed.
fn extract_title(body: &str) -> String {
    let document = Html::parse_document(body);
    let selector = Selector::parse("title").expect("static selector");
    document
        .select(&selector)
        .next()
        .map(|element| collapse_whitespace(&element.text().collect::<String>()))
        .unwrap_or_default()
}

/// Body truncated to `limit` code points with whitespace collapsed.
fn extract_snippet(body: &str, limit: usize) -> String {
    if limit == 0 || body.is_empty() {
        return String::new();
    }
    let collapsed = collapse_whitespace(body);
    collapsed.chars().take(limit).collect::<String>().trim().to_string()
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::HttpClientOptions;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn title_is_decoded_and_collapsed() {
        let body = "<html><head><title>\n  Hello &amp;\n   World </title></head></html>";
        assert_eq!(extract_title(body), "Hello & World");
        assert_eq!(extract_title("<html><body>no title</body></html>"), "");
    }

    #[test]
    fn snippet_truncates_by_code_points() {
        let body = "a  b\n\nc   d";
        assert_eq!(extract_snippet(body, 160), "a b c d");
        assert_eq!(extract_snippet(body, 3), "a b");
        assert_eq!(extract_snippet("", 160), "");
        assert_eq!(extract_snippet("abc", 0), "");
    }

    #[tokio::test]
    async fn probe_populates_status_banner_and_title() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Server", " nginx/1.24 ")
                    .set_body_string("<html><title>Login</title><body>hi</body></html>"),
            )
            .mount(&server)
            .await;

        let http = HttpClient::new(HttpClientOptions {
            timeout: Duration::from_secs(5),
            user_agent: "domain_recon-test".into(),
            limiter: None,
        })
        .unwrap();
        let client = ProbeClient::new(ProbeOptions {
            http,
            max_body_size: 0,
            screenshot_dir: None,
        });

        let cancel = CancellationToken::new();
        // Probe the mock server host:port directly; only the http scheme
        // will connect, https against a plain HTTP listener errors out.
        let host = server.uri().trim_start_matches("http://").to_string();
        let services = client.probe(&cancel, &host).await;

        assert_eq!(services.len(), 2);
        let http_service = &services[0];
        assert_eq!(http_service.status_code, 200);
        assert_eq!(http_service.banner, "nginx/1.24");
        assert_eq!(http_service.title, "Login");
        assert!(http_service.snippet.contains("Login"));

        let https_service = &services[1];
        assert!(https_service.status_code == 0 || !https_service.error.is_empty());
    }

    #[tokio::test]
    async fn probe_empty_hostname_yields_nothing() {
        let http = HttpClient::new(HttpClientOptions {
            timeout: Duration::from_secs(1),
            user_agent: "domain_recon-test".into(),
            limiter: None,
        })
        .unwrap();
        let client = ProbeClient::new(ProbeOptions {
            http,
            max_body_size: 0,
            screenshot_dir: None,
        });
        let cancel = CancellationToken::new();
        assert!(client.probe(&cancel, "  ").await.is_empty());
    }
}
