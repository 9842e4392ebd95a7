//! Resolver facade: per-host fan-out of the typed DNS lookups.
//!
//! A [`Resolution`] aggregates A/AAAA/CNAME/MX/TXT/NS answers for one
//! hostname. Partial lookup failures are discarded as long as at least one
//! record was produced; only a completely failed resolution carries an
//! error. `resolve_many` and `resolve_stream` run a worker pool over
//! bounded channels so the pipeline can stream hostnames straight from the
//! passive aggregator.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::dns::{DnsClient, DnsClientOptions, DnsError};
use crate::ratelimit::RateLimiter;

/// Built-in upstream servers appended after any caller-supplied server.
pub const DEFAULT_DNS_SERVERS: [&str; 3] = ["8.8.8.8:53", "1.1.1.1:53", "9.9.9.9:53"];

/// DNS records discovered for a single hostname.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub subdomain: String,
    /// Union of the A and AAAA answers, deduplicated and sorted.
    pub ip_addresses: Vec<String>,
    /// Record type (upper case) to sorted values.
    pub dns_records: BTreeMap<String, Vec<String>>,
    /// Set only when every lookup failed and nothing was resolved.
    pub error: Option<String>,
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        !self.ip_addresses.is_empty() || !self.dns_records.is_empty()
    }
}

/// The typed lookups the facade needs; [`DnsClient`] is the production
/// implementation and tests substitute stubs.
#[async_trait]
pub trait LookupBackend: Send + Sync {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;
    async fn lookup_cname(&self, host: &str) -> Result<Option<String>, DnsError>;
    async fn lookup_mx(&self, host: &str) -> Result<Vec<(u16, String)>, DnsError>;
    async fn lookup_txt(&self, host: &str) -> Result<Vec<String>, DnsError>;
    async fn lookup_ns(&self, host: &str) -> Result<Vec<String>, DnsError>;
}

#[async_trait]
impl LookupBackend for DnsClient {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        DnsClient::lookup_ip(self, host).await
    }
    async fn lookup_cname(&self, host: &str) -> Result<Option<String>, DnsError> {
        DnsClient::lookup_cname(self, host).await
    }
    async fn lookup_mx(&self, host: &str) -> Result<Vec<(u16, String)>, DnsError> {
        DnsClient::lookup_mx(self, host).await
    }
    async fn lookup_txt(&self, host: &str) -> Result<Vec<String>, DnsError> {
        DnsClient::lookup_txt(self, host).await
    }
    async fn lookup_ns(&self, host: &str) -> Result<Vec<String>, DnsError> {
        DnsClient::lookup_ns(self, host).await
    }
}

/// Options for [`Resolver::new`].
#[derive(Default)]
pub struct ResolverOptions {
    /// Optional custom server (`host` or `host:port`), tried before the
    /// built-in defaults.
    pub server: Option<String>,
    pub timeout: Duration,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub cache_enabled: bool,
    pub cache_size: usize,
}

/// Resolver facade over a [`LookupBackend`].
pub struct Resolver {
    backend: Arc<dyn LookupBackend>,
    limiter: Option<Arc<RateLimiter>>,
}

impl Resolver {
    /// Builds a resolver backed by the racing [`DnsClient`].
    pub async fn new(options: ResolverOptions) -> anyhow::Result<Arc<Self>> {
        let timeout = if options.timeout.is_zero() {
            Duration::from_secs(5)
        } else {
            options.timeout
        };

        let servers = resolve_servers(options.server.as_deref()).await?;
        let cache_size = if options.cache_size == 0 {
            10_000
        } else {
            options.cache_size
        };

        let client = DnsClient::new(DnsClientOptions {
            servers,
            timeout,
            cache_enabled: options.cache_enabled,
            cache_size,
        })?;

        Ok(Arc::new(Self {
            backend: Arc::new(client),
            limiter: options.rate_limiter,
        }))
    }

    /// Builds a resolver over an arbitrary backend. Used by tests and the
    /// wildcard detector's probes.
    pub fn with_backend(
        backend: Arc<dyn LookupBackend>,
        limiter: Option<Arc<RateLimiter>>,
    ) -> Arc<Self> {
        Arc::new(Self { backend, limiter })
    }

    /// Resolves one hostname across all six record types.
    pub async fn resolve(&self, cancel: &CancellationToken, hostname: &str) -> Resolution {
        let hostname = hostname.trim();
        let mut result = Resolution {
            subdomain: hostname.to_string(),
            ..Resolution::default()
        };
        if hostname.is_empty() {
            result.error = Some("empty hostname".into());
            return result;
        }

        let mut errors: Vec<String> = Vec::new();

        match self.lookup_ip_split(cancel, hostname).await {
            Ok((a_records, aaaa_records)) => {
                if !a_records.is_empty() {
                    result.ip_addresses.extend(a_records.iter().cloned());
                    result.dns_records.insert("A".into(), a_records);
                }
                if !aaaa_records.is_empty() {
                    result.ip_addresses.extend(aaaa_records.iter().cloned());
                    result.dns_records.insert("AAAA".into(), aaaa_records);
                }
            }
            Err(err) => errors.push(err),
        }

        match self.with_token(cancel, self.backend.lookup_cname(hostname)).await {
            Ok(Some(cname)) if !cname.is_empty() => {
                result.dns_records.insert("CNAME".into(), vec![cname]);
            }
            Ok(_) => {}
            Err(err) => errors.push(err),
        }

        match self.with_token(cancel, self.backend.lookup_mx(hostname)).await {
            Ok(mx_records) if !mx_records.is_empty() => {
                let values = mx_records
                    .into_iter()
                    .map(|(preference, host)| format!("{preference} {host}"))
                    .collect();
                result.dns_records.insert("MX".into(), unique_sorted(values));
            }
            Ok(_) => {}
            Err(err) => errors.push(err),
        }

        match self.with_token(cancel, self.backend.lookup_txt(hostname)).await {
            Ok(txt_records) if !txt_records.is_empty() => {
                result
                    .dns_records
                    .insert("TXT".into(), unique_sorted(txt_records));
            }
            Ok(_) => {}
            Err(err) => errors.push(err),
        }

        match self.with_token(cancel, self.backend.lookup_ns(hostname)).await {
            Ok(ns_records) if !ns_records.is_empty() => {
                result
                    .dns_records
                    .insert("NS".into(), unique_sorted(ns_records));
            }
            Ok(_) => {}
            Err(err) => errors.push(err),
        }

        result.ip_addresses = unique_sorted(result.ip_addresses);
        for values in result.dns_records.values_mut() {
            *values = unique_sorted(std::mem::take(values));
        }
        result.dns_records.retain(|_, values| !values.is_empty());

        if !errors.is_empty() && !result.is_resolved() {
            result.error = Some(errors.join("; "));
        }

        result
    }

    /// Resolves a fixed list of hostnames with a worker pool and streams
    /// the results.
    pub fn resolve_many(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        hostnames: Vec<String>,
        workers: usize,
    ) -> mpsc::Receiver<Resolution> {
        let (job_tx, job_rx) = mpsc::channel::<String>(256);
        let cancel_feed = cancel.clone();
        tokio::spawn(async move {
            for hostname in hostnames {
                let hostname = hostname.trim().to_string();
                if hostname.is_empty() {
                    continue;
                }
                tokio::select! {
                    _ = cancel_feed.cancelled() => return,
                    result = job_tx.send(hostname) => {
                        if result.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        self.spawn_workers(cancel, job_rx, workers)
    }

    /// Resolves hostnames received from a channel, enabling true streaming
    /// from the passive aggregator.
    pub fn resolve_stream(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        hostnames: mpsc::Receiver<String>,
        workers: usize,
    ) -> mpsc::Receiver<Resolution> {
        self.spawn_workers(cancel, hostnames, workers)
    }

    fn spawn_workers(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        jobs: mpsc::Receiver<String>,
        workers: usize,
    ) -> mpsc::Receiver<Resolution> {
        let workers = workers.max(1);
        let (result_tx, result_rx) = mpsc::channel::<Resolution>(256);
        let jobs = Arc::new(tokio::sync::Mutex::new(jobs));
        let tracker = TaskTracker::new();

        for _ in 0..workers {
            let resolver = Arc::clone(self);
            let jobs = Arc::clone(&jobs);
            let results = result_tx.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move {
                loop {
                    let hostname = { jobs.lock().await.recv().await };
                    let Some(hostname) = hostname else { return };
                    let hostname = hostname.trim().to_string();
                    if hostname.is_empty() {
                        continue;
                    }
                    if cancel.is_cancelled() {
                        return;
                    }

                    let resolution = resolver.resolve(&cancel, &hostname).await;

                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = results.send(resolution) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
        tracker.close();
        drop(result_tx);

        result_rx
    }

    async fn lookup_ip_split(
        &self,
        cancel: &CancellationToken,
        hostname: &str,
    ) -> Result<(Vec<String>, Vec<String>), String> {
        let addrs = self.with_token(cancel, self.backend.lookup_ip(hostname)).await?;

        let mut a_records = Vec::new();
        let mut aaaa_records = Vec::new();
        for addr in addrs {
            match addr {
                IpAddr::V4(v4) => a_records.push(v4.to_string()),
                IpAddr::V6(v6) => aaaa_records.push(v6.to_string()),
            }
        }
        Ok((unique_sorted(a_records), unique_sorted(aaaa_records)))
    }

    /// Acquires one rate-limit token, then runs the lookup. Errors are
    /// stringified for aggregation into the resolution error.
    async fn with_token<T>(
        &self,
        cancel: &CancellationToken,
        lookup: impl std::future::Future<Output = Result<T, DnsError>>,
    ) -> Result<T, String> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire(cancel).await.map_err(|err| err.to_string())?;
        }
        lookup.await.map_err(|err| err.to_string())
    }
}

/// Trims, deduplicates, drops empties, and sorts a list of strings. Every
/// record list in the pipeline passes through here.
pub fn unique_sorted(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::with_capacity(values.len());
    let mut result: Vec<String> = values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty() && seen.insert(value.clone()))
        .collect();
    result.sort();
    result
}

/// Normalizes a DNS server string to `host:port` form, defaulting the port
/// to 53. Accepts bare hosts, `host:port`, and bracketed IPv6 literals.
pub fn parse_server(address: &str) -> anyhow::Result<Option<String>> {
    let address = address.trim();
    if address.is_empty() {
        return Ok(None);
    }

    if !address.contains(':') {
        return Ok(Some(format!("{address}:53")));
    }

    if let Some(stripped) = address.strip_prefix('[') {
        if let Some(host) = stripped.strip_suffix(']') {
            if host.is_empty() {
                anyhow::bail!("invalid dns server host");
            }
            return Ok(Some(format!("[{host}]:53")));
        }
        if let Some((host, port)) = stripped.rsplit_once("]:") {
            port.parse::<u16>()
                .map_err(|err| anyhow::anyhow!("invalid dns server port: {err}"))?;
            return Ok(Some(format!("[{host}]:{port}")));
        }
        anyhow::bail!("invalid dns server address {address:?}");
    }

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("invalid dns server address {address:?}"))?;
    if host.is_empty() {
        anyhow::bail!("invalid dns server host");
    }
    if host.contains(':') {
        anyhow::bail!("IPv6 server addresses must be bracketed, e.g. [::1]:53");
    }
    let port = if port.is_empty() { "53" } else { port };
    port.parse::<u16>()
        .map_err(|err| anyhow::anyhow!("invalid dns server port: {err}"))?;
    Ok(Some(format!("{host}:{port}")))
}

/// Builds the upstream server list: the caller-supplied server first, then
/// the defaults excluding duplicates, resolved to socket addresses.
async fn resolve_servers(custom: Option<&str>) -> anyhow::Result<Vec<std::net::SocketAddr>> {
    let mut entries: Vec<String> = Vec::with_capacity(DEFAULT_DNS_SERVERS.len() + 1);
    if let Some(custom) = custom {
        if let Some(parsed) = parse_server(custom)? {
            entries.push(parsed);
        }
    }
    for default in DEFAULT_DNS_SERVERS {
        if !entries.iter().any(|entry| entry.eq_ignore_ascii_case(default)) {
            entries.push(default.to_string());
        }
    }

    let mut servers = Vec::with_capacity(entries.len());
    for entry in &entries {
        let addr = tokio::net::lookup_host(entry.as_str())
            .await
            .map_err(|err| anyhow::anyhow!("resolving dns server {entry}: {err}"))?
            .next()
            .ok_or_else(|| anyhow::anyhow!("dns server {entry} resolved to no addresses"))?;
        if !servers.contains(&addr) {
            servers.push(addr);
        }
    }
    Ok(servers)
}
