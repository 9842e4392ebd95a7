//! Batched export to a remote collector.
//!
//! Records accumulate into batches (default 100). Each batch is POSTed as
//! `{domain, batch_id, records, summary, final, sent_at}` with optional
//! bearer auth, retried up to three times with 1 s / 2 s backoff. The
//! batch counter only advances when a POST succeeds, so a failed flush
//! never corrupts the summary.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use log::{info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::http_client::HttpClient;
use crate::output::Record;

const DEFAULT_BATCH_SIZE: usize = 100;
const POST_ATTEMPTS: u32 = 3;

/// Options for [`Exporter::new`].
pub struct ExporterOptions {
    pub endpoint: String,
    pub api_key: String,
    pub domain: String,
    pub batch_size: usize,
    pub http: Arc<HttpClient>,
}

/// Running totals reported with every batch and returned by `flush`.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct ExportSummary {
    pub total_records: usize,
    pub resolved_records: usize,
    pub unique_subdomains: usize,
    pub unique_ips: usize,
    pub batches_sent: usize,
}

#[derive(Serialize)]
struct Payload<'a> {
    domain: &'a str,
    batch_id: usize,
    records: &'a [Record],
    summary: ExportSummary,
    #[serde(rename = "final")]
    is_final: bool,
    sent_at: chrono::DateTime<Utc>,
}

/// Accumulates records and ships them to the collector endpoint.
pub struct Exporter {
    endpoint: String,
    api_key: String,
    domain: String,
    batch_size: usize,
    http: Arc<HttpClient>,

    batch: Vec<Record>,
    total_records: usize,
    resolved_records: usize,
    unique_subdomains: HashSet<String>,
    unique_ips: HashSet<String>,
    batches_sent: usize,
    final_sent: bool,
}

impl Exporter {
    /// Builds an exporter; `Ok(None)` when no endpoint is configured.
    pub fn new(options: ExporterOptions) -> Result<Option<Self>> {
        let endpoint = options.endpoint.trim().to_string();
        if endpoint.is_empty() {
            return Ok(None);
        }
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(anyhow!("export endpoint must be an absolute URL"));
        }
        url::Url::parse(&endpoint).map_err(|err| anyhow!("invalid export endpoint: {err}"))?;

        Ok(Some(Self {
            endpoint,
            api_key: options.api_key.trim().to_string(),
            domain: options.domain.trim().to_string(),
            batch_size: if options.batch_size == 0 {
                DEFAULT_BATCH_SIZE
            } else {
                options.batch_size
            },
            http: options.http,
            batch: Vec::new(),
            total_records: 0,
            resolved_records: 0,
            unique_subdomains: HashSet::new(),
            unique_ips: HashSet::new(),
            batches_sent: 0,
            final_sent: false,
        }))
    }

    /// Queues a record, sending a batch when the threshold is reached.
    pub async fn add_record(&mut self, cancel: &CancellationToken, record: Record) -> Result<()> {
        self.total_records += 1;
        self.unique_subdomains
            .insert(record.subdomain.to_ascii_lowercase());
        if !record.ip_addresses.is_empty() || !record.dns_records.is_empty() {
            self.resolved_records += 1;
        }
        for ip in &record.ip_addresses {
            let ip = ip.trim();
            if !ip.is_empty() {
                self.unique_ips.insert(ip.to_string());
            }
        }

        let mut record = record;
        if record.timestamp.is_empty() {
            record.timestamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        }
        self.batch.push(record);

        if self.batch.len() >= self.batch_size {
            self.send_current_batch(cancel, false).await?;
        }
        Ok(())
    }

    /// Sends any remaining records (or an empty final batch when nothing
    /// is pending) and returns the summary.
    pub async fn flush(&mut self, cancel: &CancellationToken) -> Result<ExportSummary> {
        if !self.batch.is_empty() {
            self.send_current_batch(cancel, true).await?;
        } else if !self.final_sent {
            let payload = Payload {
                domain: &self.domain,
                batch_id: self.batches_sent,
                records: &[],
                summary: self.summary(),
                is_final: true,
                sent_at: Utc::now(),
            };
            post_payload(&self.http, cancel, &self.endpoint, &self.api_key, &payload).await?;
            self.final_sent = true;
        }

        Ok(self.summary())
    }

    pub fn summary(&self) -> ExportSummary {
        ExportSummary {
            total_records: self.total_records,
            resolved_records: self.resolved_records,
            unique_subdomains: self.unique_subdomains.len(),
            unique_ips: self.unique_ips.len(),
            batches_sent: self.batches_sent,
        }
    }

    async fn send_current_batch(
        &mut self,
        cancel: &CancellationToken,
        is_final: bool,
    ) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }

        self.batches_sent += 1;
        let payload = Payload {
            domain: &self.domain,
            batch_id: self.batches_sent,
            records: &self.batch,
            summary: self.summary(),
            is_final,
            sent_at: Utc::now(),
        };

        match post_payload(&self.http, cancel, &self.endpoint, &self.api_key, &payload).await {
            Ok(()) => {
                info!(
                    "Exported {} record(s) (batch {}, final={is_final})",
                    self.batch.len(),
                    self.batches_sent
                );
                self.batch.clear();
                if is_final {
                    self.final_sent = true;
                }
                Ok(())
            }
            Err(err) => {
                self.batches_sent -= 1;
                warn!("export failed after retries: {err}");
                Err(err)
            }
        }
    }
}

async fn post_payload(
    http: &Arc<HttpClient>,
    cancel: &CancellationToken,
    endpoint: &str,
    api_key: &str,
    payload: &Payload<'_>,
) -> Result<()> {
    let body = serde_json::to_vec(payload)?;
    let mut headers: Vec<(&str, &str)> = Vec::new();
    let bearer;
    if !api_key.is_empty() {
        bearer = format!("Bearer {api_key}");
        headers.push(("Authorization", &bearer));
    }

    let mut last_err = None;
    for attempt in 1..=POST_ATTEMPTS {
        if attempt > 1 {
            let backoff = std::time::Duration::from_secs(u64::from(attempt - 1));
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => {
                    return Err(last_err.unwrap_or_else(|| anyhow!("export cancelled")));
                }
            }
        }

        match http.post_json(cancel, endpoint, &headers, body.clone()).await {
            Ok(response) if response.is_success() => return Ok(()),
            Ok(response) => {
                last_err = Some(anyhow!(
                    "collector responded with status {}",
                    response.status
                ));
            }
            Err(err) => last_err = Some(err),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("export failed")))
}
