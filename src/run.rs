//! Pipeline driver: composes discovery, resolution, filtering, and sinks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::active::{bruteforce, zonetransfer};
use crate::app;
use crate::config::constants::{DEFAULT_USER_AGENT, EXPORT_BATCH_SIZE};
use crate::config::Config;
use crate::exporter::{Exporter, ExporterOptions};
use crate::filters;
use crate::http_client::{HttpClient, HttpClientOptions};
use crate::notifier::{WebhookNotifier, WebhookOptions};
use crate::output::{
    classify_change, load_records, normalize_record, records_equal, DiffSummary, Record,
    RecordWriter,
};
use crate::passive::{
    self, AggregateOptions, CertTransparencyClient, HackerTargetClient, Source,
    ThreatCrowdClient, VirusTotalClient,
};
use crate::probe::{ProbeClient, ProbeOptions};
use crate::ratelimit::{self, RateLimiter};
use crate::resolver::{Resolution, Resolver, ResolverOptions};
use crate::stats::{format_source_breakdown, Snapshot, Tracker};

/// Outcome of a full [`run_scan`] invocation.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub targets: usize,
    pub records_written: usize,
}

type SharedSources = Arc<std::sync::Mutex<HashMap<String, Vec<String>>>>;
type ZoneRecords = HashMap<String, BTreeMap<String, Vec<String>>>;

/// Runs the full pipeline for every configured target.
///
/// SIGINT/SIGTERM cancel the run; in-flight work finishes and the output
/// writer is flushed before returning.
pub async fn run_scan(mut config: Config) -> Result<ScanReport> {
    config.validate()?;

    let cancel = CancellationToken::new();
    app::install_signal_handler(cancel.clone());

    let targets = gather_targets(&config.domain)?;
    if targets.is_empty() {
        warn!("No target domain specified. Use --domain or pipe targets via stdin.");
        return Ok(ScanReport::default());
    }
    if config.watch && targets.len() > 1 {
        return Err(anyhow!("--watch can only be used with a single target"));
    }

    let writer = RecordWriter::new(
        config.format,
        config.output.as_deref(),
        config.json_pretty,
    )?;

    if config.live_output() {
        info!("Live output enabled; results will be printed to stdout");
    } else if let Some(path) = &config.output {
        info!("Results will be written to {}", path.display());
    }

    let mut report = ScanReport {
        targets: targets.len(),
        records_written: 0,
    };

    let mut run_error = None;
    for target in &targets {
        let mut domain_config = config.clone();
        domain_config.domain = target.clone();

        match run_domain(&cancel, &domain_config, &writer).await {
            Ok(count) => report.records_written += count,
            Err(err) => {
                run_error = Some(err);
                break;
            }
        }

        if cancel.is_cancelled() {
            break;
        }
    }

    let close_result = writer.close().await;
    if let Some(err) = run_error {
        return Err(err);
    }
    close_result?;

    Ok(report)
}

/// Single target when `--domain` is set; otherwise newline-delimited
/// targets from stdin (skipped on a TTY), deduplicated case-insensitively.
fn gather_targets(domain: &str) -> Result<Vec<String>> {
    let domain = domain.trim();
    if !domain.is_empty() {
        return Ok(vec![domain.to_ascii_lowercase()]);
    }

    if std::io::stdin().is_terminal() {
        return Ok(Vec::new());
    }

    let mut targets = Vec::new();
    let mut seen = HashSet::new();
    for line in std::io::stdin().lines() {
        let line = line.context("reading targets from stdin")?;
        let target = line.trim().to_ascii_lowercase();
        if target.is_empty() || !seen.insert(target.clone()) {
            continue;
        }
        targets.push(target);
    }
    Ok(targets)
}

async fn run_domain(
    cancel: &CancellationToken,
    config: &Config,
    writer: &RecordWriter,
) -> Result<usize> {
    let limiter = RateLimiter::new(config.rate_limit);
    let monitor_cancel = cancel.child_token();
    if let Some(limiter) = &limiter {
        ratelimit::spawn_status_monitor(Arc::clone(limiter), monitor_cancel.clone());
    }

    let http = HttpClient::new(HttpClientOptions {
        timeout: config.timeout_duration(),
        user_agent: DEFAULT_USER_AGENT.to_string(),
        limiter: limiter.clone(),
    })?;

    let notifier = WebhookNotifier::new(WebhookOptions {
        endpoint: config.webhook.clone(),
        secret: config.webhook_secret.clone(),
        domain: config.domain.clone(),
        http: Arc::clone(&http),
    })?;

    let diff_baseline = match &config.diff {
        None => None,
        Some(path) => match load_records(path) {
            Err(err) => {
                warn!("Unable to load diff baseline {}: {err}", path.display());
                None
            }
            Ok(records) => {
                let mut baseline = HashMap::with_capacity(records.len());
                for record in &records {
                    let normalized = normalize_record(record);
                    if !normalized.subdomain.is_empty() {
                        baseline.insert(normalized.subdomain.clone(), normalized);
                    }
                }
                info!(
                    "Loaded {} baseline record(s) from {}",
                    baseline.len(),
                    path.display()
                );
                Some(baseline)
            }
        },
    };

    let mut diff = DiffState {
        baseline: diff_baseline,
        remaining: None,
        stats: DiffSummary::default(),
        watch_known: config.watch.then(HashMap::new),
    };

    let result = run_domain_cycles(cancel, config, writer, &http, &limiter, notifier, &mut diff).await;
    monitor_cancel.cancel();
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_domain_cycles(
    cancel: &CancellationToken,
    config: &Config,
    writer: &RecordWriter,
    http: &Arc<HttpClient>,
    limiter: &Option<Arc<RateLimiter>>,
    notifier: Option<WebhookNotifier>,
    diff: &mut DiffState,
) -> Result<usize> {
    let mut total = 0usize;
    let mut iteration = 0usize;
    loop {
        iteration += 1;
        diff.remaining = diff.baseline.clone();
        diff.stats = DiffSummary::default();

        if config.watch {
            info!(
                "Watch iteration {iteration}: enumerating {} in {:?} mode",
                config.domain, config.mode
            );
        } else {
            info!("Enumerating {} in {:?} mode", config.domain, config.mode);
        }

        let mut exporter = Exporter::new(ExporterOptions {
            endpoint: config.export_0xgen.clone(),
            api_key: config.api_key.clone(),
            domain: config.domain.clone(),
            batch_size: EXPORT_BATCH_SIZE,
            http: Arc::clone(http),
        })?;

        let tracker = Tracker::new();
        tracker.start(cancel);

        let count = run_cycle(
            cancel,
            config,
            limiter,
            http,
            writer,
            &mut exporter,
            notifier.as_ref(),
            &tracker,
            diff,
        )
        .await;

        let snapshot = tracker.stop();
        let count = count?;
        total += count;

        log_scan_summary(config, &snapshot);
        log_diff_summary(config, diff);

        if let Some(exporter) = &mut exporter {
            flush_exporter(config, exporter).await?;
        }

        if !config.watch || cancel.is_cancelled() {
            break;
        }

        info!(
            "Watch iteration {iteration} complete; sleeping for {:.0}s",
            config.watch_interval
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.watch_interval_duration()) => {}
        }
    }

    Ok(total)
}

struct DiffState {
    /// Normalized baseline records keyed by subdomain.
    baseline: Option<HashMap<String, Record>>,
    /// Baseline entries not yet seen this cycle; what is left is "removed".
    remaining: Option<HashMap<String, Record>>,
    stats: DiffSummary,
    /// Records from earlier watch iterations.
    watch_known: Option<HashMap<String, Record>>,
}

impl DiffState {
    fn mark_seen(&mut self, subdomain: &str) {
        if let Some(remaining) = &mut self.remaining {
            remaining.remove(subdomain);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_cycle(
    cancel: &CancellationToken,
    config: &Config,
    limiter: &Option<Arc<RateLimiter>>,
    http: &Arc<HttpClient>,
    writer: &RecordWriter,
    exporter: &mut Option<Exporter>,
    notifier: Option<&WebhookNotifier>,
    tracker: &Arc<Tracker>,
    diff: &mut DiffState,
) -> Result<usize> {
    let subdomain_sources: SharedSources = Arc::new(std::sync::Mutex::new(HashMap::new()));
    let mut zone_records: ZoneRecords = HashMap::new();
    let mut seen_ips: Option<HashSet<String>> = config.unique_ips.then(HashSet::new);
    let mut total = 0usize;

    if config.mode.includes_passive() {
        let sources = build_passive_sources(config, http)?;
        let resolver = new_resolver(config, limiter).await?;

        let (hostname_tx, hostname_rx) = mpsc::channel::<String>(256);
        let results = resolver.resolve_stream(cancel, hostname_rx, config.threads);

        let (mut events, wait) = passive::aggregate_stream(
            cancel,
            &config.domain,
            sources,
            AggregateOptions {
                parallel: config.parallel_sources,
                source_timeout: Duration::from_secs(30),
            },
        );

        let forwarder = tokio::spawn({
            let cancel = cancel.clone();
            let subdomain_sources = Arc::clone(&subdomain_sources);
            async move {
                let mut seen: HashSet<String> = HashSet::new();
                let mut logged_errors: HashSet<String> = HashSet::new();

                while let Some(event) = events.recv().await {
                    if let Some(error) = event.error {
                        let source = if event.source.is_empty() {
                            "unknown".to_string()
                        } else {
                            event.source
                        };
                        if logged_errors.insert(source.clone()) {
                            warn!("Passive source {source} error: {error}");
                        }
                        continue;
                    }

                    let Some(subdomain) = event.subdomain else { continue };
                    let subdomain = subdomain.trim().to_ascii_lowercase();
                    if subdomain.is_empty() {
                        continue;
                    }

                    add_source(&subdomain_sources, &subdomain, &event.source);

                    if seen.insert(subdomain.clone()) {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            sent = hostname_tx.send(subdomain) => {
                                if sent.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }

                if let Ok(aggregate) = wait.await {
                    for (source, error) in aggregate.errors {
                        if logged_errors.insert(source.clone()) {
                            warn!("Passive source {source} error: {error}");
                        }
                    }
                }
            }
        });

        let count = process_resolutions(
            cancel,
            config,
            &resolver,
            results,
            &subdomain_sources,
            &mut zone_records,
            &mut seen_ips,
            writer,
            exporter,
            notifier,
            tracker,
            diff,
            http,
        )
        .await;

        let _ = forwarder.await;
        total += count?;
    }

    if config.mode.includes_active() {
        let transfers = zonetransfer::run(
            cancel,
            zonetransfer::ZoneTransferOptions {
                domain: config.domain.clone(),
                dns_server: config.dns_server.clone(),
                timeout: config.timeout_duration(),
                rate_limiter: limiter.clone(),
            },
        )
        .await
        .context("active zone transfer")?;

        for transfer in &transfers {
            debug!(
                "zone transfer from {} yielded {} host(s)",
                transfer.nameserver,
                transfer.records.len()
            );
            for hostname in transfer.records.keys() {
                add_source(&subdomain_sources, hostname, "active:zonetransfer");
            }
            merge_zone_records(&mut zone_records, &transfer.records);
        }

        let progress: Option<Box<dyn std::io::Write + Send>> = if config.silent {
            None
        } else {
            Some(Box::new(std::io::stderr()))
        };

        let results = bruteforce::run(
            cancel,
            bruteforce::BruteforceOptions {
                domain: config.domain.clone(),
                wordlist_path: config.wordlist.clone(),
                permutations: config.permutations,
                dns_server: config.dns_server.clone(),
                timeout: config.dns_timeout_duration(),
                workers: config.threads,
                auto_tune: config.auto_tune,
                progress,
                rate_limiter: limiter.clone(),
            },
        )
        .await
        .context("active bruteforce")?;

        for result in &results {
            add_source(&subdomain_sources, &result.subdomain, "active:bruteforce");
        }

        let pending: Vec<String> = {
            let sources = subdomain_sources.lock().expect("sources map poisoned");
            let mut pending: Vec<String> = sources.keys().cloned().collect();
            pending.sort();
            pending
        };

        if !pending.is_empty() {
            let resolver = new_resolver(config, limiter).await?;
            let results = resolver.resolve_many(cancel, pending, config.threads);

            let count = process_resolutions(
                cancel,
                config,
                &resolver,
                results,
                &subdomain_sources,
                &mut zone_records,
                &mut seen_ips,
                writer,
                exporter,
                notifier,
                tracker,
                diff,
                http,
            )
            .await;
            total += count?;
        }
    }

    if total == 0 {
        info!("No subdomains discovered for {}", config.domain);
    }

    Ok(total)
}

#[allow(clippy::too_many_arguments)]
async fn process_resolutions(
    cancel: &CancellationToken,
    config: &Config,
    resolver: &Arc<Resolver>,
    mut results: mpsc::Receiver<Resolution>,
    subdomain_sources: &SharedSources,
    zone_records: &mut ZoneRecords,
    seen_ips: &mut Option<HashSet<String>>,
    writer: &RecordWriter,
    exporter: &mut Option<Exporter>,
    notifier: Option<&WebhookNotifier>,
    tracker: &Arc<Tracker>,
    diff: &mut DiffState,
    http: &Arc<HttpClient>,
) -> Result<usize> {
    let wildcard_profile = if config.filter_wildcards {
        let profile =
            filters::detect_wildcard(cancel, resolver, &config.domain, 3, 3).await;
        if profile.active() {
            info!("Wildcard DNS detected; matching resolutions will be filtered");
        }
        Some(profile)
    } else {
        None
    };

    let probe_client = config.probe.then(|| {
        ProbeClient::new(ProbeOptions {
            http: Arc::clone(http),
            max_body_size: 0,
            screenshot_dir: config.screenshot_dir.clone(),
        })
    });

    let mut total = 0usize;

    while let Some(resolution) = results.recv().await {
        let subdomain = resolution.subdomain.clone();
        if subdomain.is_empty() {
            continue;
        }
        let normalized_name = subdomain.trim().to_ascii_lowercase();

        let sources: Vec<String> = subdomain_sources
            .lock()
            .expect("sources map poisoned")
            .get(&subdomain)
            .cloned()
            .unwrap_or_default();

        let (merged_ips, merged_records) =
            merge_resolution(&resolution, zone_records.get(&subdomain));
        let resolved = !merged_ips.is_empty() || !merged_records.is_empty();
        tracker.record_attempt(resolved);

        let cleanup = |zone_records: &mut ZoneRecords, diff: &mut DiffState| {
            subdomain_sources
                .lock()
                .expect("sources map poisoned")
                .remove(&subdomain);
            zone_records.remove(&subdomain);
            diff.mark_seen(&normalized_name);
        };

        if let Some(profile) = &wildcard_profile {
            if profile.active() && profile.matches(&resolution) {
                debug!("Skipping wildcard subdomain: {subdomain}");
                cleanup(zone_records, diff);
                continue;
            }
        }

        if !config.show_all && !resolved {
            cleanup(zone_records, diff);
            continue;
        }

        if let Some(error) = &resolution.error {
            warn!("DNS resolution {subdomain} error: {error}");
        }

        if config.filter_wildcards && filters::is_cdn_response(&merged_records) {
            debug!("Skipping CDN-derived subdomain: {subdomain}");
            cleanup(zone_records, diff);
            continue;
        }

        if !config.scope.is_empty() && !filters::matches_scope(&subdomain, &config.scope) {
            debug!("Skipping subdomain outside scope: {subdomain}");
            cleanup(zone_records, diff);
            continue;
        }

        let (merged_ips, merged_records) = match seen_ips {
            None => (merged_ips, merged_records),
            Some(seen) => {
                let mut records = merged_records;
                let ips = filters::filter_unique_ips(merged_ips, &mut records, seen);
                if ips.is_empty() {
                    cleanup(zone_records, diff);
                    continue;
                }
                (ips, records)
            }
        };

        let mut record = Record {
            subdomain: subdomain.clone(),
            ip_addresses: merged_ips,
            source: sources.join(","),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            dns_records: merged_records,
            http_services: Vec::new(),
            change: String::new(),
        };

        if let Some(probe_client) = &probe_client {
            record.http_services = probe_client.probe(cancel, &subdomain).await;
        }

        let normalized = normalize_record(&record);

        if let Some(known) = &mut diff.watch_known {
            if let Some(previous) = known.get(&normalized.subdomain) {
                if records_equal(previous, &normalized) {
                    diff.mark_seen(&normalized.subdomain);
                    continue;
                }
                record.change = "updated".to_string();
            } else {
                record.change = "new".to_string();
            }
        }

        if let Some(baseline) = &diff.baseline {
            if !normalized.subdomain.is_empty() {
                match classify_change(baseline, &normalized) {
                    Some("new") => {
                        record.change = "new".to_string();
                        diff.stats.added += 1;
                    }
                    Some(tag) => {
                        record.change = tag.to_string();
                        diff.stats.updated += 1;
                        diff.mark_seen(&normalized.subdomain);
                    }
                    None => diff.mark_seen(&normalized.subdomain),
                }
            }
        }

        writer
            .write_record(record.clone())
            .await
            .context("writing record")?;
        total += 1;
        tracker.record_discovery(&sources);

        if let Some(exporter) = exporter {
            exporter
                .add_record(cancel, record.clone())
                .await
                .context("exporting record")?;
        }

        if let Some(notifier) = notifier {
            notifier
                .notify(cancel, &config.domain, &record)
                .await
                .context("sending webhook notification")?;
        }

        if let Some(known) = &mut diff.watch_known {
            known.insert(normalized.subdomain.clone(), normalized.clone());
        }
        if let Some(baseline) = &mut diff.baseline {
            baseline.insert(normalized.subdomain.clone(), normalized);
        }

        cleanup(zone_records, diff);
    }

    Ok(total)
}

async fn new_resolver(
    config: &Config,
    limiter: &Option<Arc<RateLimiter>>,
) -> Result<Arc<Resolver>> {
    Resolver::new(ResolverOptions {
        server: config.dns_server.clone(),
        timeout: config.dns_timeout_duration(),
        rate_limiter: limiter.clone(),
        cache_enabled: config.dns_cache,
        cache_size: config.dns_cache_size,
    })
    .await
    .context("configuring resolver")
}

fn build_passive_sources(
    config: &Config,
    http: &Arc<HttpClient>,
) -> Result<Vec<Arc<dyn Source>>> {
    let ct: Arc<dyn Source> = Arc::new(CertTransparencyClient::new(Arc::clone(http)));
    let ht: Arc<dyn Source> = Arc::new(HackerTargetClient::new(Arc::clone(http)));
    let tc: Arc<dyn Source> = Arc::new(ThreatCrowdClient::new(Arc::clone(http)));
    let vt: Arc<dyn Source> = Arc::new(VirusTotalClient::new(
        &config.virustotal_api_key,
        Arc::clone(http),
    ));

    let available: HashMap<&str, &Arc<dyn Source>> = HashMap::from([
        ("crtsh", &ct),
        ("crt.sh", &ct),
        ("certtransparency", &ct),
        ("hackertarget", &ht),
        ("threatcrowd", &tc),
        ("virustotal", &vt),
        ("vt", &vt),
    ]);

    let requested: Vec<String> = if config.sources.is_empty() {
        vec![
            "crtsh".into(),
            "hackertarget".into(),
            "threatcrowd".into(),
            "virustotal".into(),
        ]
    } else {
        config.sources.clone()
    };

    let mut selected: Vec<Arc<dyn Source>> = Vec::with_capacity(requested.len());
    let mut seen = HashSet::new();
    for name in requested {
        let canonical = name.trim().to_ascii_lowercase();
        if canonical.is_empty() {
            continue;
        }
        let source = available
            .get(canonical.as_str())
            .copied()
            .ok_or_else(|| anyhow!("unknown passive source {name:?}"))?;
        if seen.insert(source.name()) {
            selected.push(Arc::clone(source));
        }
    }

    if selected.is_empty() {
        return Err(anyhow!("no passive sources selected"));
    }
    Ok(selected)
}

fn add_source(sources: &SharedSources, subdomain: &str, source: &str) {
    let subdomain = subdomain.trim();
    let source = source.trim();
    if subdomain.is_empty() || source.is_empty() {
        return;
    }

    let mut sources = sources.lock().expect("sources map poisoned");
    let entry = sources.entry(subdomain.to_string()).or_default();
    if !entry.iter().any(|existing| existing == source) {
        entry.push(source.to_string());
        entry.sort();
    }
}

fn merge_zone_records(
    target: &mut ZoneRecords,
    incoming: &BTreeMap<String, BTreeMap<String, Vec<String>>>,
) {
    for (hostname, records) in incoming {
        let hostname = hostname.trim();
        if hostname.is_empty() {
            continue;
        }
        let entry = target.entry(hostname.to_string()).or_default();
        for (record_type, values) in records {
            if values.is_empty() {
                continue;
            }
            let merged = entry.entry(record_type.clone()).or_default();
            merged.extend(values.iter().cloned());
            *merged = crate::resolver::unique_sorted(std::mem::take(merged));
        }
    }
}

/// Merges a resolution with any zone-transfer records for the same host.
fn merge_resolution(
    resolution: &Resolution,
    zone: Option<&BTreeMap<String, Vec<String>>>,
) -> (Vec<String>, BTreeMap<String, Vec<String>>) {
    let mut ips = resolution.ip_addresses.clone();
    let mut records = resolution.dns_records.clone();

    if let Some(zone) = zone {
        for (record_type, values) in zone {
            if values.is_empty() {
                continue;
            }
            let merged = records.entry(record_type.clone()).or_default();
            merged.extend(values.iter().cloned());
            *merged = crate::resolver::unique_sorted(std::mem::take(merged));
            if record_type == "A" || record_type == "AAAA" {
                ips.extend(values.iter().cloned());
            }
        }
    }

    (crate::resolver::unique_sorted(ips), records)
}

async fn flush_exporter(config: &Config, exporter: &mut Exporter) -> Result<()> {
    // Flushing gets a fresh token so a cancelled run still delivers the
    // final batch, bounded by the global timeout.
    let flush_cancel = CancellationToken::new();
    let summary = tokio::time::timeout(
        config.timeout_duration(),
        exporter.flush(&flush_cancel),
    )
    .await
    .map_err(|_| anyhow!("export flush timed out"))?
    .context("finalising export")?;

    if summary.total_records > 0 || summary.batches_sent > 0 {
        info!(
            "Export complete: {} record(s) across {} batch(es)",
            summary.total_records, summary.batches_sent
        );
    } else {
        info!("Export complete: no records to send");
    }
    Ok(())
}

fn log_scan_summary(config: &Config, snapshot: &Snapshot) {
    let unresolved = snapshot.attempts.saturating_sub(snapshot.resolved);
    info!(
        "Scan complete for {}: {} subdomains discovered ({} resolved, {unresolved} unresolved)",
        config.domain, snapshot.total_found, snapshot.resolved
    );
    info!(
        "Resolution attempts: {} total (success rate {:.1}%) across {}s",
        snapshot.attempts,
        snapshot.resolution_rate(),
        snapshot.duration.as_secs()
    );
    info!(
        "Active/passive discovery ratio: {}",
        snapshot.active_passive_ratio()
    );
    let breakdown = format_source_breakdown(&snapshot.sources, 5);
    if !breakdown.is_empty() {
        info!("Top discovery sources: {breakdown}");
    }
}

fn log_diff_summary(config: &Config, diff: &mut DiffState) {
    let Some(remaining) = &diff.remaining else { return };
    if diff.baseline.is_none() {
        return;
    }

    let mut removed: Vec<String> = remaining.keys().cloned().collect();
    removed.sort();
    diff.stats.removed = removed;

    let diff_path = config
        .diff
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_default();
    info!(
        "Diff summary: {} new, {} updated, {} removed compared to {diff_path}",
        diff.stats.added,
        diff.stats.updated,
        diff.stats.removed.len()
    );

    if !diff.stats.removed.is_empty() {
        let preview: Vec<&str> = diff
            .stats
            .removed
            .iter()
            .take(10)
            .map(String::as_str)
            .collect();
        info!("Removed subdomains: {}", preview.join(", "));
        if diff.stats.removed.len() > preview.len() {
            info!(
                "Removed subdomains truncated; {} additional entries omitted",
                diff.stats.removed.len() - preview.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolution(subdomain: &str, a_records: &[&str]) -> Resolution {
        let mut dns_records = BTreeMap::new();
        if !a_records.is_empty() {
            dns_records.insert(
                "A".to_string(),
                a_records.iter().map(|v| v.to_string()).collect(),
            );
        }
        Resolution {
            subdomain: subdomain.to_string(),
            ip_addresses: a_records.iter().map(|v| v.to_string()).collect(),
            dns_records,
            error: None,
        }
    }

    #[test]
    fn add_source_dedups_and_sorts() {
        let sources: SharedSources = Arc::new(std::sync::Mutex::new(HashMap::new()));
        add_source(&sources, "www.example.com", "crt.sh");
        add_source(&sources, "www.example.com", "active:bruteforce");
        add_source(&sources, "www.example.com", "crt.sh");
        add_source(&sources, "  ", "crt.sh");

        let sources = sources.lock().unwrap();
        assert_eq!(
            sources["www.example.com"],
            vec!["active:bruteforce", "crt.sh"]
        );
        assert_eq!(sources.len(), 1);
    }

    #[test]
    fn merge_resolution_unions_zone_data() {
        let resolution = resolution("www.example.com", &["192.0.2.1"]);
        let mut zone = BTreeMap::new();
        zone.insert(
            "A".to_string(),
            vec!["192.0.2.2".to_string(), "192.0.2.1".to_string()],
        );
        zone.insert("TXT".to_string(), vec!["v=spf1 -all".to_string()]);

        let (ips, records) = merge_resolution(&resolution, Some(&zone));
        assert_eq!(ips, vec!["192.0.2.1", "192.0.2.2"]);
        assert_eq!(records["A"], vec!["192.0.2.1", "192.0.2.2"]);
        assert_eq!(records["TXT"], vec!["v=spf1 -all"]);
    }

    #[test]
    fn merge_zone_records_accumulates() {
        let mut target = ZoneRecords::new();
        let mut first = BTreeMap::new();
        first.insert(
            "www.example.com".to_string(),
            BTreeMap::from([("A".to_string(), vec!["192.0.2.1".to_string()])]),
        );
        let mut second = BTreeMap::new();
        second.insert(
            "www.example.com".to_string(),
            BTreeMap::from([("A".to_string(), vec!["192.0.2.2".to_string()])]),
        );

        merge_zone_records(&mut target, &first);
        merge_zone_records(&mut target, &second);
        assert_eq!(
            target["www.example.com"]["A"],
            vec!["192.0.2.1", "192.0.2.2"]
        );
        let mut empty_host = BTreeMap::new();
        empty_host.insert(" ".to_string(), BTreeMap::new());
        merge_zone_records(&mut target, &empty_host);
        assert_eq!(target.len(), 1);
    }

    #[test]
    fn gather_targets_prefers_domain_flag() {
        let targets = gather_targets("Example.COM").unwrap();
        assert_eq!(targets, vec!["example.com"]);
    }

    #[test]
    fn build_passive_sources_rejects_unknown_names() {
        let http = HttpClient::new(HttpClientOptions {
            timeout: Duration::from_secs(1),
            user_agent: "domain_recon-test".into(),
            limiter: None,
        })
        .unwrap();

        let mut config = Config::default();
        config.sources = vec!["nosuchsource".into()];
        assert!(build_passive_sources(&config, &http).is_err());

        config.sources = vec!["crtsh".into(), "crt.sh".into(), "vt".into()];
        let selected = build_passive_sources(&config, &http).unwrap();
        // crt.sh aliases collapse to one source.
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn default_passive_source_order() {
        let http = HttpClient::new(HttpClientOptions {
            timeout: Duration::from_secs(1),
            user_agent: "domain_recon-test".into(),
            limiter: None,
        })
        .unwrap();

        let config = Config::default();
        let selected = build_passive_sources(&config, &http).unwrap();
        let names: Vec<&str> = selected.iter().map(|source| source.name()).collect();
        assert_eq!(
            names,
            vec!["crt.sh", "hackertarget", "threatcrowd", "virustotal"]
        );
    }
}
