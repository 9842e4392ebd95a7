//! Adaptive wordlist bruteforce engine.
//!
//! Labels from the wordlist (plus optional numeric permutations) are joined
//! with the apex and dispatched in batches to a dynamic worker pool. Every
//! query reports a metric; a controller samples the metrics every two
//! seconds, publishes a batch delay for backpressure, and, with autotune
//! enabled, resizes the pool between 50 and 500 workers.

use std::collections::HashSet;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use log::debug;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::dns::DnsError;
use crate::intern::intern;
use crate::ratelimit::RateLimiter;
use crate::resolver::{parse_server, DEFAULT_DNS_SERVERS};

use super::{default_wordlist, load_wordlist};

const BATCH_SIZE: usize = 100;
const MIN_AUTOTUNE_WORKERS: usize = 50;
const MAX_AUTOTUNE_WORKERS: usize = 500;
const DEFAULT_WORKERS: usize = 10;
const CONTROLLER_TICK: Duration = Duration::from_secs(2);
const PROGRESS_TICK: Duration = Duration::from_millis(250);

/// Inputs for [`run`].
pub struct BruteforceOptions {
    pub domain: String,
    /// Wordlist path; the embedded default list is used when absent.
    pub wordlist_path: Option<PathBuf>,
    pub permutations: bool,
    pub dns_server: Option<String>,
    pub timeout: Duration,
    pub workers: usize,
    pub auto_tune: bool,
    /// Sink for progress lines (typically stderr); `None` disables them.
    pub progress: Option<Box<dyn Write + Send>>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

/// One discovered hostname with its answer values.
#[derive(Debug, Clone)]
pub struct BruteforceResult {
    pub subdomain: Arc<str>,
    pub rcode: ResponseCode,
    pub answers: Vec<Arc<str>>,
}

#[derive(Debug, Clone, Copy)]
struct QueryMetric {
    duration: Duration,
    success: bool,
    throttled: bool,
}

/// Runs the engine to completion and returns the deduplicated, sorted
/// discoveries.
pub async fn run(
    cancel: &CancellationToken,
    options: BruteforceOptions,
) -> Result<Vec<BruteforceResult>> {
    let domain = options.domain.trim().to_ascii_lowercase();
    if domain.is_empty() {
        return Err(anyhow!("domain is required"));
    }

    let words = match &options.wordlist_path {
        Some(path) => {
            let words = load_wordlist(path)?;
            if words.is_empty() {
                return Err(anyhow!("wordlist {} contained no entries", path.display()));
            }
            words
        }
        None => {
            let words = default_wordlist();
            if words.is_empty() {
                return Err(anyhow!("embedded default wordlist is empty"));
            }
            words
        }
    };

    let labels = build_labels(&words, options.permutations);
    if labels.is_empty() {
        return Err(anyhow!("wordlist produced no labels"));
    }

    let hostnames: Vec<Arc<str>> = labels
        .iter()
        .map(|label| intern(&format!("{label}.{domain}")))
        .collect();

    let server = resolve_bruteforce_server(options.dns_server.as_deref()).await?;
    let timeout = if options.timeout.is_zero() {
        Duration::from_secs(5)
    } else {
        options.timeout
    };

    let reporter = Arc::new(ProgressReporter::new(
        hostnames.len() as u64,
        options.progress,
    ));
    let reporter_task = reporter.start();

    let (job_tx, job_rx) = mpsc::channel::<Vec<Arc<str>>>(1);
    let (result_tx, mut result_rx) = mpsc::channel::<BruteforceResult>(256);
    let (metric_tx, metric_rx) = mpsc::channel::<QueryMetric>(512);

    let pool = Arc::new(WorkerPool::new(
        cancel.clone(),
        WorkerContext {
            server,
            timeout,
            limiter: options.rate_limiter.clone(),
            jobs: Arc::new(tokio::sync::Mutex::new(job_rx)),
            reporter: Arc::clone(&reporter),
        },
        result_tx,
        metric_tx,
    ));

    let initial_workers = if options.auto_tune {
        MIN_AUTOTUNE_WORKERS
    } else if options.workers == 0 {
        DEFAULT_WORKERS
    } else {
        options.workers
    };
    pool.set_size(initial_workers);

    let batch_delay = Arc::new(AtomicU64::new(0));

    let controller = tokio::spawn(adaptive_controller(
        cancel.clone(),
        metric_rx,
        Arc::clone(&pool),
        Arc::clone(&batch_delay),
        options.auto_tune,
    ));

    let dispatcher = tokio::spawn(dispatch(
        cancel.clone(),
        hostnames.clone(),
        job_tx,
        Arc::clone(&batch_delay),
    ));

    // The result and metric channels close once every worker has exited.
    let pool_waiter = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move {
            pool.wait().await;
            pool.finish();
        }
    });

    let mut found: Vec<BruteforceResult> = Vec::with_capacity((hostnames.len() / 4).max(16));
    let mut seen: HashSet<Arc<str>> = HashSet::with_capacity(hostnames.len());

    while let Some(mut result) = result_rx.recv().await {
        let subdomain = intern(&result.subdomain.trim().to_ascii_lowercase());
        if subdomain.is_empty() || !seen.insert(Arc::clone(&subdomain)) {
            continue;
        }
        result.subdomain = subdomain;
        found.push(result);
    }

    let _ = dispatcher.await;
    let _ = pool_waiter.await;
    let _ = controller.await;
    reporter.stop(reporter_task).await;

    found.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
    Ok(found)
}

/// Expands words into candidate labels. With permutations enabled each
/// word also yields `word{n}`, `{n}word`, `word-{n}`, and `{n}-word` for
/// n in 0..=99, deduplicated through the intern table.
fn build_labels(words: &[Arc<str>], permutations: bool) -> Vec<Arc<str>> {
    let mut seen: HashSet<Arc<str>> = HashSet::with_capacity(words.len());
    let mut labels = Vec::with_capacity(if permutations {
        words.len() * 401
    } else {
        words.len()
    });

    let mut add = |candidate: &str, seen: &mut HashSet<Arc<str>>, labels: &mut Vec<Arc<str>>| {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return;
        }
        let interned = intern(candidate);
        if seen.insert(Arc::clone(&interned)) {
            labels.push(interned);
        }
    };

    for word in words {
        let label = word.trim().to_ascii_lowercase();
        if label.is_empty() {
            continue;
        }

        add(&label, &mut seen, &mut labels);
        if permutations {
            for n in 0..=99u8 {
                add(&format!("{label}{n}"), &mut seen, &mut labels);
                add(&format!("{n}{label}"), &mut seen, &mut labels);
                add(&format!("{label}-{n}"), &mut seen, &mut labels);
                add(&format!("{n}-{label}"), &mut seen, &mut labels);
            }
        }
    }

    labels
}

/// Resolves the bruteforce target server: the configured server when
/// present, otherwise the first built-in default.
async fn resolve_bruteforce_server(server: Option<&str>) -> Result<SocketAddr> {
    let entry = match server.and_then(|s| parse_server(s).transpose()) {
        Some(parsed) => parsed?,
        None => DEFAULT_DNS_SERVERS[0].to_string(),
    };
    let mut addrs = tokio::net::lookup_host(entry.as_str())
        .await
        .with_context(|| format!("resolving dns server {entry}"))?;
    addrs
        .next()
        .ok_or_else(|| anyhow!("dns server {entry} resolved to no addresses"))
}

async fn dispatch(
    cancel: CancellationToken,
    hostnames: Vec<Arc<str>>,
    jobs: mpsc::Sender<Vec<Arc<str>>>,
    batch_delay: Arc<AtomicU64>,
) {
    for chunk in hostnames.chunks(BATCH_SIZE) {
        if cancel.is_cancelled() {
            return;
        }

        let wait = Duration::from_millis(batch_delay.load(Ordering::Relaxed));
        if !wait.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return,
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = jobs.send(chunk.to_vec()) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

struct WorkerContext {
    server: SocketAddr,
    timeout: Duration,
    limiter: Option<Arc<RateLimiter>>,
    jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<Arc<str>>>>>,
    reporter: Arc<ProgressReporter>,
}

type ResultSenders = (mpsc::Sender<BruteforceResult>, mpsc::Sender<QueryMetric>);

/// Dynamic worker pool. Growing spawns workers with child cancellation
/// tokens; shrinking cancels the newest tokens and lets those workers
/// finish their current query before exiting.
struct WorkerPool {
    parent: CancellationToken,
    tracker: TaskTracker,
    context: Arc<WorkerContext>,
    workers: std::sync::Mutex<Vec<CancellationToken>>,
    senders: std::sync::Mutex<Option<ResultSenders>>,
}

impl WorkerPool {
    fn new(
        parent: CancellationToken,
        context: WorkerContext,
        results: mpsc::Sender<BruteforceResult>,
        metrics: mpsc::Sender<QueryMetric>,
    ) -> Self {
        Self {
            parent,
            tracker: TaskTracker::new(),
            context: Arc::new(context),
            workers: std::sync::Mutex::new(Vec::new()),
            senders: std::sync::Mutex::new(Some((results, metrics))),
        }
    }

    fn set_size(&self, target: usize) {
        let mut workers = self.workers.lock().expect("worker pool poisoned");
        let current = workers.len();

        if target > current {
            for _ in current..target {
                let Some((results, metrics)) = self
                    .senders
                    .lock()
                    .expect("worker pool poisoned")
                    .clone()
                else {
                    return;
                };
                let worker_cancel = self.parent.child_token();
                workers.push(worker_cancel.clone());
                let context = Arc::clone(&self.context);
                self.tracker
                    .spawn(run_worker(worker_cancel, context, results, metrics));
            }
        } else {
            while workers.len() > target {
                if let Some(cancel) = workers.pop() {
                    cancel.cancel();
                }
            }
        }
    }

    fn size(&self) -> usize {
        self.workers.lock().expect("worker pool poisoned").len()
    }

    async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Drops the result/metric senders so the channels close once the last
    /// worker-held clone is gone.
    fn finish(&self) {
        self.senders.lock().expect("worker pool poisoned").take();
    }
}

async fn run_worker(
    cancel: CancellationToken,
    context: Arc<WorkerContext>,
    results: mpsc::Sender<BruteforceResult>,
    metrics: mpsc::Sender<QueryMetric>,
) {
    // Each worker owns one connected socket and one receive buffer, reused
    // for every query it issues.
    let mut socket: Option<UdpSocket> = None;
    let mut recv_buf = vec![0u8; 4096];

    loop {
        let batch = {
            let jobs = Arc::clone(&context.jobs);
            tokio::select! {
                _ = cancel.cancelled() => return,
                batch = async move { jobs.lock().await.recv().await } => batch,
            }
        };
        let Some(batch) = batch else { return };

        for hostname in batch {
            if cancel.is_cancelled() {
                return;
            }
            let hostname = hostname.trim();
            if hostname.is_empty() {
                context.reporter.increment();
                continue;
            }

            if let Some(limiter) = &context.limiter {
                if limiter.acquire(&cancel).await.is_err() {
                    return;
                }
            }

            if socket.is_none() {
                socket = match crate::dns::dial(context.server).await {
                    Ok(fresh) => Some(fresh),
                    Err(err) => {
                        debug!("bruteforce worker dial failed: {err}");
                        context.reporter.increment();
                        continue;
                    }
                };
            }

            let (result, metric, socket_ok) = query_hostname(
                socket.as_ref().expect("socket dialled above"),
                context.timeout,
                hostname,
                &mut recv_buf,
            )
            .await;
            if !socket_ok {
                socket = None;
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = metrics.send(metric) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }

            if let Some(result) = result {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = results.send(result) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }

            context.reporter.increment();
        }
    }
}

/// Issues one A query. Returns the optional discovery, the metric for the
/// controller, and whether the socket is still usable.
async fn query_hostname(
    socket: &UdpSocket,
    timeout: Duration,
    hostname: &str,
    recv_buf: &mut [u8],
) -> (Option<BruteforceResult>, QueryMetric, bool) {
    let start = Instant::now();
    let mut metric = QueryMetric {
        duration: Duration::ZERO,
        success: false,
        throttled: false,
    };

    let name = match Name::from_ascii(format!("{hostname}.")) {
        Ok(name) => name,
        Err(_) => {
            metric.duration = start.elapsed();
            return (None, metric, true);
        }
    };

    let mut query = Message::new();
    query
        .set_id(rand::thread_rng().gen())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::A));

    let response = exchange(socket, &query, timeout, recv_buf).await;
    metric.duration = start.elapsed();

    let response = match response {
        Ok(response) => response,
        Err(err) => {
            metric.throttled = is_throttle_error(&err);
            return (None, metric, false);
        }
    };

    let rcode = response.response_code();
    if rcode != ResponseCode::NoError {
        metric.throttled = is_throttle_rcode(rcode);
        return (None, metric, true);
    }

    let answers = extract_answers(&response);
    if answers.is_empty() {
        return (None, metric, true);
    }

    metric.success = true;
    let result = BruteforceResult {
        subdomain: intern(hostname),
        rcode,
        answers,
    };
    (Some(result), metric, true)
}

async fn exchange(
    socket: &UdpSocket,
    query: &Message,
    timeout: Duration,
    recv_buf: &mut [u8],
) -> Result<Message, DnsError> {
    let wire = query.to_vec().map_err(|err| DnsError::Proto(err.to_string()))?;
    socket.send(&wire).await?;

    tokio::time::timeout(timeout, async {
        loop {
            let len = socket.recv(recv_buf).await?;
            match Message::from_vec(&recv_buf[..len]) {
                Ok(message) if message.id() == query.id() => return Ok(message),
                _ => continue,
            }
        }
    })
    .await
    .map_err(|_| DnsError::Timeout)?
}

fn extract_answers(message: &Message) -> Vec<Arc<str>> {
    message
        .answers()
        .iter()
        .filter_map(|record| {
            let value = match record.data()? {
                RData::A(a) => a.0.to_string(),
                RData::AAAA(aaaa) => aaaa.0.to_string(),
                RData::CNAME(cname) => cname.0.to_utf8().trim_end_matches('.').to_string(),
                other => other.to_string(),
            };
            let value = value.trim();
            (!value.is_empty()).then(|| intern(value))
        })
        .collect()
}

fn is_throttle_error(err: &DnsError) -> bool {
    if matches!(err, DnsError::Timeout) {
        return true;
    }
    let message = err.to_string().to_ascii_lowercase();
    ["rate", "throttle", "limit", "refused", "servfail"]
        .iter()
        .any(|marker| message.contains(marker))
}

fn is_throttle_rcode(rcode: ResponseCode) -> bool {
    matches!(
        rcode,
        ResponseCode::Refused
            | ResponseCode::ServFail
            | ResponseCode::NotAuth
            | ResponseCode::NotZone
    )
}

/// Samples query metrics and applies backpressure every two seconds.
async fn adaptive_controller(
    cancel: CancellationToken,
    mut metrics: mpsc::Receiver<QueryMetric>,
    pool: Arc<WorkerPool>,
    batch_delay: Arc<AtomicU64>,
    auto_tune: bool,
) {
    let mut ticker = tokio::time::interval(CONTROLLER_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut samples: Vec<QueryMetric> = Vec::with_capacity(512);
    let mut cancelled = false;

    loop {
        if cancelled {
            // Keep draining so workers never block on the metric channel.
            match metrics.recv().await {
                Some(_) => continue,
                None => return,
            }
        }

        tokio::select! {
            metric = metrics.recv() => match metric {
                Some(metric) => samples.push(metric),
                None => {
                    apply_window(&samples, &pool, &batch_delay, auto_tune);
                    return;
                }
            },
            _ = ticker.tick() => {
                apply_window(&samples, &pool, &batch_delay, auto_tune);
                samples.clear();
            }
            _ = cancel.cancelled() => {
                cancelled = true;
                batch_delay.store(0, Ordering::Relaxed);
            }
        }
    }
}

fn apply_window(
    samples: &[QueryMetric],
    pool: &WorkerPool,
    batch_delay: &AtomicU64,
    auto_tune: bool,
) {
    if samples.is_empty() {
        return;
    }

    let total = samples.len();
    let total_duration: Duration = samples.iter().map(|m| m.duration).sum();
    let avg_duration = total_duration / total as u32;
    let success_count = samples.iter().filter(|m| m.success).count();
    let throttle_count = samples.iter().filter(|m| m.throttled).count();
    let success_rate = success_count as f64 / total as f64;
    let throttle_rate = throttle_count as f64 / total as f64;

    batch_delay.store(
        desired_batch_delay(throttle_rate, avg_duration).as_millis() as u64,
        Ordering::Relaxed,
    );

    if auto_tune {
        let current = match pool.size() {
            0 => MIN_AUTOTUNE_WORKERS,
            n => n,
        };
        let desired =
            desired_worker_count(current, throttle_rate, success_rate, avg_duration);
        if desired != current {
            debug!(
                "autotune: {current} -> {desired} workers (throttle {:.1}%, success {:.1}%, avg {}ms)",
                throttle_rate * 100.0,
                success_rate * 100.0,
                avg_duration.as_millis()
            );
            pool.set_size(desired);
        }
    }
}

fn desired_batch_delay(throttle_rate: f64, avg_duration: Duration) -> Duration {
    if throttle_rate > 0.15 {
        Duration::from_millis(1500)
    } else if throttle_rate > 0.08 || avg_duration > Duration::from_millis(900) {
        Duration::from_millis(750)
    } else if throttle_rate > 0.0 || avg_duration > Duration::from_millis(600) {
        Duration::from_millis(250)
    } else {
        Duration::ZERO
    }
}

fn desired_worker_count(
    current: usize,
    throttle_rate: f64,
    success_rate: f64,
    avg_duration: Duration,
) -> usize {
    if throttle_rate > 0.1 || avg_duration > Duration::from_millis(900) {
        let decreased = current.saturating_sub((current / 4).max(5));
        decreased.max(MIN_AUTOTUNE_WORKERS)
    } else if throttle_rate == 0.0
        && success_rate > 0.9
        && avg_duration < Duration::from_millis(400)
    {
        (current + (current / 5).max(5)).min(MAX_AUTOTUNE_WORKERS)
    } else {
        current
    }
}

/// Writes `completed/total (percent)` progress lines every 250 ms.
struct ProgressReporter {
    total: u64,
    completed: AtomicU64,
    writer: Option<std::sync::Mutex<Box<dyn Write + Send>>>,
    done: CancellationToken,
}

impl ProgressReporter {
    fn new(total: u64, writer: Option<Box<dyn Write + Send>>) -> Self {
        Self {
            total,
            completed: AtomicU64::new(0),
            writer: writer.map(std::sync::Mutex::new),
            done: CancellationToken::new(),
        }
    }

    fn start(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if self.total == 0 || self.writer.is_none() {
            return None;
        }
        let reporter = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROGRESS_TICK);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => reporter.render(false),
                    _ = reporter.done.cancelled() => return,
                }
            }
        }))
    }

    fn increment(&self) {
        if self.total > 0 {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn stop(&self, task: Option<tokio::task::JoinHandle<()>>) {
        self.done.cancel();
        if let Some(task) = task {
            let _ = task.await;
        }
        if self.writer.is_some() && self.total > 0 {
            self.completed.store(self.total, Ordering::Relaxed);
            self.render(true);
        }
    }

    fn render(&self, final_line: bool) {
        let Some(writer) = &self.writer else { return };
        let completed = self.completed.load(Ordering::Relaxed).min(self.total);
        let percent = if self.total > 0 {
            completed as f64 / self.total as f64 * 100.0
        } else {
            0.0
        };
        let mut writer = writer.lock().expect("progress writer poisoned");
        let newline = if final_line { "\n" } else { "" };
        let _ = write!(
            writer,
            "\rBruteforcing {completed}/{} ({percent:.1}%){newline}",
            self.total
        );
        let _ = writer.flush();
    }
}
