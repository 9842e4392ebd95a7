//! Passive intelligence sources and their aggregator.
//!
//! Every source answers one question: which hostnames under the apex has
//! this third party observed? Sources canonicalize to lower case, tolerate
//! partial payloads, and honor cancellation. The aggregator fans out over
//! the selected sources, streams discoveries as they arrive, and merges
//! everything into a `subdomain -> sources` union at the end.

mod certtransparency;
mod hackertarget;
mod threatcrowd;
mod virustotal;

pub use certtransparency::CertTransparencyClient;
pub use hackertarget::HackerTargetClient;
pub use threatcrowd::ThreatCrowdClient;
pub use virustotal::VirusTotalClient;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Contract implemented by passive intelligence providers.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &'static str;
    async fn enumerate(&self, cancel: &CancellationToken, domain: &str) -> Result<Vec<String>>;
}

/// Merged output of all passive sources.
#[derive(Debug, Default)]
pub struct AggregateResult {
    /// Subdomain to the sorted set of sources that reported it.
    pub subdomains: BTreeMap<String, Vec<String>>,
    /// Per-source failure messages.
    pub errors: BTreeMap<String, String>,
}

/// A single update emitted while aggregation is running.
#[derive(Debug, Clone)]
pub struct Event {
    pub source: String,
    pub subdomain: Option<String>,
    pub error: Option<String>,
    /// False when another source already reported this subdomain.
    pub is_new: bool,
}

/// Runtime options for [`aggregate_stream`].
pub struct AggregateOptions {
    pub parallel: bool,
    pub source_timeout: Duration,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            source_timeout: DEFAULT_SOURCE_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct AggregatorState {
    seen: BTreeMap<String, BTreeSet<String>>,
    errors: BTreeMap<String, String>,
}

/// Queries all sources and blocks until they complete.
pub async fn aggregate(
    cancel: &CancellationToken,
    domain: &str,
    sources: Vec<Arc<dyn Source>>,
) -> AggregateResult {
    let (mut events, wait) =
        aggregate_stream(cancel, domain, sources, AggregateOptions::default());
    while events.recv().await.is_some() {}
    wait.await.unwrap_or_default()
}

/// Queries sources and streams events as discoveries arrive.
///
/// The event channel closes when every source has finished; awaiting the
/// returned handle then yields the final aggregate. A source failing or
/// timing out is reported once and never fails the run.
pub fn aggregate_stream(
    cancel: &CancellationToken,
    domain: &str,
    sources: Vec<Arc<dyn Source>>,
    options: AggregateOptions,
) -> (mpsc::Receiver<Event>, JoinHandle<AggregateResult>) {
    let domain = domain.trim().to_ascii_lowercase();
    let (event_tx, event_rx) = mpsc::channel::<Event>(sources.len().max(1));

    if domain.is_empty() || sources.is_empty() {
        drop(event_tx);
        return (event_rx, tokio::spawn(async { AggregateResult::default() }));
    }

    let timeout = if options.source_timeout.is_zero() {
        DEFAULT_SOURCE_TIMEOUT
    } else {
        options.source_timeout
    };

    let state = Arc::new(tokio::sync::Mutex::new(AggregatorState::default()));
    let cancel = cancel.clone();
    let parallel = options.parallel;

    let handle = tokio::spawn({
        let state = Arc::clone(&state);
        async move {
            let tracker = TaskTracker::new();
            for source in sources {
                let job = enumerate_source(
                    source,
                    domain.clone(),
                    timeout,
                    cancel.clone(),
                    Arc::clone(&state),
                    event_tx.clone(),
                );
                if parallel {
                    tracker.spawn(job);
                } else {
                    job.await;
                }
            }
            tracker.close();
            drop(event_tx);
            tracker.wait().await;

            let state = state.lock().await;
            AggregateResult {
                subdomains: state
                    .seen
                    .iter()
                    .map(|(subdomain, sources)| {
                        (subdomain.clone(), sources.iter().cloned().collect())
                    })
                    .collect(),
                errors: state.errors.clone(),
            }
        }
    });

    (event_rx, handle)
}

async fn enumerate_source(
    source: Arc<dyn Source>,
    domain: String,
    timeout: Duration,
    cancel: CancellationToken,
    state: Arc<tokio::sync::Mutex<AggregatorState>>,
    events: mpsc::Sender<Event>,
) {
    let name = source.name().trim();
    let name = if name.is_empty() { "unknown" } else { name };

    let outcome = tokio::time::timeout(timeout, source.enumerate(&cancel, &domain)).await;
    let result = match outcome {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("source timed out after {timeout:?}")),
    };

    match result {
        Err(err) => {
            state
                .lock()
                .await
                .errors
                .insert(name.to_string(), err.to_string());
            emit(
                &cancel,
                &events,
                Event {
                    source: name.to_string(),
                    subdomain: None,
                    error: Some(err.to_string()),
                    is_new: false,
                },
            )
            .await;
        }
        Ok(subdomains) => {
            for subdomain in subdomains {
                let normalized = subdomain.trim().to_ascii_lowercase();
                if normalized.is_empty() {
                    continue;
                }

                let is_new = {
                    let mut state = state.lock().await;
                    let is_new_subdomain = !state.seen.contains_key(&normalized);
                    let sources = state.seen.entry(normalized.clone()).or_default();
                    if !sources.insert(name.to_string()) {
                        continue; // this source already reported it
                    }
                    is_new_subdomain
                };

                emit(
                    &cancel,
                    &events,
                    Event {
                        source: name.to_string(),
                        subdomain: Some(normalized),
                        error: None,
                        is_new,
                    },
                )
                .await;
            }
        }
    }
}

async fn emit(cancel: &CancellationToken, events: &mpsc::Sender<Event>, event: Event) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = events.send(event) => {}
    }
}
