//! Scan statistics tracking, used purely for reporting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::info;
use tokio_util::sync::CancellationToken;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Counters {
    total_found: usize,
    attempts: usize,
    resolved: usize,
    sources: HashMap<String, usize>,
    active_sources: usize,
    passive_sources: usize,
}

/// Point-in-time view of the tracker.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub total_found: usize,
    pub attempts: usize,
    pub resolved: usize,
    pub sources: HashMap<String, usize>,
    pub active_sources: usize,
    pub passive_sources: usize,
    pub duration: Duration,
}

impl Snapshot {
    pub fn resolution_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.resolved as f64 / self.attempts as f64 * 100.0
    }

    pub fn active_passive_ratio(&self) -> String {
        format!("{}:{}", self.active_sources, self.passive_sources)
    }
}

/// Records resolution attempts and discoveries; periodically logs a
/// progress snapshot while the scan runs.
pub struct Tracker {
    start: Instant,
    counters: Mutex<Counters>,
    done: CancellationToken,
}

impl Tracker {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            start: Instant::now(),
            counters: Mutex::new(Counters::default()),
            done: CancellationToken::new(),
        })
    }

    /// Starts the periodic snapshot logger.
    pub fn start(self: &std::sync::Arc<Self>, cancel: &CancellationToken) {
        let tracker = std::sync::Arc::clone(self);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        info!("Stats update: {}", render_snapshot(&tracker.snapshot()));
                    }
                    _ = cancel.cancelled() => return,
                    _ = tracker.done.cancelled() => return,
                }
            }
        });
    }

    /// Stops the snapshot logger and returns the final numbers.
    pub fn stop(&self) -> Snapshot {
        self.done.cancel();
        self.snapshot()
    }

    pub fn record_attempt(&self, resolved: bool) {
        let mut counters = self.counters.lock().expect("stats tracker poisoned");
        counters.attempts += 1;
        if resolved {
            counters.resolved += 1;
        }
    }

    pub fn record_discovery(&self, sources: &[String]) {
        let mut counters = self.counters.lock().expect("stats tracker poisoned");
        counters.total_found += 1;
        for source in sources {
            let source = source.trim();
            if source.is_empty() {
                continue;
            }
            *counters.sources.entry(source.to_string()).or_default() += 1;
            if source.to_ascii_lowercase().starts_with("active:") {
                counters.active_sources += 1;
            } else {
                counters.passive_sources += 1;
            }
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let counters = self.counters.lock().expect("stats tracker poisoned");
        Snapshot {
            total_found: counters.total_found,
            attempts: counters.attempts,
            resolved: counters.resolved,
            sources: counters.sources.clone(),
            active_sources: counters.active_sources,
            passive_sources: counters.passive_sources,
            duration: self.start.elapsed(),
        }
    }
}

fn render_snapshot(snapshot: &Snapshot) -> String {
    let mut parts = vec![
        format!("total={}", snapshot.total_found),
        format!("attempts={}", snapshot.attempts),
        format!("resolution_rate={:.1}%", snapshot.resolution_rate()),
        format!("active_passive={}", snapshot.active_passive_ratio()),
        format!("duration={}s", snapshot.duration.as_secs()),
    ];
    if !snapshot.sources.is_empty() {
        parts.push(format!(
            "sources={}",
            format_source_breakdown(&snapshot.sources, 5)
        ));
    }
    parts.join(" | ")
}

/// Top-N source counts as `name=count, ...`, ordered by count descending
/// then name.
pub fn format_source_breakdown(sources: &HashMap<String, usize>, limit: usize) -> String {
    let limit = if limit == 0 { sources.len() } else { limit };
    let mut entries: Vec<(&String, &usize)> = sources.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    entries
        .into_iter()
        .take(limit)
        .map(|(name, count)| format!("{name}={count}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_and_resolution_rate() {
        let tracker = Tracker::new();
        tracker.record_attempt(true);
        tracker.record_attempt(true);
        tracker.record_attempt(false);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.attempts, 3);
        assert_eq!(snapshot.resolved, 2);
        assert!((snapshot.resolution_rate() - 66.6).abs() < 1.0);
    }

    #[test]
    fn discoveries_split_active_and_passive() {
        let tracker = Tracker::new();
        tracker.record_discovery(&["crt.sh".to_string(), "active:bruteforce".to_string()]);
        tracker.record_discovery(&["crt.sh".to_string()]);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.total_found, 2);
        assert_eq!(snapshot.sources["crt.sh"], 2);
        assert_eq!(snapshot.active_sources, 1);
        assert_eq!(snapshot.passive_sources, 2);
        assert_eq!(snapshot.active_passive_ratio(), "1:2");
    }

    #[test]
    fn breakdown_orders_by_count_then_name() {
        let mut sources = HashMap::new();
        sources.insert("beta".to_string(), 3);
        sources.insert("alpha".to_string(), 3);
        sources.insert("gamma".to_string(), 7);
        assert_eq!(
            format_source_breakdown(&sources, 2),
            "gamma=7, alpha=3"
        );
        assert_eq!(
            format_source_breakdown(&sources, 0),
            "gamma=7, alpha=3, beta=3"
        );
    }

    #[test]
    fn zero_attempts_rate_is_zero() {
        let tracker = Tracker::new();
        assert_eq!(tracker.snapshot().resolution_rate(), 0.0);
    }
}
