//! Token-bucket rate limiting shared by the DNS and HTTP paths.
//!
//! Tokens refill continuously at the configured rate with fractional
//! precision, so a rate of 0.5 admits one operation every two seconds.
//! A limiter is always wrapped in `Option<Arc<RateLimiter>>`: `None` is
//! the identity limiter used when rate limiting is disabled.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio_util::sync::CancellationToken;

/// Returned by [`RateLimiter::acquire`] when cancellation preempts the wait.
#[derive(Debug, thiserror::Error)]
#[error("rate limit wait cancelled")]
pub struct AcquireCancelled;

/// Point-in-time view of the bucket, used by the status monitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Status {
    pub rate: f64,
    pub capacity: f64,
    pub remaining: f64,
    /// Fraction of capacity currently consumed, clamped to [0, 1].
    pub utilization: f64,
    /// Time until the bucket is full again at the current rate.
    pub refill_in: Duration,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with fractional refill. Capacity is `max(rate, 1)`.
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a limiter admitting `rate` operations per second.
    ///
    /// Returns `None` when `rate <= 0`, which callers treat as "no limit".
    pub fn new(rate: f64) -> Option<std::sync::Arc<Self>> {
        if rate <= 0.0 || !rate.is_finite() {
            return None;
        }
        let capacity = rate.max(1.0);
        Some(std::sync::Arc::new(Self {
            rate,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }))
    }

    /// Non-blocking admission: consumes a token if one is available.
    pub fn allow(&self) -> bool {
        let mut bucket = self.bucket.lock().expect("rate limiter poisoned");
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens < 1.0 {
            return false;
        }
        bucket.tokens -= 1.0;
        true
    }

    /// Blocks until a token is available or `cancel` fires.
    ///
    /// The wait between attempts is `(1 - tokens) / rate`, clamped to a
    /// minimum of one millisecond so a fractional deficit never busy-waits.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AcquireCancelled> {
        loop {
            if cancel.is_cancelled() {
                return Err(AcquireCancelled);
            }

            let wait = {
                let mut bucket = self.bucket.lock().expect("rate limiter poisoned");
                self.refill(&mut bucket, Instant::now());
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                let deficit = 1.0 - bucket.tokens;
                let wait = Duration::from_secs_f64(deficit / self.rate);
                wait.max(Duration::from_millis(1))
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(AcquireCancelled),
            }
        }
    }

    /// Reports the current bucket state.
    pub fn status(&self) -> Status {
        let mut bucket = self.bucket.lock().expect("rate limiter poisoned");
        self.refill(&mut bucket, Instant::now());

        let remaining = bucket.tokens;
        let used = (self.capacity - remaining).max(0.0);
        let utilization = if self.capacity > 0.0 {
            (used / self.capacity).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let deficit = self.capacity - remaining;
        let refill_in = if deficit > 0.0 {
            Duration::from_secs_f64(deficit / self.rate)
        } else {
            Duration::ZERO
        };

        Status {
            rate: self.rate,
            capacity: self.capacity,
            remaining,
            utilization,
            refill_in,
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        // saturating_duration_since treats a clock anomaly as zero elapsed.
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if elapsed.is_zero() {
            return;
        }
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        bucket.last_refill = now;
    }
}

/// Logs limiter utilisation every five seconds until cancelled.
///
/// Warns once when remaining tokens drop to 20% of capacity and re-arms the
/// warning after recovery above 40%.
pub fn spawn_status_monitor(
    limiter: std::sync::Arc<RateLimiter>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let startup = limiter.status();
    info!(
        "Rate limit configured: {:.2} req/s (bucket capacity {:.2} token(s))",
        startup.rate, startup.capacity
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut warned = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let status = limiter.status();
                    info!(
                        "Rate limit status: {:.2} req/s | {:.2} token(s) remaining ({:.0}% used, refill in {})",
                        status.rate,
                        status.remaining,
                        status.utilization * 100.0,
                        format_refill(status.refill_in)
                    );

                    if status.remaining <= status.capacity * 0.2 {
                        if !warned {
                            warn!(
                                "Approaching rate limit capacity: {:.2} token(s) remaining (<=20% of bucket)",
                                status.remaining
                            );
                            warned = true;
                        }
                    } else if warned && status.remaining > status.capacity * 0.4 {
                        warned = false;
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    })
}

fn format_refill(d: Duration) -> String {
    if d.is_zero() {
        "ready".to_string()
    } else if d < Duration::from_millis(1) {
        "<1ms".to_string()
    } else if d < Duration::from_secs(1) {
        format!("{}ms", d.as_millis())
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn zero_rate_yields_no_limiter() {
        assert!(RateLimiter::new(0.0).is_none());
        assert!(RateLimiter::new(-3.5).is_none());
    }

    #[test]
    fn capacity_is_at_least_one() {
        let limiter = RateLimiter::new(0.25).unwrap();
        let status = limiter.status();
        assert_eq!(status.capacity, 1.0);
        assert_eq!(status.rate, 0.25);
    }

    #[test]
    fn allow_consumes_burst_then_denies() {
        let limiter = RateLimiter::new(5.0).unwrap();
        let mut admitted = 0;
        for _ in 0..10 {
            if limiter.allow() {
                admitted += 1;
            }
        }
        // Full bucket holds exactly `capacity` tokens; refill during the
        // loop can add at most a fraction of one more.
        assert!(admitted >= 5 && admitted <= 6, "admitted {admitted}");
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        let limiter = RateLimiter::new(20.0).unwrap();
        let cancel = CancellationToken::new();

        // Drain the bucket.
        while limiter.allow() {}

        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        // One token at 20/s refills in ~50ms.
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn acquire_observes_cancellation() {
        let limiter = RateLimiter::new(0.01).unwrap();
        let cancel = CancellationToken::new();
        while limiter.allow() {}

        let limiter2 = Arc::clone(&limiter);
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { limiter2.acquire(&cancel2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn admissions_bounded_by_capacity_plus_refill() {
        let rate = 50.0;
        let limiter = RateLimiter::new(rate).unwrap();
        let cancel = CancellationToken::new();

        let window = Duration::from_millis(200);
        let start = Instant::now();
        let mut admitted = 0u32;
        while start.elapsed() < window {
            if limiter.acquire(&cancel).await.is_ok() {
                admitted += 1;
            }
        }

        let elapsed = start.elapsed().as_secs_f64();
        let bound = (rate.max(1.0) + rate * elapsed).ceil() as u32 + 1;
        assert!(admitted <= bound, "admitted {admitted}, bound {bound}");
    }

    #[test]
    fn status_reports_utilization_in_range() {
        let limiter = RateLimiter::new(4.0).unwrap();
        limiter.allow();
        limiter.allow();
        let status = limiter.status();
        assert!(status.utilization >= 0.0 && status.utilization <= 1.0);
        assert!(status.remaining <= status.capacity);
    }
}
