//! Request admission rate limiting
//!
//! Token bucket for per-second/burst control plus sliding-window counters
//! for per-minute and per-hour quotas. Admission waits (bounded by the
//! request deadline) when a token is due soon, and denies with a
//! `retry_after` hint otherwise. State is process-wide, with an optional
//! bounded LRU of per-caller buckets when the transport identifies callers.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::RateLimitSettings;
use crate::errors::{ServerError, ServerResult};

/// Per-caller buckets retained before the coldest is evicted
///
/// Eviction only resets the bucket for an inactive caller; it has no
/// correctness consequence.
const MAX_CALLER_BUCKETS: usize = 256;

/// Token bucket: tokens accrue at `refill_rate` per second up to `capacity`
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_rate,
            tokens: f64::from(capacity),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Seconds until one token is available; zero when one already is
    fn wait_for_token(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
        }
    }

    fn consume(&mut self) {
        self.tokens -= 1.0;
    }
}

/// Sliding-window request counter; `cap == 0` disables the window
#[derive(Debug)]
struct WindowCounter {
    window: Duration,
    cap: u32,
    stamps: VecDeque<Instant>,
}

impl WindowCounter {
    fn new(window: Duration, cap: u32) -> Self {
        Self {
            window,
            cap,
            stamps: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        let cutoff = now.checked_sub(self.window);
        while let Some(front) = self.stamps.front() {
            match cutoff {
                Some(cutoff) if *front <= cutoff => {
                    self.stamps.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Time until the oldest stamp ages out; zero when under the cap
    fn wait_for_slot(&mut self, now: Instant) -> Duration {
        if self.cap == 0 {
            return Duration::ZERO;
        }
        self.prune(now);
        if self.stamps.len() < self.cap as usize {
            Duration::ZERO
        } else {
            let oldest = self.stamps[0];
            (oldest + self.window).saturating_duration_since(now)
        }
    }

    fn record(&mut self, now: Instant) {
        if self.cap > 0 {
            self.stamps.push_back(now);
        }
    }
}

/// One bucket plus its quota windows
#[derive(Debug)]
struct BucketSet {
    bucket: TokenBucket,
    minute: WindowCounter,
    hour: WindowCounter,
}

impl BucketSet {
    fn new(settings: &RateLimitSettings, now: Instant) -> Self {
        Self {
            bucket: TokenBucket::new(settings.burst, settings.rps, now),
            minute: WindowCounter::new(Duration::from_secs(60), settings.per_minute),
            hour: WindowCounter::new(Duration::from_secs(3600), settings.per_hour),
        }
    }

    /// Earliest wait until every active constraint admits one request
    fn needed_wait(&mut self, now: Instant) -> Duration {
        self.bucket
            .wait_for_token(now)
            .max(self.minute.wait_for_slot(now))
            .max(self.hour.wait_for_slot(now))
    }

    fn consume(&mut self, now: Instant) {
        self.bucket.consume();
        self.minute.record(now);
        self.hour.record(now);
    }
}

#[derive(Debug, Default)]
struct RateStatsInner {
    allowed: u64,
    denied: u64,
    total_wait_ms: u64,
}

/// Rate limiter statistics snapshot for the health report
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub allowed: u64,
    pub denied: u64,
    pub total_wait_ms: u64,
}

struct LimiterState {
    global: BucketSet,
    callers: LruCache<String, BucketSet>,
    stats: RateStatsInner,
}

/// Token-bucket rate limiter with quota windows
pub struct RateLimiter {
    settings: RateLimitSettings,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        let now = Instant::now();
        let cap = NonZeroUsize::new(MAX_CALLER_BUCKETS).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(LimiterState {
                global: BucketSet::new(&settings, now),
                callers: LruCache::new(cap),
                stats: RateStatsInner::default(),
            }),
            settings,
        }
    }

    /// Acquire admission for one request
    ///
    /// Consumes a token and returns immediately when every active window
    /// admits; otherwise sleeps for the computed wait and re-checks. When
    /// the wait would overrun `deadline`, denies with `RateLimited` carrying
    /// a `retry_after` hint in whole seconds.
    ///
    /// The internal lock is never held across a suspension point.
    pub async fn admit(&self, deadline: Instant, caller: Option<&str>) -> ServerResult<()> {
        let mut waited = Duration::ZERO;
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                let mut wait = state.global.needed_wait(now);
                if let Some(caller) = caller {
                    if state.callers.get_mut(caller).is_none() {
                        state
                            .callers
                            .put(caller.to_owned(), BucketSet::new(&self.settings, now));
                    }
                    if let Some(set) = state.callers.get_mut(caller) {
                        wait = wait.max(set.needed_wait(now));
                    }
                }
                if wait.is_zero() {
                    state.global.consume(now);
                    if let Some(caller) = caller {
                        if let Some(set) = state.callers.get_mut(caller) {
                            set.consume(now);
                        }
                    }
                    state.stats.allowed += 1;
                    state.stats.total_wait_ms += waited.as_millis() as u64;
                    return Ok(());
                }
                wait
            };

            if Instant::now() + wait > deadline {
                let retry_after_secs = wait.as_secs_f64().ceil().max(1.0) as u64;
                {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.stats.denied += 1;
                }
                debug!(retry_after_secs, caller = ?caller, "rate limit denied admission");
                return Err(ServerError::RateLimited { retry_after_secs });
            }

            waited += wait;
            sleep(wait).await;
        }
    }

    /// Statistics snapshot
    pub fn stats(&self) -> RateLimiterStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        RateLimiterStats {
            allowed: state.stats.allowed,
            denied: state.stats.denied,
            total_wait_ms: state.stats.total_wait_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::RateLimiter;
    use crate::config::RateLimitSettings;
    use crate::errors::ServerError;

    fn settings(rps: f64, burst: u32) -> RateLimitSettings {
        RateLimitSettings {
            rps,
            burst,
            per_minute: 0,
            per_hour: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_admits_immediately_then_denies_past_deadline() {
        let limiter = RateLimiter::new(settings(2.0, 2));
        let deadline = Instant::now() + Duration::from_millis(100);

        limiter.admit(deadline, None).await.expect("first admit");
        limiter.admit(deadline, None).await.expect("second admit");

        let denied = limiter
            .admit(Instant::now() + Duration::from_millis(10), None)
            .await
            .expect_err("bucket is drained");
        match denied {
            ServerError::RateLimited { retry_after_secs } => assert!(retry_after_secs >= 1),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_refill_when_deadline_allows() {
        let limiter = RateLimiter::new(settings(10.0, 1));
        let deadline = Instant::now() + Duration::from_secs(2);

        limiter.admit(deadline, None).await.expect("first admit");
        let before = Instant::now();
        limiter.admit(deadline, None).await.expect("second admit after refill");
        assert!(before.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test(start_paused = true)]
    async fn minute_quota_is_enforced() {
        let limiter = RateLimiter::new(RateLimitSettings {
            rps: 100.0,
            burst: 100,
            per_minute: 3,
            per_hour: 0,
        });
        let deadline = Instant::now() + Duration::from_millis(50);
        for _ in 0..3 {
            limiter.admit(deadline, None).await.expect("within quota");
        }
        let denied = limiter.admit(deadline, None).await;
        assert!(matches!(denied, Err(ServerError::RateLimited { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_buckets_overlay_the_global_window() {
        let limiter = RateLimiter::new(RateLimitSettings {
            rps: 100.0,
            burst: 100,
            per_minute: 1,
            per_hour: 0,
        });
        let deadline = Instant::now() + Duration::from_millis(10);

        limiter
            .admit(deadline, Some("alpha"))
            .await
            .expect("alpha first admit");
        let denied = limiter.admit(deadline, Some("alpha")).await;
        assert!(matches!(denied, Err(ServerError::RateLimited { .. })));

        // The global minute quota is also at 1, so bravo is throttled by the
        // process-wide window even though its own bucket is fresh.
        let denied = limiter.admit(deadline, Some("bravo")).await;
        assert!(matches!(denied, Err(ServerError::RateLimited { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn stats_count_allowed_and_denied() {
        let limiter = RateLimiter::new(settings(1.0, 1));
        let deadline = Instant::now() + Duration::from_millis(5);
        limiter.admit(deadline, None).await.expect("admit");
        let _ = limiter.admit(deadline, None).await;
        let stats = limiter.stats();
        assert_eq!(stats.allowed, 1);
        assert_eq!(stats.denied, 1);
    }
}
