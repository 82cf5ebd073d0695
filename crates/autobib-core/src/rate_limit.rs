//! Per-host rate limiting with adaptive governor instances.
//!
//! Every request to a host waits for that host's governor permit via
//! `until_ready()`, which enforces the minimum spacing between requests.
//! A 429 or a rate-limit placeholder slows the host down; a quiet minute
//! restores the base rate.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::archive::ArchiveError;

/// Type alias for governor's direct rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Largest slowdown applied after repeated throttling.
const MAX_FACTOR: u32 = 16;
/// Quiet period after which the base rate comes back.
const DECAY_AFTER: Duration = Duration::from_secs(60);

fn limiter_for(period: Duration) -> Arc<DirectLimiter> {
    // A zero period means "no spacing"; governor rejects it.
    let quota = Quota::with_period(period).unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX));
    Arc::new(DirectLimiter::direct(quota))
}

/// Rate limiter for one host, swapped atomically when the host pushes back.
pub struct AdaptiveHostLimiter {
    limiter: ArcSwap<DirectLimiter>,
    base_period: Duration,
    /// Current slowdown factor (1 = normal, 2 = half rate, etc.).
    current_factor: AtomicU32,
    last_throttle: Mutex<Option<Instant>>,
}

impl AdaptiveHostLimiter {
    pub fn new(period: Duration) -> Self {
        Self {
            limiter: ArcSwap::from(limiter_for(period)),
            base_period: period,
            current_factor: AtomicU32::new(1),
            last_throttle: Mutex::new(None),
        }
    }

    /// Wait until this host may be contacted again.
    pub async fn acquire(&self) {
        self.try_decay();
        let limiter = self.limiter.load_full();
        limiter.until_ready().await;
    }

    /// Double the spacing, capped at [`MAX_FACTOR`].
    pub fn on_rate_limited(&self) {
        if let Ok(mut last) = self.last_throttle.lock() {
            *last = Some(Instant::now());
        }

        let _ = self
            .current_factor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                Some((f * 2).min(MAX_FACTOR))
            });

        let factor = self.current_factor.load(Ordering::SeqCst);
        if let Some(scaled) = self.base_period.checked_mul(factor) {
            self.limiter.store(limiter_for(scaled));
        }
    }

    pub fn factor(&self) -> u32 {
        self.current_factor.load(Ordering::SeqCst)
    }

    pub fn base_period(&self) -> Duration {
        self.base_period
    }

    fn try_decay(&self) {
        let should_restore = self
            .last_throttle
            .lock()
            .ok()
            .and_then(|last| last.map(|t| t.elapsed() >= DECAY_AFTER))
            .unwrap_or(false);

        if should_restore && self.current_factor.load(Ordering::SeqCst) > 1 {
            self.current_factor.store(1, Ordering::SeqCst);
            self.limiter.store(limiter_for(self.base_period));
            tracing::debug!(period = ?self.base_period, "host rate restored");
        }
    }
}

/// Process-wide collection of per-host limiters, created on first use.
pub struct RateLimiters {
    limiters: DashMap<String, Arc<AdaptiveHostLimiter>>,
    period: Duration,
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl RateLimiters {
    /// Every host gets at most one request per `period`.
    pub fn new(period: Duration) -> Self {
        Self {
            limiters: DashMap::new(),
            period,
        }
    }

    pub fn get(&self, host: &str) -> Arc<AdaptiveHostLimiter> {
        self.limiters
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(AdaptiveHostLimiter::new(self.period)))
            .clone()
    }

    /// Wait for the host's permit.
    pub async fn acquire(&self, host: &str) {
        let limiter = self.get(host);
        limiter.acquire().await;
    }

    pub fn on_rate_limited(&self, host: &str) {
        tracing::info!(host, "rate limited, slowing down");
        self.get(host).on_rate_limited();
    }
}

/// Host part of a URL, or the whole string when it has none.
pub fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    rest.split(['/', '?', '#']).next().unwrap_or(rest)
}

/// Check if an HTTP response is a 429 and extract how long to wait.
///
/// The standard `Retry-After` header wins; the archive's own `wait-until`
/// header is read as a number of seconds.
pub fn check_rate_limit_response(resp: &reqwest::Response) -> Result<(), ArchiveError> {
    if resp.status().as_u16() == 429 {
        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after)
        };
        let retry_after = header("retry-after").or_else(|| header("wait-until"));
        Err(ArchiveError::RateLimited { retry_after })
    } else {
        Ok(())
    }
}

/// Parse a Retry-After header value (seconds or HTTP-date).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(secs) = value.parse::<f64>()
        && secs.is_finite()
        && secs >= 0.0
    {
        return Some(Duration::from_secs_f64(secs));
    }
    // HTTP-date: fall back to a conservative wait.
    if value.contains(',') || value.contains("GMT") {
        return Some(Duration::from_secs(5));
    }
    None
}
