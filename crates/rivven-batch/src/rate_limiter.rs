//! Batch rate limiting
//!
//! All scanner workers share one token bucket: every batch query takes one
//! token, tokens refill at `batches_per_second`. Waiting for a token is a
//! cancellation point.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Configuration for batch rate limiting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum batches per second (0 = unlimited)
    pub batches_per_second: u64,
}

impl RateLimitConfig {
    /// Limit to `batches_per_second`; the bucket holds one second of permits
    pub fn new(batches_per_second: u64) -> Self {
        Self { batches_per_second }
    }

    /// No throttling
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Check if rate limiting is enabled
    pub fn is_enabled(&self) -> bool {
        self.batches_per_second > 0
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Token bucket shared by every scanner worker
pub struct BatchRateLimiter {
    tokens: AtomicU64,
    capacity: u64,
    refill_rate: u64,
    last_refill: Mutex<Instant>,
    config: RateLimitConfig,
    batches_throttled: AtomicU64,
    total_wait_ns: AtomicU64,
}

impl BatchRateLimiter {
    /// Create a new limiter with a full bucket
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = if config.is_enabled() {
            config.batches_per_second.max(1)
        } else {
            u64::MAX
        };

        Self {
            tokens: AtomicU64::new(capacity),
            capacity,
            refill_rate: config.batches_per_second,
            last_refill: Mutex::new(Instant::now()),
            config,
            batches_throttled: AtomicU64::new(0),
            total_wait_ns: AtomicU64::new(0),
        }
    }

    /// Wait for one batch permit; returns the time spent waiting
    pub async fn acquire(&self) -> Duration {
        if !self.config.is_enabled() {
            return Duration::ZERO;
        }

        let start = Instant::now();
        loop {
            if self.try_take() {
                let waited = start.elapsed();
                if !waited.is_zero() {
                    self.batches_throttled.fetch_add(1, Ordering::Relaxed);
                    self.total_wait_ns
                        .fetch_add(waited.as_nanos() as u64, Ordering::Relaxed);
                    debug!("Rate limiter: waited {:?} for a batch permit", waited);
                }
                return waited;
            }
            tokio::time::sleep(self.wait_hint()).await;
        }
    }

    /// Wait for one batch permit unless `cancel` fires first
    pub async fn acquire_cancellable(&self, cancel: &CancellationToken) -> Result<Duration> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            waited = self.acquire() => Ok(waited),
        }
    }

    /// Take a permit if one is available right now
    pub fn try_acquire(&self) -> bool {
        !self.config.is_enabled() || self.try_take()
    }

    fn try_take(&self) -> bool {
        self.refill();
        loop {
            let current = self.tokens.load(Ordering::Acquire);
            if current == 0 {
                return false;
            }
            if self
                .tokens
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn wait_hint(&self) -> Duration {
        if self.refill_rate > 0 {
            Duration::from_secs_f64((1.0 / self.refill_rate as f64).min(1.0))
        } else {
            Duration::from_millis(10)
        }
    }

    fn refill(&self) {
        if self.refill_rate == 0 {
            return;
        }

        let mut last = self.last_refill.lock();
        let elapsed = last.elapsed();
        let tokens_to_add = (elapsed.as_secs_f64() * self.refill_rate as f64) as u64;
        if tokens_to_add > 0 {
            let current = self.tokens.load(Ordering::Relaxed);
            let refilled = current.saturating_add(tokens_to_add).min(self.capacity);
            self.tokens.store(refilled, Ordering::Release);
            *last = Instant::now();
        }
    }

    /// Currently available permits
    pub fn available_tokens(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    /// Get statistics about rate limiting
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            batches_throttled: self.batches_throttled.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ns.load(Ordering::Relaxed) / 1_000_000,
            current_tokens: self.tokens.load(Ordering::Relaxed),
            capacity: self.capacity,
            rate_limit: self.config.batches_per_second,
            enabled: self.config.is_enabled(),
        }
    }
}

impl std::fmt::Debug for BatchRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRateLimiter")
            .field("config", &self.config)
            .field("tokens", &self.available_tokens())
            .finish()
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone, Default)]
pub struct RateLimiterStats {
    /// Batches that had to wait for a permit
    pub batches_throttled: u64,
    /// Total time spent waiting in milliseconds
    pub total_wait_ms: u64,
    /// Current available tokens
    pub current_tokens: u64,
    /// Maximum token capacity
    pub capacity: u64,
    /// Configured rate limit (batches per second)
    pub rate_limit: u64,
    /// Whether rate limiting is enabled
    pub enabled: bool,
}

impl std::fmt::Display for RateLimiterStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.enabled {
            write!(
                f,
                "RateLimiter({}bps, {} throttled, {}ms waited)",
                self.rate_limit, self.batches_throttled, self.total_wait_ms
            )
        } else {
            write!(f, "RateLimiter(unlimited)")
        }
    }
}
