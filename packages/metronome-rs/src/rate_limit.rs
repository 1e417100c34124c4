//! Token-bucket rate limiting.
//!
//! Refill is continuous: tokens accrue at `refill_rate / refill_interval`
//! per millisecond of elapsed time, capped at capacity. The same limiter
//! shape serves as a per-job limiter and as a global one.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::SchedulerError;

/// Rate limit configuration, as carried on a job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Steady-state bucket size.
    pub capacity: u32,
    /// Tokens added per refill interval.
    pub refill_rate: f64,
    /// Length of one refill interval, in milliseconds.
    pub refill_interval_ms: u64,
    /// Optional burst ceiling; raises the bucket cap above `capacity`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u32>,
    /// Accepted alias for `refill_interval_ms`; wins when both are set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,
}

impl RateLimitConfig {
    /// `capacity` tokens, refilled at `refill_rate` per `refill_interval`.
    pub fn new(capacity: u32, refill_rate: f64, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_rate,
            refill_interval_ms: refill_interval.as_millis() as u64,
            burst: None,
            window_ms: None,
        }
    }

    /// Set a burst ceiling above the steady-state capacity.
    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }

    fn cap(&self) -> f64 {
        f64::from(self.capacity.max(self.burst.unwrap_or(0))).max(1.0)
    }

    fn rate_per_ms(&self) -> f64 {
        let interval = self.window_ms.unwrap_or(self.refill_interval_ms).max(1);
        (self.refill_rate / interval as f64).max(0.0)
    }
}

struct Bucket {
    tokens: f64,
    refilled_at: DateTime<Utc>,
}

/// Continuous-refill token bucket.
pub struct RateLimiter {
    cap: f64,
    rate_per_ms: f64,
    clock: Arc<dyn Clock>,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter that starts full.
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let cap = config.cap();
        let now = clock.now();
        Self {
            cap,
            rate_per_ms: config.rate_per_ms(),
            clock,
            bucket: Mutex::new(Bucket {
                tokens: cap,
                refilled_at: now,
            }),
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: DateTime<Utc>) {
        let elapsed_ms = (now - bucket.refilled_at).num_milliseconds().max(0) as f64;
        if elapsed_ms > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed_ms * self.rate_per_ms).min(self.cap);
            bucket.refilled_at = now;
        }
    }

    /// Non-blocking take. Returns whether `n` tokens were available.
    pub fn try_take(&self, n: u32) -> bool {
        let now = self.clock.now();
        let mut bucket = match self.bucket.lock() {
            Ok(b) => b,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.refill(&mut bucket, now);
        let need = f64::from(n);
        if bucket.tokens >= need {
            bucket.tokens -= need;
            true
        } else {
            false
        }
    }

    /// Conservative estimate of how long until `n` tokens are available,
    /// in milliseconds. Zero means they are available now.
    pub fn ms_until(&self, n: u32) -> u64 {
        let now = self.clock.now();
        let mut bucket = match self.bucket.lock() {
            Ok(b) => b,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.refill(&mut bucket, now);
        let deficit = f64::from(n) - bucket.tokens;
        if deficit <= 0.0 {
            return 0;
        }
        if self.rate_per_ms <= 0.0 {
            return u64::MAX;
        }
        (deficit / self.rate_per_ms).ceil() as u64
    }

    /// Wait until `n` tokens are available, up to `timeout`.
    ///
    /// Fails with `rate_limited` when the timeout elapses first, and with
    /// `canceled` when the token fires first.
    pub async fn take(
        &self,
        n: u32,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        let deadline = timeout.map(|t| self.clock.now() + chrono::Duration::from_std(t)
            .unwrap_or_else(|_| chrono::Duration::zero()));

        loop {
            if self.try_take(n) {
                return Ok(());
            }
            let mut wait_ms = self.ms_until(n).max(1);
            if let Some(deadline) = deadline {
                let remaining = (deadline - self.clock.now()).num_milliseconds();
                if remaining <= 0 {
                    return Err(SchedulerError::RateLimited);
                }
                if wait_ms == u64::MAX || wait_ms as i64 > remaining {
                    // Tokens cannot arrive in time.
                    if wait_ms == u64::MAX {
                        return Err(SchedulerError::RateLimited);
                    }
                    wait_ms = remaining as u64;
                }
            } else if wait_ms == u64::MAX {
                return Err(SchedulerError::RateLimited);
            }
            self.clock
                .sleep(Duration::from_millis(wait_ms), cancel)
                .await?;
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("cap", &self.cap)
            .field("rate_per_ms", &self.rate_per_ms)
            .finish_non_exhaustive()
    }
}
