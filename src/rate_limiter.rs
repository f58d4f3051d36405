// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Rate limiting for upstream provider calls and zone retries.
//!
//! Two separate mechanisms:
//!
//! - [`ProviderRateLimiter`] is a token bucket gating individual change
//!   applications against a provider account. A denied request returns the
//!   remaining delay so the caller can pseudo-apply and retry later.
//! - [`ZoneRateLimiter`] is the adaptive per-zone retry interval: failures
//!   back off multiplicatively up to a ceiling, successes decay the interval
//!   back toward the floor.

use crate::constants::{ZONE_BACKOFF_MAX, ZONE_BACKOFF_MIN};
use crate::provider::RateLimit;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token bucket limiting calls against one provider account.
///
/// Configured from the provider's declared [`RateLimit`]: the sustained rate
/// is `requests_per_day / 86400` requests per second and `burst` tokens may
/// accumulate.
pub struct ProviderRateLimiter {
    rate_per_sec: f64,
    burst: f64,
    inner: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl ProviderRateLimiter {
    /// Build a limiter from a provider-declared rate limit.
    #[must_use]
    pub fn new(limit: RateLimit) -> Self {
        let rate_per_sec = f64::from(limit.requests_per_day) / 86_400.0;
        let burst = f64::from(limit.burst.max(1));
        Self {
            rate_per_sec,
            burst,
            inner: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Build a limiter from a sustained per-second rate and burst, as used
    /// by the global configuration option.
    #[must_use]
    pub fn per_second(qps: u32, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate_per_sec: f64::from(qps),
            burst,
            inner: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Try to take one token.
    ///
    /// # Errors
    ///
    /// Returns the remaining delay until a token becomes available when the
    /// bucket is empty.
    pub fn try_accept(&self) -> Result<(), Duration> {
        let mut state = self.inner.lock().expect("rate limiter poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Ok(());
        }
        if self.rate_per_sec <= 0.0 {
            return Err(Duration::from_secs(3600));
        }
        let missing = 1.0 - state.tokens;
        Err(Duration::from_secs_f64(missing / self.rate_per_sec))
    }
}

/// Adaptive retry interval for one hosted zone.
///
/// Starts at the floor; each failure doubles the interval up to the ceiling
/// (default 10 minutes), each success halves it back toward the floor.
#[derive(Debug)]
pub struct ZoneRateLimiter {
    min: Duration,
    max: Duration,
    inner: Mutex<Duration>,
}

impl Default for ZoneRateLimiter {
    fn default() -> Self {
        Self::new(ZONE_BACKOFF_MIN, ZONE_BACKOFF_MAX)
    }
}

impl ZoneRateLimiter {
    /// Build a limiter with explicit bounds.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            inner: Mutex::new(min),
        }
    }

    /// The current retry interval.
    #[must_use]
    pub fn delay(&self) -> Duration {
        *self.inner.lock().expect("zone limiter poisoned")
    }

    /// Record a successful reconciliation; the interval decays toward the
    /// floor.
    pub fn succeeded(&self) {
        let mut delay = self.inner.lock().expect("zone limiter poisoned");
        *delay = (*delay / 2).max(self.min);
    }

    /// Record a failed reconciliation; the interval backs off toward the
    /// ceiling and the new value is returned for scheduling.
    pub fn failed(&self) -> Duration {
        let mut delay = self.inner.lock().expect("zone limiter poisoned");
        *delay = (*delay * 2).min(self.max);
        *delay
    }
}

#[cfg(test)]
#[path = "rate_limiter_tests.rs"]
mod rate_limiter_tests;
