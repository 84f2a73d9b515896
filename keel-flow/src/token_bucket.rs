//! Token bucket limiter for per-peer send pacing.
//!
//! One limiter guards each follower's dispatch path. Tokens are bytes:
//! before a batch goes on the wire the dispatcher acquires as many tokens
//! as the batch carries, waiting out any shortfall. The rate is adjusted
//! out of band from the flow monitor's throughput measurements.
//!
//! A fresh limiter is unlimited. Until the monitor has seen enough traffic
//! to measure a peer, nothing should be throttled.

use crate::error::{FlowError, FlowResult};

/// Rate treated as "no limit". At this refill rate any acquirable amount is
/// immediately available.
const UNLIMITED_RATE: u64 = u64::MAX / 2;

/// A token bucket that paces bytes sent to one peer.
///
/// Time is passed in as microseconds rather than read from a clock; the
/// caller owns the epoch.
#[derive(Debug)]
pub struct RateLimiter {
    /// Tokens currently available.
    tokens: u64,
    /// Maximum tokens the bucket holds.
    capacity: u64,
    /// Tokens added per second.
    rate: u64,
    /// Timestamp of the last refill, in microseconds.
    last_refill_us: u64,
}

impl RateLimiter {
    /// Creates a limiter with the given burst capacity and sustained rate.
    #[must_use]
    pub fn new(capacity: u64, rate: u64, now_us: u64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            rate,
            last_refill_us: now_us,
        }
    }

    /// Creates an effectively unlimited limiter.
    #[must_use]
    pub fn unlimited(now_us: u64) -> Self {
        Self::new(UNLIMITED_RATE, UNLIMITED_RATE, now_us)
    }

    /// Returns the sustained rate in tokens per second.
    #[must_use]
    pub const fn rate(&self) -> u64 {
        self.rate
    }

    /// Returns the tokens available without refilling first.
    #[must_use]
    pub const fn available(&self) -> u64 {
        self.tokens
    }

    /// Returns true if this limiter never throttles.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.rate >= UNLIMITED_RATE
    }

    /// Replaces the sustained rate, keeping accumulated tokens.
    ///
    /// The burst capacity follows the rate: one second worth of tokens.
    /// A rate of zero is clamped to one token per second so waits stay
    /// finite.
    pub fn set_rate(&mut self, rate: u64) {
        self.rate = rate.max(1);
        self.capacity = self.rate;
        self.tokens = self.tokens.min(self.capacity);
    }

    /// Adds tokens for the time elapsed since the last refill.
    ///
    /// Returns the number of tokens added. Time moving backwards adds
    /// nothing.
    pub fn refill(&mut self, now_us: u64) -> u64 {
        if now_us <= self.last_refill_us {
            return 0;
        }

        let elapsed_us = now_us - self.last_refill_us;
        let added =
            u64::try_from(u128::from(elapsed_us) * u128::from(self.rate) / 1_000_000)
                .unwrap_or(u64::MAX);

        if added == 0 {
            return 0;
        }

        let before = self.tokens;
        self.tokens = self.tokens.saturating_add(added).min(self.capacity);
        self.last_refill_us = now_us;
        self.tokens - before
    }

    /// Consumes `tokens` if available, failing otherwise.
    ///
    /// # Errors
    /// Returns `FlowError::RateLimitExceeded` on insufficient tokens.
    pub fn try_acquire(&mut self, tokens: u64, now_us: u64) -> FlowResult<()> {
        self.refill(now_us);

        if self.tokens >= tokens {
            self.tokens -= tokens;
            Ok(())
        } else {
            Err(FlowError::RateLimitExceeded {
                requested: tokens,
                available: self.tokens,
            })
        }
    }

    /// Consumes `tokens`, going into debt if necessary.
    ///
    /// Returns the number of microseconds the caller must wait before the
    /// consumed tokens are actually earned. Zero means the send may proceed
    /// immediately. Acquisitions larger than the capacity are allowed (a
    /// single oversized batch must still be sendable); they simply incur a
    /// proportionally longer wait.
    pub fn acquire_wait_us(&mut self, tokens: u64, now_us: u64) -> u64 {
        self.refill(now_us);

        if self.tokens >= tokens {
            self.tokens -= tokens;
            return 0;
        }

        let shortfall = tokens - self.tokens;
        self.tokens = 0;
        self.last_refill_us = now_us;

        u64::try_from(u128::from(shortfall) * 1_000_000 / u128::from(self.rate.max(1)))
            .unwrap_or(u64::MAX)
    }
}
