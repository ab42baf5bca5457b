//! Rate limiting for message dispatch

use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;

use crate::shutdown::ShutdownListener;

/// Split a global target rate evenly across `workers`
///
/// Returns `None` (unlimited) when the rate is unset, non-positive or not
/// finite, or when there are no workers.
pub fn per_worker_rate(global: Option<f64>, workers: usize) -> Option<f64> {
    match global {
        Some(rate) if rate > 0.0 && rate.is_finite() && workers > 0 => {
            Some(rate / workers as f64)
        }
        _ => None,
    }
}

/// Outcome of [`MessageRateLimiter::wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// A token was taken; go ahead
    Granted,
    /// Shutdown was observed while waiting
    Cancelled,
}

/// Per-worker token bucket
///
/// Each worker owns its limiter; nothing here is shared. The bucket refills
/// at `rate` tokens per second and holds at most `capacity` tokens, so a
/// worker never bursts past `capacity` messages after an idle period.
pub struct MessageRateLimiter {
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    rate: Option<f64>,
    capacity: u32,
}

impl MessageRateLimiter {
    /// Create a limiter for `rate` messages per second
    ///
    /// `None`, zero, negative or non-finite rates disable limiting. A
    /// `capacity` of zero is treated as one.
    ///
    /// # Examples
    /// ```
    /// use pubsub_bench_core::worker::MessageRateLimiter;
    ///
    /// let limiter = MessageRateLimiter::new(Some(100.0), 1);
    /// assert!(limiter.is_enabled());
    ///
    /// let unlimited = MessageRateLimiter::new(None, 1);
    /// assert!(!unlimited.is_enabled());
    /// ```
    pub fn new(rate: Option<f64>, capacity: u32) -> Self {
        let capacity = capacity.max(1);
        let limiter = rate.and_then(|rps| {
            if rps <= 0.0 || !rps.is_finite() {
                return None;
            }
            // Fractional rates are expressed as a replenish period, so 0.5/s
            // really means one message every two seconds.
            let period = Duration::try_from_secs_f64(1.0 / rps).ok()?;
            let quota = Quota::with_period(period)?.allow_burst(NonZeroU32::new(capacity)?);
            Some(RateLimiter::direct(quota))
        });

        Self {
            rate: limiter.as_ref().and(rate),
            limiter,
            capacity,
        }
    }

    /// Create an unlimited rate limiter (no rate limiting)
    pub fn unlimited() -> Self {
        Self::new(None, 1)
    }

    /// Wait until a message may be sent, or until shutdown
    ///
    /// Returns immediately with [`Permit::Granted`] if limiting is disabled.
    /// Shutdown is checked before waiting and raced against the wait, so a
    /// stop request is never held up by the bucket.
    pub async fn wait(&self, shutdown: &mut ShutdownListener) -> Permit {
        if shutdown.is_shutdown() {
            return Permit::Cancelled;
        }
        let Some(limiter) = &self.limiter else {
            return Permit::Granted;
        };

        tokio::select! {
            biased;
            _ = shutdown.recv() => Permit::Cancelled,
            _ = limiter.until_ready() => Permit::Granted,
        }
    }

    /// Try to take a token without waiting
    ///
    /// Always `true` if limiting is disabled.
    pub fn try_acquire(&self) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        }
    }

    /// Check if rate limiting is enabled
    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Effective rate in messages per second, if limited
    pub fn rate(&self) -> Option<f64> {
        self.rate
    }

    /// Bucket capacity
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl Default for MessageRateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl std::fmt::Debug for MessageRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRateLimiter")
            .field("rate", &self.rate)
            .field("capacity", &self.capacity)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
