//! Per-identity token bucket.
//!
//! Each identity gets `capacity` tokens refilled continuously at
//! `refill_per_sec`. Refill happens lazily on each acquire, atomically with
//! the take. Buckets are only ever touched by [`RateLimitGate`].
//!
//! A bucket that has refilled to capacity carries no state a fresh bucket
//! would not, so [`RateLimitGate::sweep_idle`] drops it.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use super::errors::{AdmissionError, AuthError};
use super::{AdmissionContext, AdmissionGate};

/// One identity's bucket.
#[derive(Clone, Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens_remaining: f64,
    last_refill_at: Instant,
}

impl TokenBucket {
    /// Full bucket.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec,
            tokens_remaining: f64::from(capacity),
            last_refill_at: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill_at);
        self.tokens_remaining = (self.tokens_remaining
            + elapsed.as_secs_f64() * self.refill_per_sec)
            .min(self.capacity);
        self.last_refill_at = now;
    }

    /// Take one token, or report how long until one is available.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens_remaining >= 1.0 {
            self.tokens_remaining -= 1.0;
            return Ok(());
        }
        let deficit = 1.0 - self.tokens_remaining;
        Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
    }

    /// Whole tokens currently available.
    pub fn available(&self) -> u32 {
        self.tokens_remaining.floor() as u32
    }

    /// Whether the bucket is back at capacity as of `now`.
    pub fn is_full_at(&self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill_at);
        self.tokens_remaining + elapsed.as_secs_f64() * self.refill_per_sec >= self.capacity
    }
}

/// Second pipeline stage: one token per connection attempt.
pub struct RateLimitGate {
    capacity: u32,
    refill_per_sec: f64,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimitGate {
    /// Gate handing each new identity a full bucket.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_per_sec: if refill_per_sec.is_finite() && refill_per_sec > 0.0 {
                refill_per_sec
            } else {
                1.0
            },
            buckets: DashMap::new(),
        }
    }

    /// Number of identities with a bucket.
    pub fn tracked_identities(&self) -> usize {
        self.buckets.len()
    }

    /// Drop buckets that have refilled completely. Returns how many went.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_full_at(now));
        before.saturating_sub(self.buckets.len())
    }
}

impl AdmissionGate for RateLimitGate {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn check(&self, ctx: &mut AdmissionContext<'_>) -> Result<(), AdmissionError> {
        // keyed per identity, so auth must already have run
        let subject = ctx
            .identity
            .as_ref()
            .map(|i| i.subject.clone())
            .ok_or(AuthError::MissingCredential)?;
        let mut bucket = self
            .buckets
            .entry(subject)
            .or_insert_with(|| TokenBucket::new(self.capacity, self.refill_per_sec));
        bucket
            .try_acquire(Instant::now())
            .map_err(|retry_after| AdmissionError::RateLimited { retry_after })
    }
}
