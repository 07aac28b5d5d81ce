//! Randomised exponential backoff.
//!
//! The delay before retry `n` is drawn from a normal distribution with mean
//! `base × factor^n` and a fixed standard deviation, clamped at zero.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub jitter: Duration,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, jitter: Duration) -> Self {
        Self { base, factor, jitter }
    }

    /// No delay at all. Used by tests.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, 1.0, Duration::ZERO)
    }

    /// Expected delay before retry number `retry_count`.
    pub fn mean(&self, retry_count: u32) -> Duration {
        let exp = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.factor.powi(exp);
        Duration::from_secs_f64(if secs.is_finite() { secs.max(0.0) } else { 0.0 })
    }

    pub fn delay(&self, retry_count: u32) -> Duration {
        self.delay_with(retry_count, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> Duration {
        let mean_ms = self.mean(retry_count).as_secs_f64() * 1_000.0;
        let std_ms = self.jitter.as_secs_f64() * 1_000.0;
        let sampled = match Normal::new(mean_ms, std_ms) {
            Ok(normal) => normal.sample(rng),
            Err(_) => mean_ms,
        };
        if !sampled.is_finite() {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(sampled.max(0.0) / 1_000.0)
    }
}
