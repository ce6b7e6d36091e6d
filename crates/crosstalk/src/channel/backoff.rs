//! Reconnection backoff: exponential growth with full jitter.
//!
//! The deterministic ceiling grows `base * multiplier^attempt` up to the cap;
//! each sampled delay is drawn uniformly from `[0, ceiling]` so a fleet of
//! reconnecting channels does not thunder in lockstep.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

pub struct Backoff {
    cfg: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(cfg: BackoffConfig) -> Self {
        Self { cfg, attempt: 0 }
    }

    /// The deterministic upper bound for the next delay. Monotonically
    /// non-decreasing across attempts until [`reset`](Self::reset).
    pub fn current_ceiling(&self) -> Duration {
        let exp = self.cfg.base_ms as f64 * self.cfg.multiplier.powi(self.attempt as i32);
        Duration::from_millis(exp.min(self.cfg.cap_ms as f64) as u64)
    }

    /// Sample the next delay (full jitter) and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.current_ceiling();
        self.attempt = self.attempt.saturating_add(1);
        let ms = rand::rng().random_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(ms)
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Return to the base delay after a sustained successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
