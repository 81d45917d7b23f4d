//! Retry backoff with jitter.
//!
//! `min(100ms · 1.25^(n-1), 60s)` plus uniform jitter in ±10% of the
//! backoff, seeded per-client.

use std::time::Duration;

use rand::Rng;
use rand::rngs::StdRng;
use rand::SeedableRng;

const BASE_MS: f64 = 100.0;
const MULTIPLIER: f64 = 1.25;
const CAP_MS: f64 = 60_000.0;

/// The deterministic part of the backoff formula, with no jitter
/// applied. `attempt` is 1-based.
pub fn base_backoff(attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let ms = BASE_MS * MULTIPLIER.powi(attempt as i32 - 1);
    Duration::from_millis(ms.min(CAP_MS) as u64)
}

/// Per-client jitter source. Each `ClusterState` owns one, seeded once
/// at construction, so repeated calls within a test are reproducible
/// given a fixed seed while still varying across independent clients.
pub struct JitterSource {
    rng: StdRng,
}

impl JitterSource {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// `base`, jittered by up to ±10%.
    pub fn jitter(&mut self, base: Duration) -> Duration {
        let base_ms = base.as_millis() as f64;
        let jitter_range = base_ms * 0.10;
        let delta = self.rng.random_range(-jitter_range..=jitter_range);
        let jittered = (base_ms + delta).max(0.0);
        Duration::from_millis(jittered as u64)
    }

    pub fn backoff_for_attempt(&mut self, attempt: u32) -> Duration {
        self.jitter(base_backoff(attempt))
    }
}

impl Default for JitterSource {
    fn default() -> Self {
        Self::new()
    }
}
