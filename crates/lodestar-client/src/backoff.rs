//! Randomized exponential backoff for re-registration
//!
//! Every failed attempt `r` adds `2^r` seconds to a pool of candidate delays
//! for the current recovery episode, and the delay actually slept is drawn
//! uniformly from that pool. Early small magnitudes stay in the pool, so
//! repeated failures spread out instead of marching in lockstep.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Largest exponent accepted; keeps `2^r` seconds meaningful.
const MAX_EXPONENT: u32 = 16;

/// Backoff state for one recovery episode.
#[derive(Debug)]
pub struct Backoff {
    magnitudes: Vec<u64>,
    unit: Duration,
    rng: StdRng,
}

impl Backoff {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_os_rng())
    }

    /// Deterministic backoff, for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            magnitudes: Vec::new(),
            unit: Duration::from_secs(1),
            rng,
        }
    }

    /// Record the failure of attempt `attempt` and pick the delay before the next one.
    pub fn next_delay(&mut self, attempt: u32) -> Duration {
        self.magnitudes.push(1 << attempt.min(MAX_EXPONENT));
        let pick = self.magnitudes[self.rng.random_range(0..self.magnitudes.len())];
        self.unit * pick as u32
    }

    /// Candidate magnitudes accumulated so far, in units of one second.
    pub fn magnitudes(&self) -> &[u64] {
        &self.magnitudes
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
