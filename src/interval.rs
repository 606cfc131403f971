//! Jitter helper for periodic background tasks.
//!
//! A fleet restarted at the same moment would otherwise fire all of its
//! timers in lockstep and hammer Redis together.

use std::time::Duration;

use rand::RngExt;

/// Maximum relative offset applied in either direction.
const RANDOM_OFFSET_RATIO: f64 = 0.1;

/// Returns `interval` perturbed by a random factor within ±10%.
pub fn with_jitter(interval: Duration) -> Duration {
    let factor = 1.0 + rand::rng().random_range(-RANDOM_OFFSET_RATIO..=RANDOM_OFFSET_RATIO);
    interval.mul_f64(factor)
}
