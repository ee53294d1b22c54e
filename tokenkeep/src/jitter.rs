//! Utilities for adding a bit of jitter to reduce stampeding

use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};

/// A type that provides some jittering of delays
pub trait JitterSource {
    /// Jitters a given delay
    fn jitter(&mut self, delay: Duration) -> Duration;
}

/// A jitter source that does not do any jittering
#[derive(Debug)]
pub struct NullJitter;

impl JitterSource for NullJitter {
    #[inline]
    fn jitter(&mut self, delay: Duration) -> Duration {
        delay
    }
}

/// Spreads a delay uniformly around its nominal value
///
/// Delays jittered by this type fall in the interval
/// `[delay × (1 − factor), delay × (1 + factor)]`.
#[derive(Debug)]
pub struct RandomizedJitter<R> {
    factor: f64,
    rand_source: R,
}

impl RandomizedJitter<StdRng> {
    /// Constructs a new instance that will randomize delays by up to `factor`
    ///
    /// `factor` is clamped to `[0, 1]`.
    pub fn new(factor: f64) -> Self {
        Self::with_rng(factor, StdRng::from_entropy())
    }
}

impl<R> RandomizedJitter<R> {
    /// Constructs a new instance drawing from the given random number generator
    pub fn with_rng(factor: f64, rand_source: R) -> Self {
        let factor = if factor.is_finite() {
            factor.clamp(0.0, 1.0)
        } else {
            0.0
        };

        Self {
            factor,
            rand_source,
        }
    }
}

impl<R: Rng> JitterSource for RandomizedJitter<R> {
    fn jitter(&mut self, delay: Duration) -> Duration {
        if self.factor == 0.0 || delay.is_zero() {
            return delay;
        }

        let nominal = delay.as_secs_f64();
        let spread = nominal * self.factor;
        let jittered = self
            .rand_source
            .gen_range((nominal - spread)..=(nominal + spread));

        Duration::try_from_secs_f64(jittered).unwrap_or(delay)
    }
}
