//! Retry policies and backoff handling

use std::time::Duration;

use rand::rngs::StdRng;

use crate::jitter::{JitterSource, RandomizedJitter};

/// Configuration for how patiently a failing operation should be retried
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    randomization_factor: f64,
}

impl Default for RetryPolicy {
    /// Default retry policy
    ///
    /// Retries without limit. The first retry waits 50 ms, and each following delay doubles,
    /// capped at 2 seconds. Every delay is randomized by up to 15% in either direction.
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
            randomization_factor: 0.15,
        }
    }
}

impl RetryPolicy {
    /// Constructs a new unbounded retry policy
    ///
    /// After the first failure, the delay will be `initial_backoff`. On subsequent failures, the
    /// delay is multiplied by `multiplier`, with a cap of `max_backoff`.
    pub fn new(initial_backoff: Duration, max_backoff: Duration, multiplier: f64) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            multiplier,
            ..Self::default()
        }
    }

    /// A policy that re-runs an operation on a fixed, jittered period and never gives up
    pub(crate) fn periodic(period: Duration, randomization_factor: f64) -> Self {
        Self {
            max_attempts: None,
            initial_backoff: period,
            max_backoff: period,
            multiplier: 1.0,
            randomization_factor,
        }
    }

    /// Limits the total number of attempts, including the first
    ///
    /// A limit of zero is treated as one: the operation always runs at least once.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// Removes any limit on the number of attempts
    pub fn with_unlimited_attempts(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    /// Sets the delay after the first failure
    pub fn with_initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Sets the cap on any single delay
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Sets the factor by which the delay grows after each failure
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets how far, as a fraction of the delay, each delay may be randomized
    pub fn with_randomization_factor(mut self, randomization_factor: f64) -> Self {
        self.randomization_factor = randomization_factor;
        self
    }

    /// The maximum number of attempts, if bounded
    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Starts a fresh backoff sequence using randomized jitter
    pub fn backoff(&self) -> Backoff<RandomizedJitter<StdRng>> {
        self.backoff_with_jitter(RandomizedJitter::new(self.randomization_factor))
    }

    /// Starts a fresh backoff sequence using the given jitter source
    pub fn backoff_with_jitter<J: JitterSource>(&self, jitter: J) -> Backoff<J> {
        Backoff {
            policy: self.clone(),
            jitter,
            attempts: 0,
            last_delay: None,
        }
    }
}

/// A stateful handler tracking one sequence of attempts against a [`RetryPolicy`]
#[derive(Debug)]
pub struct Backoff<J> {
    policy: RetryPolicy,
    jitter: J,
    attempts: u32,
    last_delay: Option<Duration>,
}

impl<J: JitterSource> Backoff<J> {
    /// Reports a failed attempt and returns the delay before the next one
    ///
    /// Returns `None` once the policy's attempt budget has been spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if matches!(self.policy.max_attempts, Some(max) if self.attempts >= max) {
            return None;
        }

        let max = self.policy.max_backoff;
        let delay = match self.last_delay {
            None => self.policy.initial_backoff.min(max),
            Some(last) => {
                let scaled = last.as_nanos() as f64 * self.policy.multiplier;
                if scaled.is_finite() && scaled >= 0.0 && scaled < max.as_nanos() as f64 {
                    Duration::from_nanos(scaled as u64)
                } else {
                    max
                }
            }
        };
        self.last_delay = Some(delay);

        Some(self.jitter.jitter(delay))
    }

    /// The number of failed attempts reported so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reports a success
    ///
    /// This resets the internal delay state.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_delay = None;
    }
}
