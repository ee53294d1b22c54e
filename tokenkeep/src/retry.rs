//! Retrying token retrieval

use std::{error, future::Future};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::{Backoff, RetryPolicy},
    jitter::JitterSource,
    sources::TokenProvider,
    AccessToken,
};

/// The terminal outcome of a retried operation that never succeeded
#[derive(Debug, Error)]
pub enum RetryError<E: error::Error + 'static> {
    /// The retry policy ran out of attempts
    #[error("token retrieval timed out after {attempts} attempts")]
    Exhausted {
        /// The number of attempts made
        attempts: u32,
        /// The error from the final attempt
        source: E,
    },
    /// Retrying stopped because the caller cancelled
    #[error("token retrieval cancelled after {attempts} attempts")]
    Cancelled {
        /// The number of attempts made before cancellation
        attempts: u32,
        /// The error from the most recent attempt, if any attempt was made
        #[source]
        last_error: Option<E>,
    },
}

impl<E: error::Error + 'static> RetryError<E> {
    /// The number of attempts made
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Runs `attempt` until it succeeds, `backoff` is exhausted, or `cancel` fires
///
/// Cancellation is checked before every attempt and interrupts any backoff
/// delay, but an attempt already underway is allowed to finish.
pub(crate) async fn retry_with<T, E, F, Fut, J>(
    operation: &'static str,
    mut backoff: Backoff<J>,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: error::Error + 'static,
    J: JitterSource,
{
    let mut attempts = 0;
    let mut last_error = None;

    loop {
        if cancel.is_cancelled() {
            tracing::debug!(operation, attempts, "cancelled before next attempt");
            return Err(RetryError::Cancelled {
                attempts,
                last_error,
            });
        }

        attempts += 1;
        let error = match attempt().await {
            Ok(value) => {
                if attempts > 1 {
                    tracing::debug!(operation, attempts, "succeeded after retrying");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        let delay = match backoff.next_delay() {
            Some(delay) => delay,
            None => {
                tracing::error!(
                    operation,
                    attempts,
                    error = (&error as &dyn error::Error),
                    "attempt failed, no attempts remaining"
                );
                return Err(RetryError::Exhausted {
                    attempts,
                    source: error,
                });
            }
        };

        tracing::warn!(
            operation,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = (&error as &dyn error::Error),
            "attempt failed, will retry"
        );
        last_error = Some(error);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(operation, attempts, "cancelled while backing off");
                return Err(RetryError::Cancelled {
                    attempts,
                    last_error,
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// A token source that retries another source according to a [`RetryPolicy`]
///
/// Every call starts a fresh sequence of attempts; nothing is remembered
/// between calls.
#[derive(Debug)]
pub struct RetryingTokenProvider<P> {
    inner: P,
    policy: RetryPolicy,
}

impl<P> RetryingTokenProvider<P> {
    /// Wraps `inner` with the given retry policy
    pub fn new(inner: P, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Wraps `inner` so that it is retried until it succeeds or the caller cancels
    pub fn forever(inner: P) -> Self {
        Self::new(inner, RetryPolicy::default().with_unlimited_attempts())
    }

    /// The retry policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<P: TokenProvider> TokenProvider for RetryingTokenProvider<P> {
    type Error = RetryError<P::Error>;

    async fn provide_token(&self, cancel: &CancellationToken) -> Result<AccessToken, Self::Error> {
        let inner = &self.inner;
        retry_with("token retrieval", self.policy.backoff(), cancel, || {
            inner.provide_token(cancel)
        })
        .await
    }
}
