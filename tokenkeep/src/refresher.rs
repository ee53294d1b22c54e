use std::{
    error,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use aliri_clock::{Clock, System, UnixTime};
use thiserror::Error;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::RetryPolicy,
    retry::{retry_with, RetryError},
    sources::TokenProvider,
    AccessToken,
};

/// How far each refresh may be moved away from the middle of the TTL window,
/// as a fraction of the refresh interval
const REFRESH_RANDOMIZATION: f64 = 0.2;

type SharedError = Arc<dyn error::Error + Send + Sync + 'static>;

/// Why a caller stopped waiting for the first token
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitAborted {
    /// The caller's cancellation token fired
    Cancelled,
    /// The caller's deadline passed
    DeadlineExceeded,
    /// The refresher stopped before any attempt completed
    RefresherStopped,
}

/// An error obtaining the current token from a [`Refresher`]
#[derive(Clone, Debug, Error)]
pub enum TokenError {
    /// No attempt to obtain a token has completed yet
    #[error("token is not yet initialized")]
    NotYetInitialized,
    /// Waiting for the first attempt to complete was abandoned
    #[error("context completed while waiting for initialization")]
    Cancelled {
        /// Why waiting stopped
        reason: WaitAborted,
    },
    /// No attempt to obtain a token has ever succeeded
    #[error("all attempts to retrieve a credential have failed")]
    AllAttemptsFailed {
        /// The error from the most recent attempt
        #[source]
        source: Option<SharedError>,
        /// The configured token TTL
        ttl: Duration,
    },
    /// The cached token outlived its TTL and the attempts since to replace it have failed
    #[error("credential is expired, attempts to obtain a new one have failed")]
    ExpiredFailed {
        /// The error from the most recent attempt
        source: SharedError,
        /// When the expired token was obtained
        acquired_at: UnixTime,
        /// The configured token TTL
        ttl: Duration,
    },
    /// The cached token outlived its TTL and no attempt to replace it has completed
    #[error("credential is expired, attempts to obtain a new one have not completed")]
    ExpiredPending {
        /// When the expired token was obtained
        acquired_at: UnixTime,
        /// The configured token TTL
        ttl: Duration,
    },
}

impl TokenError {
    /// When the most recent usable token was obtained, if there ever was one
    pub fn acquired_at(&self) -> Option<UnixTime> {
        match self {
            Self::ExpiredFailed { acquired_at, .. } | Self::ExpiredPending { acquired_at, .. } => {
                Some(*acquired_at)
            }
            _ => None,
        }
    }

    /// The TTL the token was judged against, if the cache was consulted
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            Self::AllAttemptsFailed { ttl, .. }
            | Self::ExpiredFailed { ttl, .. }
            | Self::ExpiredPending { ttl, .. } => Some(*ttl),
            _ => None,
        }
    }
}

/// A failed attempt to fetch a token from the underlying source
#[derive(Debug, Error)]
pub enum FetchError<E: error::Error + 'static> {
    /// The source reported an error
    #[error(transparent)]
    Provider(E),
    /// The source reported success but handed back an empty token
    #[error("token source returned an empty token")]
    EmptyToken,
}

#[derive(Clone, Debug)]
struct Acquired {
    token: AccessToken,
    at: Instant,
    at_wall: UnixTime,
}

/// The state published after every completed attempt
///
/// Always replaced as a whole, so readers never see a token paired with
/// the wrong acquisition time.
#[derive(Clone, Debug)]
struct CachedCredential {
    acquired: Option<Acquired>,
    last_error: Option<SharedError>,
}

impl CachedCredential {
    fn evaluate(&self, ttl: Duration, now: Instant) -> Result<AccessToken, TokenError> {
        let acquired = match &self.acquired {
            Some(acquired) => acquired,
            None => {
                return Err(TokenError::AllAttemptsFailed {
                    source: self.last_error.clone(),
                    ttl,
                })
            }
        };

        if now.saturating_duration_since(acquired.at) > ttl {
            return Err(match &self.last_error {
                Some(error) => TokenError::ExpiredFailed {
                    source: Arc::clone(error),
                    acquired_at: acquired.at_wall,
                    ttl,
                },
                None => TokenError::ExpiredPending {
                    acquired_at: acquired.at_wall,
                    ttl,
                },
            });
        }

        // Still usable, even if the latest attempt to replace it failed
        Ok(acquired.token.clone())
    }
}

/// Keeps a token fresh in the background and hands it out to any number of callers
///
/// A refresher does nothing until [`run()`][Self::run] is started, normally on a
/// spawned task. Share the refresher with an [`Arc`] so that callers can use
/// [`token()`][Self::token] while the loop runs.
///
/// ```
/// use std::{sync::Arc, time::Duration};
/// use tokenkeep::{sources::ConstTokenSource, CancellationToken, Refresher};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let refresher = Arc::new(Refresher::new(
///     ConstTokenSource::new("token"),
///     Duration::from_secs(300),
/// ));
///
/// let shutdown = CancellationToken::new();
/// tokio::spawn({
///     let refresher = Arc::clone(&refresher);
///     let shutdown = shutdown.clone();
///     async move { refresher.run(shutdown).await }
/// });
///
/// let token = refresher.token(&CancellationToken::new()).await.unwrap();
/// assert_eq!(token.as_str(), "token");
/// shutdown.cancel();
/// # }
/// ```
#[derive(Debug)]
pub struct Refresher<P, C = System> {
    provider: P,
    ttl: Duration,
    retry_policy: RetryPolicy,
    clock: C,
    state: watch::Sender<Option<CachedCredential>>,
    stopped: CancellationToken,
    started: AtomicBool,
}

impl<P> Refresher<P, System> {
    /// Constructs a new refresher for tokens that remain valid for `ttl` after being obtained
    pub fn new(provider: P, ttl: Duration) -> Self {
        Self::with_clock(provider, ttl, System)
    }
}

impl<P, C> Refresher<P, C> {
    /// Constructs a new refresher that stamps tokens using the given clock
    ///
    /// The clock only affects the acquisition times reported in errors; expiry
    /// is always judged against the monotonic clock.
    pub fn with_clock(provider: P, ttl: Duration, clock: C) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            provider,
            ttl,
            retry_policy: RetryPolicy::default(),
            clock,
            state,
            stopped: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Sets how each refresh retries a failing source
    ///
    /// Defaults to retrying without limit.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// The configured token TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the current token, waiting for the first attempt to complete if necessary
    ///
    /// Fails if `cancel` fires first. Once any attempt has completed, this never waits.
    pub async fn token(&self, cancel: &CancellationToken) -> Result<AccessToken, TokenError> {
        self.wait_for_initialized(async {
            cancel.cancelled().await;
            WaitAborted::Cancelled
        })
        .await?;
        self.try_token()
    }

    /// Returns the current token, waiting at most `timeout` for the first attempt to complete
    pub async fn token_with_timeout(&self, timeout: Duration) -> Result<AccessToken, TokenError> {
        self.wait_for_initialized(async {
            tokio::time::sleep(timeout).await;
            WaitAborted::DeadlineExceeded
        })
        .await?;
        self.try_token()
    }

    /// Returns the current token without waiting
    ///
    /// Fails with [`TokenError::NotYetInitialized`] if no attempt has completed yet.
    pub fn try_token(&self) -> Result<AccessToken, TokenError> {
        let state = self.state.borrow();
        match &*state {
            Some(credential) => credential.evaluate(self.ttl, Instant::now()),
            None => Err(TokenError::NotYetInitialized),
        }
    }

    async fn wait_for_initialized<F>(&self, abandoned: F) -> Result<(), TokenError>
    where
        F: Future<Output = WaitAborted>,
    {
        let mut state = self.state.subscribe();
        let initialized = async move { state.wait_for(Option::is_some).await.is_ok() };

        tokio::select! {
            biased;
            true = initialized => Ok(()),
            _ = self.stopped.cancelled() => Err(TokenError::Cancelled {
                reason: WaitAborted::RefresherStopped,
            }),
            reason = abandoned => Err(TokenError::Cancelled { reason }),
        }
    }
}

impl<P, C> Refresher<P, C>
where
    P: TokenProvider,
    C: Clock,
{
    /// Refreshes the token until `cancel` fires
    ///
    /// The first attempt happens immediately. After that, a refresh is started about every
    /// half TTL, randomized by up to 20% so that many instances do not all refresh at once.
    /// Each refresh retries the source according to the refresher's retry policy, publishing
    /// the outcome of every attempt. Failures never end the loop.
    ///
    /// Cancellation interrupts waiting between attempts, but an attempt already underway is
    /// allowed to finish. A refresher can only be run once; later calls return immediately.
    pub async fn run(&self, cancel: CancellationToken) {
        if self.started.swap(true, Ordering::AcqRel) {
            tracing::warn!("token refresher is already running, ignoring");
            return;
        }

        // Releases anyone still waiting on the first token, even if this future is dropped
        let _stopped = self.stopped.clone().drop_guard();

        let refresh_interval = (self.ttl / 2).max(Duration::from_millis(1));
        let mut ticker = RetryPolicy::periodic(refresh_interval, REFRESH_RANDOMIZATION).backoff();

        tracing::debug!(
            ttl_ms = self.ttl.as_millis() as u64,
            refresh_interval_ms = refresh_interval.as_millis() as u64,
            "starting token refresher"
        );

        loop {
            let refreshed = retry_with(
                "token refresh",
                self.retry_policy.backoff(),
                &cancel,
                || self.attempt(&cancel),
            )
            .await;

            match refreshed {
                Ok(()) => {}
                Err(RetryError::Cancelled { .. }) => break,
                Err(RetryError::Exhausted { attempts, .. }) => {
                    tracing::debug!(attempts, "giving up on this refresh until the next one");
                }
            }

            let delay = match ticker.next_delay() {
                Some(delay) => delay,
                None => break,
            };

            tracing::trace!(delay_ms = delay.as_millis() as u64, "waiting for next refresh");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("token refresher stopped");
    }

    async fn attempt(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), Arc<FetchError<P::Error>>> {
        tracing::debug!("requesting token from source");

        let outcome = match self.provider.provide_token(cancel).await {
            Ok(token) if token.as_str().is_empty() => Err(Arc::new(FetchError::EmptyToken)),
            Ok(token) => Ok(token),
            Err(error) => Err(Arc::new(FetchError::Provider(error))),
        };

        match outcome {
            Ok(token) => {
                self.publish(Ok(token));
                Ok(())
            }
            Err(error) => {
                self.publish(Err(Arc::clone(&error) as SharedError));
                Err(error)
            }
        }
    }

    fn publish(&self, outcome: Result<AccessToken, SharedError>) {
        let now = Instant::now();
        let mut first = false;

        self.state.send_modify(|state| {
            let previous = state.take();
            first = previous.is_none();

            let next = match outcome {
                Ok(token) => CachedCredential {
                    acquired: Some(Acquired {
                        token,
                        at: now,
                        at_wall: self.clock.now(),
                    }),
                    last_error: None,
                },
                Err(error) => CachedCredential {
                    acquired: previous.and_then(|previous| previous.acquired),
                    last_error: Some(error),
                },
            };
            *state = Some(next);
        });

        if first {
            tracing::info!("token refresher initialized");
        }
    }
}
