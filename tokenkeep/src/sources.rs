//! Token sources

use std::{convert::Infallible, error, fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::AccessToken;

#[cfg(feature = "oauth2")]
pub mod oauth2;

/// An asynchronous source for tokens
///
/// A successful call yields a non-empty token. Implementations that wait on
/// the network should give up when `cancel` fires; nothing forces them to.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// The error type returned in the event that retrieving a token fails
    type Error: error::Error + Send + Sync + 'static;

    /// Requests a single token from the source
    async fn provide_token(&self, cancel: &CancellationToken) -> Result<AccessToken, Self::Error>;
}

#[async_trait]
impl<P: TokenProvider + ?Sized> TokenProvider for Arc<P> {
    type Error = P::Error;

    async fn provide_token(&self, cancel: &CancellationToken) -> Result<AccessToken, Self::Error> {
        (**self).provide_token(cancel).await
    }
}

#[async_trait]
impl<P: TokenProvider + ?Sized> TokenProvider for Box<P> {
    type Error = P::Error;

    async fn provide_token(&self, cancel: &CancellationToken) -> Result<AccessToken, Self::Error> {
        (**self).provide_token(cancel).await
    }
}

/// A token source that always hands out the same token
#[derive(Clone, Debug)]
pub struct ConstTokenSource {
    token: AccessToken,
}

impl ConstTokenSource {
    /// Constructs a new constant token source
    pub fn new(token: impl Into<AccessToken>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for ConstTokenSource {
    type Error = Infallible;

    async fn provide_token(&self, _: &CancellationToken) -> Result<AccessToken, Self::Error> {
        Ok(self.token.clone())
    }
}

/// A token source backed by an asynchronous function
///
/// ```
/// use tokenkeep::{sources::FnTokenSource, AccessToken, CancellationToken};
///
/// let source = FnTokenSource::new(|_cancel: CancellationToken| async {
///     Ok::<_, std::io::Error>(AccessToken::from_static("token"))
/// });
/// # drop(source);
/// ```
#[derive(Clone)]
pub struct FnTokenSource<F> {
    fetch: F,
}

impl<F> FnTokenSource<F> {
    /// Wraps `fetch`, which is handed a clone of the caller's cancellation token
    pub fn new(fetch: F) -> Self {
        Self { fetch }
    }
}

impl<F> fmt::Debug for FnTokenSource<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FnTokenSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut, E> TokenProvider for FnTokenSource<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AccessToken, E>> + Send + 'static,
    E: error::Error + Send + Sync + 'static,
{
    type Error = E;

    async fn provide_token(&self, cancel: &CancellationToken) -> Result<AccessToken, Self::Error> {
        (self.fetch)(cancel.clone()).await
    }
}
