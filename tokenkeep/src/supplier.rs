//! Self-starting refreshers behind a cloneable handle

use std::{fmt, sync::Arc, time::Duration};

use aliri_clock::Clock;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "oauth2")]
use crate::{
    sources::oauth2::{ClientCredentials, ClientCredentialsClient, ClientCredentialsTokenSource},
    ClientId, ClientSecret,
};
use crate::{sources::TokenProvider, AccessToken, Refresher, TokenError};

#[async_trait]
trait CurrentToken: Send + Sync {
    async fn current_token(&self, cancel: &CancellationToken) -> Result<AccessToken, TokenError>;
}

#[async_trait]
impl<P, C> CurrentToken for Refresher<P, C>
where
    P: Send + Sync,
    C: Send + Sync,
{
    async fn current_token(&self, cancel: &CancellationToken) -> Result<AccessToken, TokenError> {
        self.token(cancel).await
    }
}

/// A cloneable handle that yields the current token of some refresher
///
/// The handle hides which source the refresher uses and offers no control over its
/// background loop; that stays with whoever holds the loop's cancellation token.
#[derive(Clone)]
pub struct TokenSupplier {
    inner: Arc<dyn CurrentToken>,
}

impl fmt::Debug for TokenSupplier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenSupplier").finish_non_exhaustive()
    }
}

impl TokenSupplier {
    /// Returns the current token, waiting for the first attempt to complete if necessary
    ///
    /// See [`Refresher::token()`].
    pub async fn token(&self, cancel: &CancellationToken) -> Result<AccessToken, TokenError> {
        self.inner.current_token(cancel).await
    }
}

impl<P, C> From<Arc<Refresher<P, C>>> for TokenSupplier
where
    P: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    fn from(refresher: Arc<Refresher<P, C>>) -> Self {
        Self { inner: refresher }
    }
}

/// Spawns the background loop of `refresher` onto the current tokio runtime
///
/// The loop stops when `cancel` fires.
pub fn spawn_refresher<P, C>(refresher: Arc<Refresher<P, C>>, cancel: CancellationToken)
where
    P: TokenProvider + 'static,
    C: Clock + Send + Sync + 'static,
{
    let join = tokio::spawn(async move { refresher.run(cancel).await });

    tokio::spawn(async move {
        if let Err(err) = join.await {
            if err.is_panic() {
                tracing::error!("token refresher panicked!")
            } else if err.is_cancelled() {
                tracing::info!("token refresher was aborted")
            }
        }
    });
}

/// Starts refreshing tokens from `provider` in the background
///
/// Tokens are considered valid for `ttl` after being obtained, and the background loop
/// runs until `cancel` fires. A token may not have been obtained yet when this returns;
/// the first call to [`TokenSupplier::token()`] waits for it.
///
/// Must be called from within a tokio runtime.
pub fn spawn_refreshing<P>(provider: P, ttl: Duration, cancel: CancellationToken) -> TokenSupplier
where
    P: TokenProvider + 'static,
{
    let refresher = Arc::new(Refresher::new(provider, ttl));
    spawn_refresher(Arc::clone(&refresher), cancel);
    TokenSupplier::from(refresher)
}

/// Starts refreshing tokens obtained through the OAuth2 _client credentials_ exchange
///
/// See [`spawn_refreshing()`].
#[cfg(feature = "oauth2")]
#[cfg_attr(docsrs, doc(cfg(feature = "oauth2")))]
pub fn spawn_client_credentials<T>(
    client: T,
    client_id: ClientId,
    client_secret: ClientSecret,
    ttl: Duration,
    cancel: CancellationToken,
) -> TokenSupplier
where
    T: ClientCredentialsClient + 'static,
{
    let credentials = ClientCredentials {
        client_id,
        client_secret,
    };
    spawn_refreshing(
        ClientCredentialsTokenSource::new(client, credentials),
        ttl,
        cancel,
    )
}
