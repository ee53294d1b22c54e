//! Background refresh and caching of short-lived bearer credentials
//!
//! Many services need to present a bearer credential that an authority only issues for a
//! short time. This library keeps one such credential fresh in the background so that any
//! number of callers can pick up the current value without ever waiting on the authority
//! themselves, except for the very first fetch.
//!
//! A [`Refresher`] owns the cached credential. Its background loop,
//! [`Refresher::run()`], fetches a new credential about every half TTL, randomized so that
//! many instances do not refresh in lockstep, and retries failures according to a
//! [`RetryPolicy`][backoff::RetryPolicy]. Readers call [`Refresher::token()`], which only
//! waits until the first fetch attempt has completed and afterwards answers straight from
//! the cache:
//!
//! * a credential obtained within the TTL is returned, even if later refreshes failed;
//! * once the TTL has passed, the caller gets an error explaining whether refreshes have
//!   been failing or simply have not completed yet;
//! * if no fetch has ever succeeded, the caller gets the most recent failure.
//!
//! Retrying a fetch and expiring a stale credential are deliberately separate: the retry
//! policy deals with transient failures, while the TTL bounds how long a stale credential
//! stays usable.
//!
//! # General Flow (Client Credentials)
//!
//! Most applications only need a [`TokenSupplier`][supplier::TokenSupplier]: a cloneable
//! handle that yields the current credential and hides the refresh loop entirely.
//!
//! ```
//! use std::time::Duration;
//! use tokenkeep::{sources::oauth2, supplier, CancellationToken, ClientId, ClientSecret};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = oauth2::ReqwestClientCredentialsClient::new(
//!     reqwest::Client::new(),
//!     "https://auth.example.com/oauth2/token".parse()?,
//! );
//!
//! let shutdown = CancellationToken::new();
//! let tokens = supplier::spawn_client_credentials(
//!     client,
//!     ClientId::from_static("my-service"),
//!     ClientSecret::from_static("hunter2"),
//!     Duration::from_secs(3600),
//!     shutdown.clone(),
//! );
//!
//! # /* Commented out due to this trying to interact with the world.
//! let token = tokens.token(&shutdown).await?;
//! tracing::info!(token = format_args!("{:#?}", token), "obtained access token");
//! # */
//! # drop(tokens);
//! shutdown.cancel();
//! # Ok(())
//! # }
//! ```
//!
//! This crate includes an example of a client credentials refresher in the examples folder.
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `oauth2`: Provides a token source that performs the OAuth2 _client credentials_
//!   exchange over [reqwest].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod backoff;
mod braids;
pub mod jitter;
mod refresher;
pub mod retry;
pub mod sources;
pub mod supplier;

pub use braids::*;
pub use refresher::{FetchError, Refresher, TokenError, WaitAborted};
pub use tokio_util::sync::CancellationToken;
