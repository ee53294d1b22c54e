//! Middleware to automatically attach authorization to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AccessTokenMiddleware`] in the middleware stack to use
//! the current access token provided by a [`TokenSupplier`] for each outbound
//! request.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! If no usable token is available, the request is not sent and fails with
//! an [`AuthorizationError`] instead.
//!
//! ```
//! use std::time::Duration;
//! use tokenkeep::{sources::ConstTokenSource, supplier, CancellationToken};
//! use tokenkeep_reqwest::AccessTokenMiddleware;
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let shutdown = CancellationToken::new();
//! let tokens = supplier::spawn_refreshing(
//!     ConstTokenSource::new("token"),
//!     Duration::from_secs(300),
//!     shutdown.clone(),
//! );
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AccessTokenMiddleware::new(tokens))
//!     .build();
//!
//! let req = client
//!     .get("https://example.com");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # shutdown.cancel();
//! # }
//! ```
//!
//! The middleware can also be configured to add an authorization token
//! only conditionally. This can be useful in the event that you want to
//! use a single common middleware stack with multiple potential backends
//! and want to ensure that specific tokens are used for specific backends.
//!
//! These predicates can be composed together to evaluate more complex
//! requirements prior to attaching a token to a request.
//!
//! ```
//! use std::time::Duration;
//! use tokenkeep_reqwest::{
//!     AccessTokenMiddleware, ExactHostMatch, HttpsOnly
//! };
//! use predicates::prelude::PredicateBooleanExt;
//! # use tokenkeep::{sources::ConstTokenSource, supplier, CancellationToken};
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let shutdown = CancellationToken::new();
//! # let tokens = supplier::spawn_refreshing(ConstTokenSource::new("token"), Duration::from_secs(300), shutdown.clone());
//!
//! AccessTokenMiddleware::new(tokens)
//!     .with_predicate(HttpsOnly.and(ExactHostMatch::new("example.com")));
//! # shutdown.cancel();
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::fmt;

use bytes::{BufMut, BytesMut};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response};
use reqwest_middleware::{Middleware, Next, Result};
use thiserror::Error;
use tokenkeep::{supplier::TokenSupplier, AccessTokenRef, CancellationToken, TokenError};

/// A failure to authorize an outgoing request
#[derive(Debug, Error)]
pub enum AuthorizationError {
    /// No usable token could be obtained
    #[error("unable to obtain an access token for the request")]
    Token(#[from] TokenError),
    /// The token cannot be expressed as a header value
    #[error("access token is not a valid header value")]
    InvalidHeader(#[from] header::InvalidHeaderValue),
}

/// A middleware that injects an access token into outgoing requests
#[derive(Clone, Debug)]
pub struct AccessTokenMiddleware<P> {
    tokens: TokenSupplier,
    cancel: CancellationToken,
    predicate: P,
}

impl AccessTokenMiddleware<HttpsOnly> {
    /// Construct a new middleware from a token supplier
    ///
    /// By default, this middleware will only send its token if the request
    /// is being sent via HTTPS. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(tokens: TokenSupplier) -> Self {
        Self {
            tokens,
            cancel: CancellationToken::new(),
            predicate: HttpsOnly,
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> AccessTokenMiddleware<P> {
        AccessTokenMiddleware {
            tokens: self.tokens,
            cancel: self.cancel,
            predicate,
        }
    }
}

impl<P> AccessTokenMiddleware<P> {
    /// Stops requests from waiting on the first token once `cancel` fires
    ///
    /// Without this, a request made before the first token has been obtained
    /// waits until the first attempt to obtain one completes.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn get_token_from_source(
        &self,
    ) -> std::result::Result<header::HeaderValue, AuthorizationError> {
        let token = self.tokens.token(&self.cancel).await.map_err(|error| {
            tracing::warn!(%error, "no access token available for request");
            error
        })?;

        tracing::trace!(
            token = format_args!("{:#?}", token),
            "obtained access token"
        );

        bearer_header(&token)
    }
}

fn bearer_header(
    token: &AccessTokenRef,
) -> std::result::Result<header::HeaderValue, AuthorizationError> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());
    let mut value = header::HeaderValue::from_maybe_shared(header_value.freeze())?;
    value.set_sensitive(true);
    Ok(value)
}

#[async_trait::async_trait]
impl<P> Middleware for AccessTokenMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if self.predicate.eval(&req) && !req.headers().contains_key(header::AUTHORIZATION) {
            let value = self
                .get_token_from_source()
                .await
                .map_err(reqwest_middleware::Error::middleware)?;
            req.headers_mut().insert(header::AUTHORIZATION, value);
        }

        next.run(req, extensions).await
    }
}

/// Reports the request property that made a predicate disagree with `expected`
fn mismatch<'a>(
    predicate: &'a dyn reflection::PredicateReflection,
    expected: bool,
    result: bool,
    property: &'static str,
    value: impl FnOnce() -> String,
) -> Option<reflection::Case<'a>> {
    (result != expected).then(|| {
        reflection::Case::new(Some(predicate), result)
            .add_product(reflection::Product::new(property, value()))
    })
}

/// Only attach an access token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        mismatch(self, expected, self.eval(req), "scheme", || {
            req.url().scheme().to_owned()
        })
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("request is sent over https")
    }
}

/// Only attach an access token if the request is being sent to the exact host specified
///
/// Hosts are compared without regard to ASCII case. Subdomains do not match.
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host string
    pub fn new<S>(host: S) -> Self
    where
        S: ToString,
    {
        Self {
            host: host.to_string().to_ascii_lowercase(),
        }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url()
            .host_str()
            .is_some_and(|host| host.eq_ignore_ascii_case(&self.host))
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        mismatch(self, expected, self.eval(req), "host", || {
            req.url().host_str().unwrap_or("<no host>").to_owned()
        })
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request host is {}", self.host)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use reqwest::Client;
    use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
    use tokenkeep::{
        sources::{ConstTokenSource, FnTokenSource},
        supplier, AccessToken,
    };

    use super::*;

    const TEST_TOKEN: &str = "this-is-a-test-token";
    const BEARER_TEST_TOKEN: &str = "Bearer this-is-a-test-token";
    const TTL: Duration = Duration::from_secs(300);

    /// Ends the middleware chain, remembering the authorization each request arrived with
    #[derive(Default)]
    struct Endpoint {
        authorizations: Mutex<Vec<Option<String>>>,
    }

    impl Endpoint {
        fn authorizations(&self) -> Vec<Option<String>> {
            self.authorizations.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Middleware for Endpoint {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            let authorization = req.headers().get(header::AUTHORIZATION).map(|value| {
                value
                    .to_str()
                    .expect("authorization header was not valid UTF-8")
                    .to_owned()
            });
            self.authorizations.lock().unwrap().push(authorization);

            Ok(http::Response::<&[u8]>::default().into())
        }
    }

    fn client<P>(middleware: AccessTokenMiddleware<P>, endpoint: &Arc<Endpoint>) -> ClientWithMiddleware
    where
        P: Predicate<Request> + Send + Sync + 'static,
    {
        let endpoint: Arc<dyn reqwest_middleware::Middleware> = Arc::<Endpoint>::clone(endpoint);
        ClientBuilder::new(Client::default())
            .with(middleware)
            .with_arc(endpoint)
            .build()
    }

    fn const_middleware(shutdown: &CancellationToken) -> AccessTokenMiddleware<HttpsOnly> {
        let tokens =
            supplier::spawn_refreshing(ConstTokenSource::new(TEST_TOKEN), TTL, shutdown.clone());

        AccessTokenMiddleware::new(tokens)
    }

    fn bearer() -> Option<String> {
        Some(BEARER_TEST_TOKEN.to_owned())
    }

    mod when_request_does_not_have_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn https_requests_get_the_current_token_by_default() {
            let shutdown = CancellationToken::new();
            let endpoint = Arc::new(Endpoint::default());
            let client = client(const_middleware(&shutdown), &endpoint);

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert_eq!(endpoint.authorizations(), [bearer()]);
            shutdown.cancel();
        }

        #[tokio::test]
        async fn plain_http_requests_are_left_alone_by_default() {
            let shutdown = CancellationToken::new();
            let endpoint = Arc::new(Endpoint::default());
            let client = client(const_middleware(&shutdown), &endpoint);

            client.get("http://example.com").send().await.unwrap();

            assert_eq!(endpoint.authorizations(), [None]);
            shutdown.cancel();
        }

        #[tokio::test]
        async fn every_request_is_authorized_separately() {
            let shutdown = CancellationToken::new();
            let endpoint = Arc::new(Endpoint::default());
            let client = client(const_middleware(&shutdown), &endpoint);

            for _ in 0..3 {
                client.get("https://example.com").send().await.unwrap();
            }

            assert_eq!(endpoint.authorizations(), [bearer(), bearer(), bearer()]);
            shutdown.cancel();
        }

        mod and_a_custom_predicate_is_set {
            use super::*;

            #[tokio::test]
            async fn only_accepted_requests_get_a_token() {
                let shutdown = CancellationToken::new();
                let endpoint = Arc::new(Endpoint::default());
                let middleware = const_middleware(&shutdown)
                    .with_predicate(ExactHostMatch::new("api.example.com"));
                let client = client(middleware, &endpoint);

                client.get("http://api.example.com/a").send().await.unwrap();
                client.get("https://other.example.com/b").send().await.unwrap();

                assert_eq!(endpoint.authorizations(), [bearer(), None]);
                shutdown.cancel();
            }

            #[tokio::test]
            async fn a_rejecting_predicate_never_attaches_a_token() {
                let shutdown = CancellationToken::new();
                let endpoint = Arc::new(Endpoint::default());
                let middleware = const_middleware(&shutdown).with_predicate(predicate::never());
                let client = client(middleware, &endpoint);

                client.get("https://example.com").send().await.unwrap();

                assert_eq!(endpoint.authorizations(), [None]);
                shutdown.cancel();
            }
        }

        mod and_no_token_can_be_obtained {
            use super::*;

            #[tokio::test]
            async fn request_fails_without_being_sent() {
                let shutdown = CancellationToken::new();
                let source = FnTokenSource::new(|_: CancellationToken| async {
                    Err::<AccessToken, _>(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "authority unavailable",
                    ))
                });
                let tokens = supplier::spawn_refreshing(source, TTL, shutdown.clone());
                let endpoint = Arc::new(Endpoint::default());
                let client = client(AccessTokenMiddleware::new(tokens), &endpoint);

                let err = client
                    .get("https://example.com")
                    .send()
                    .await
                    .unwrap_err();

                match err {
                    reqwest_middleware::Error::Middleware(err) => {
                        let err = err
                            .downcast_ref::<AuthorizationError>()
                            .expect("an authorization error");
                        assert!(matches!(
                            err,
                            AuthorizationError::Token(TokenError::AllAttemptsFailed { .. })
                        ));
                    }
                    other => panic!("expected a middleware error, got {:?}", other),
                }
                assert!(endpoint.authorizations().is_empty());
                shutdown.cancel();
            }

            #[tokio::test]
            async fn cancellation_stops_waiting_for_the_first_token() {
                let shutdown = CancellationToken::new();
                let source = FnTokenSource::new(|cancel: CancellationToken| async move {
                    cancel.cancelled().await;
                    Err::<AccessToken, _>(std::io::Error::new(
                        std::io::ErrorKind::Interrupted,
                        "cancelled",
                    ))
                });
                let tokens = supplier::spawn_refreshing(source, TTL, shutdown.clone());

                let requests = CancellationToken::new();
                requests.cancel();
                let endpoint = Arc::new(Endpoint::default());
                let client = client(
                    AccessTokenMiddleware::new(tokens).with_cancellation(requests),
                    &endpoint,
                );

                let err = client
                    .get("https://example.com")
                    .send()
                    .await
                    .unwrap_err();

                assert!(matches!(err, reqwest_middleware::Error::Middleware(_)));
                assert!(endpoint.authorizations().is_empty());
                shutdown.cancel();
            }
        }
    }

    mod when_request_already_contains_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn the_existing_header_is_kept() {
            let shutdown = CancellationToken::new();
            let endpoint = Arc::new(Endpoint::default());
            let client = client(const_middleware(&shutdown), &endpoint);

            client
                .get("https://example.com")
                .bearer_auth("overridden!")
                .send()
                .await
                .unwrap();

            // Reqwest uses a capital `B` bearer
            assert_eq!(
                endpoint.authorizations(),
                [Some("Bearer overridden!".to_owned())]
            );
            shutdown.cancel();
        }
    }

    mod bearer_header {
        use super::*;

        #[test]
        fn is_marked_sensitive() {
            let value = bearer_header(&AccessToken::from_static(TEST_TOKEN)).unwrap();
            assert!(value.is_sensitive());
            assert_eq!(value.to_str().unwrap(), BEARER_TEST_TOKEN);
        }

        #[test]
        fn rejects_tokens_that_are_not_valid_header_values() {
            let err = bearer_header(&AccessToken::from_static("bad\ntoken")).unwrap_err();
            assert!(matches!(err, AuthorizationError::InvalidHeader(_)));
        }
    }

    mod predicates {
        use super::*;

        fn get(url: &str) -> Request {
            Request::new(reqwest::Method::GET, url.parse().unwrap())
        }

        #[test]
        fn https_only_accepts_https() {
            assert!(HttpsOnly.eval(&get("https://example.com")));
            assert!(!HttpsOnly.eval(&get("http://example.com")));
        }

        #[test]
        fn https_only_explains_a_rejection() {
            let request = get("http://example.com");
            assert!(HttpsOnly.find_case(false, &request).is_none());

            let case = HttpsOnly.find_case(true, &request).unwrap();
            assert!(!case.result());
            let products: Vec<_> = case.products().map(|p| p.to_string()).collect();
            assert_eq!(products, ["scheme: http"]);
        }

        #[test]
        fn exact_host_match_ignores_case_but_not_subdomains() {
            let predicate = ExactHostMatch::new("Example.COM");

            assert!(predicate.eval(&get("https://example.com/path")));
            assert!(!predicate.eval(&get("https://api.example.com")));
            assert!(!predicate.eval(&get("https://example.com.evil.net")));
        }

        #[test]
        fn exact_host_match_explains_a_rejection() {
            let predicate = ExactHostMatch::new("example.com");
            let request = get("https://does-not-match.com");
            assert!(predicate.find_case(false, &request).is_none());

            let case = predicate.find_case(true, &request).unwrap();
            let products: Vec<_> = case.products().map(|p| p.to_string()).collect();
            assert_eq!(products, ["host: does-not-match.com"]);
            assert_eq!(predicate.to_string(), "request host is example.com");
        }
    }
}
