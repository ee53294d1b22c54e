//! A token source that exchanges client credentials with an OAuth2 authority

use std::{marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::TokenProvider;
use crate::{AccessToken, ClientIdRef, ClientSecretRef};

pub mod dto;

pub use dto::ClientCredentials;

/// The path of the token endpoint, relative to the authority's base URL
pub const DEFAULT_TOKEN_PATH: &str = "oauth2/token";

const CLIENT_CREDENTIALS_GRANT_TYPE: &str = "client_credentials";

/// A client able to perform the OAuth2 _client credentials_ exchange
#[async_trait]
pub trait ClientCredentialsClient: Send + Sync {
    /// Exchanges a client ID and secret for a new access token
    async fn create_client_credential_token(
        &self,
        cancel: &CancellationToken,
        client_id: &ClientIdRef,
        client_secret: &ClientSecretRef,
    ) -> Result<AccessToken, TokenRequestError>;
}

#[async_trait]
impl<T: ClientCredentialsClient + ?Sized> ClientCredentialsClient for Arc<T> {
    async fn create_client_credential_token(
        &self,
        cancel: &CancellationToken,
        client_id: &ClientIdRef,
        client_secret: &ClientSecretRef,
    ) -> Result<AccessToken, TokenRequestError> {
        (**self)
            .create_client_credential_token(cancel, client_id, client_secret)
            .await
    }
}

/// A client credentials client that talks to the authority over [`reqwest`]
///
/// Credentials are sent as form data unless [`using_json()`][Self::using_json] is called.
#[derive(Debug)]
pub struct ReqwestClientCredentialsClient<T = FormBody> {
    client: reqwest::Client,
    token_url: reqwest::Url,
    content_type: PhantomData<fn() -> T>,
}

impl<T> Clone for ReqwestClientCredentialsClient<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            token_url: self.token_url.clone(),
            content_type: PhantomData,
        }
    }
}

impl ReqwestClientCredentialsClient<FormBody> {
    /// Constructs a new client that requests tokens from `token_url`
    pub fn new(client: reqwest::Client, token_url: reqwest::Url) -> Self {
        Self {
            client,
            token_url,
            content_type: PhantomData,
        }
    }

    /// Constructs a new client using the authority's default token endpoint under `base_url`
    pub fn with_base_url(
        client: reqwest::Client,
        base_url: &reqwest::Url,
    ) -> Result<Self, url::ParseError> {
        Self::with_base_url_and_path(client, base_url, DEFAULT_TOKEN_PATH)
    }

    /// Constructs a new client using the token endpoint at `path` under `base_url`
    ///
    /// The path is always appended to the base URL's path, even if it starts with `/`.
    pub fn with_base_url_and_path(
        client: reqwest::Client,
        base_url: &reqwest::Url,
        path: &str,
    ) -> Result<Self, url::ParseError> {
        let mut base = base_url.clone();
        if !base.path().ends_with('/') {
            let dir = format!("{}/", base.path());
            base.set_path(&dir);
        }

        let token_url = base.join(path.trim_start_matches('/'))?;
        Ok(Self::new(client, token_url))
    }

    /// Configures the client to send credentials to the authority as JSON
    pub fn using_json(self) -> ReqwestClientCredentialsClient<JsonBody> {
        ReqwestClientCredentialsClient {
            client: self.client,
            token_url: self.token_url,
            content_type: PhantomData,
        }
    }
}

impl<T> ReqwestClientCredentialsClient<T> {
    /// The URL tokens are requested from
    pub fn token_url(&self) -> &reqwest::Url {
        &self.token_url
    }
}

#[async_trait]
impl<T: RequestType> ClientCredentialsClient for ReqwestClientCredentialsClient<T> {
    async fn create_client_credential_token(
        &self,
        cancel: &CancellationToken,
        client_id: &ClientIdRef,
        client_secret: &ClientSecretRef,
    ) -> Result<AccessToken, TokenRequestError> {
        request_token::<T>(
            &self.client,
            self.token_url.clone(),
            cancel,
            client_id,
            client_secret,
        )
        .await
    }
}

/// A token source for the client credentials flow
///
/// Binds a credential pair to a [`ClientCredentialsClient`] so that it can be
/// used anywhere a [`TokenProvider`] is expected.
#[derive(Clone, Debug)]
pub struct ClientCredentialsTokenSource<C> {
    client: C,
    credentials: ClientCredentials,
}

impl<C> ClientCredentialsTokenSource<C> {
    /// Constructs a new client credentials source
    pub fn new(client: C, credentials: ClientCredentials) -> Self {
        Self {
            client,
            credentials,
        }
    }
}

#[async_trait]
impl<C: ClientCredentialsClient> TokenProvider for ClientCredentialsTokenSource<C> {
    type Error = TokenRequestError;

    async fn provide_token(&self, cancel: &CancellationToken) -> Result<AccessToken, Self::Error> {
        self.client
            .create_client_credential_token(
                cancel,
                &self.credentials.client_id,
                &self.credentials.client_secret,
            )
            .await
    }
}

/// An error while attempting to request a new token from the authority
#[derive(Debug, Error)]
pub enum TokenRequestError {
    /// The authority rejected the request with an RFC 6749 error body
    #[error("authority rejected token request ({status}): {error}")]
    Rejected {
        /// The HTTP status returned
        status: StatusCode,
        /// The OAuth2 error code
        error: String,
        /// A human-readable explanation, if given
        description: Option<String>,
        /// A link to more information about the error, if given
        uri: Option<String>,
    },
    /// The authority returned an error status without a body
    #[error("authority returned {status}")]
    ErrorStatus {
        /// The HTTP status returned
        status: StatusCode,
    },
    /// The authority returned an error status with a body that could not be understood
    #[error("server returned an error and failed to unmarshal body ({status})")]
    UndecodableErrorBody {
        /// The HTTP status returned
        status: StatusCode,
        /// The raw body returned
        body: String,
    },
    /// The authority returned an error status, but its body could not be read
    #[error("server returned an error and failed to read body ({status})")]
    ErrorBodyRead {
        /// The HTTP status returned
        status: StatusCode,
        /// The underlying read error
        source: reqwest::Error,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing token body from authority")]
    TokenBodyError(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(#[source] reqwest::Error),
    /// Unable to send a token request to the authority
    #[error("error sending request to authority")]
    RequestSend(#[source] reqwest::Error),
    /// The caller cancelled before the authority answered
    #[error("token request cancelled")]
    Cancelled,
}

impl TokenRequestError {
    /// The HTTP status returned by the authority, if it answered with an error status
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Rejected { status, .. }
            | Self::ErrorStatus { status }
            | Self::UndecodableErrorBody { status, .. }
            | Self::ErrorBodyRead { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn maybe_value<'a, T: tracing::Value + 'a>(v: &'a Option<T>) -> &'a dyn tracing::Value {
    if let Some(v) = v {
        v
    } else {
        &tracing::field::Empty
    }
}

#[tracing::instrument(
    err,
    skip_all,
    fields(
        token_url = %token_url,
        credentials.grant_type = CLIENT_CREDENTIALS_GRANT_TYPE,
        credentials.client_id = %client_id,
    ),
)]
async fn request_token<T: RequestType>(
    client: &reqwest::Client,
    token_url: reqwest::Url,
    cancel: &CancellationToken,
    client_id: &ClientIdRef,
    client_secret: &ClientSecretRef,
) -> Result<AccessToken, TokenRequestError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TokenRequestError::Cancelled),
        result = exchange::<T>(client, token_url, client_id, client_secret) => result,
    }
}

async fn exchange<T: RequestType>(
    client: &reqwest::Client,
    token_url: reqwest::Url,
    client_id: &ClientIdRef,
    client_secret: &ClientSecretRef,
) -> Result<AccessToken, TokenRequestError> {
    tracing::trace!("requesting token from authority");

    let payload = dto::ClientCredentialsRequest {
        grant_type: CLIENT_CREDENTIALS_GRANT_TYPE,
        client_id,
        client_secret,
    };

    let req = T::attach_payload(
        client
            .post(token_url)
            .header(header::ACCEPT, "application/json"),
        &payload,
    );
    let resp = req.send().await.map_err(TokenRequestError::RequestSend)?;

    let status = resp.status();
    tracing::debug!(
        response.status = status.as_u16(),
        "received token response from issuing authority"
    );

    if status.is_client_error() || status.is_server_error() {
        return Err(decode_error(status, resp).await);
    }

    let body = resp
        .bytes()
        .await
        .map_err(TokenRequestError::BodyReadError)?;
    let resp: dto::TokenResponse = serde_json::from_slice(&body)?;

    tracing::info!(
        token_type = maybe_value(&resp.token_type.as_deref()),
        expires_in = maybe_value(&resp.expires_in),
        "received new access token"
    );

    Ok(resp.access_token)
}

async fn decode_error(status: StatusCode, resp: reqwest::Response) -> TokenRequestError {
    let body = match resp.bytes().await {
        Ok(body) => body,
        Err(source) => return TokenRequestError::ErrorBodyRead { status, source },
    };

    if body.is_empty() {
        return TokenRequestError::ErrorStatus { status };
    }

    match serde_json::from_slice::<dto::ErrorResponse>(&body) {
        Ok(error) if !error.error.is_empty() => TokenRequestError::Rejected {
            status,
            error: error.error,
            description: error.error_description,
            uri: error.error_uri,
        },
        _ => TokenRequestError::UndecodableErrorBody {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        },
    }
}

/// A manner of attaching a serializable payload to a request
pub trait RequestType: Send + Sync + 'static {
    /// Attaches the serializable payload to the request body
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder;
}

/// Attaches credentials to the request body as JSON
#[derive(Debug)]
pub struct JsonBody;

/// Attaches credentials to the request body as URL-encoded form data
#[derive(Debug)]
pub struct FormBody;

impl RequestType for JsonBody {
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        request.json(payload)
    }
}

impl RequestType for FormBody {
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        request.form(payload)
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;
    use tracing_test::traced_test;

    use super::*;
    use crate::{ClientId, ClientSecret};

    fn credentials() -> ClientCredentials {
        ClientCredentials {
            client_id: ClientId::from_static("my-client"),
            client_secret: ClientSecret::from_static("my-secret"),
        }
    }

    fn form_client(server: &mockito::ServerGuard) -> ReqwestClientCredentialsClient {
        let base = server.url().parse().unwrap();
        ReqwestClientCredentialsClient::with_base_url(reqwest::Client::new(), &base).unwrap()
    }

    async fn exchange(
        client: &impl ClientCredentialsClient,
    ) -> Result<AccessToken, TokenRequestError> {
        let credentials = credentials();
        client
            .create_client_credential_token(
                &CancellationToken::new(),
                &credentials.client_id,
                &credentials.client_secret,
            )
            .await
    }

    mod token_urls {
        use super::*;

        fn token_url(base: &str) -> String {
            let base = base.parse().unwrap();
            ReqwestClientCredentialsClient::with_base_url(reqwest::Client::new(), &base)
                .unwrap()
                .token_url()
                .to_string()
        }

        #[test]
        fn default_path_is_appended_to_a_bare_host() {
            assert_eq!(
                token_url("https://auth.example.com"),
                "https://auth.example.com/oauth2/token"
            );
        }

        #[test]
        fn default_path_is_appended_to_a_base_path() {
            assert_eq!(
                token_url("https://auth.example.com/tenant"),
                "https://auth.example.com/tenant/oauth2/token"
            );
            assert_eq!(
                token_url("https://auth.example.com/tenant/"),
                "https://auth.example.com/tenant/oauth2/token"
            );
        }

        #[test]
        fn custom_paths_stay_under_the_base() {
            let base = "https://auth.example.com/tenant".parse().unwrap();
            let client = ReqwestClientCredentialsClient::with_base_url_and_path(
                reqwest::Client::new(),
                &base,
                "/connect/token",
            )
            .unwrap();
            assert_eq!(
                client.token_url().as_str(),
                "https://auth.example.com/tenant/connect/token"
            );
        }
    }

    mod when_the_authority_issues_a_token {
        use super::*;

        #[tokio::test]
        #[traced_test]
        async fn credentials_are_posted_as_form_data() {
            let mut server = mockito::Server::new_async().await;
            let mock = server
                .mock("POST", "/oauth2/token")
                .match_header("content-type", "application/x-www-form-urlencoded")
                .match_header("accept", "application/json")
                .match_body(Matcher::AllOf(vec![
                    Matcher::UrlEncoded("grant_type".into(), "client_credentials".into()),
                    Matcher::UrlEncoded("client_id".into(), "my-client".into()),
                    Matcher::UrlEncoded("client_secret".into(), "my-secret".into()),
                ]))
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(
                    serde_json::json!({
                        "access_token": "my-issued-token",
                        "token_type": "bearer",
                        "expires_in": 3600
                    })
                    .to_string(),
                )
                .create_async()
                .await;

            let token = exchange(&form_client(&server)).await.unwrap();

            mock.assert_async().await;
            assert_eq!(token.as_str(), "my-issued-token");
            assert!(logs_contain("received new access token"));
            assert!(!logs_contain("my-secret"));
        }

        #[tokio::test]
        async fn credentials_can_be_posted_as_json() {
            let mut server = mockito::Server::new_async().await;
            let mock = server
                .mock("POST", "/oauth2/token")
                .match_header("content-type", "application/json")
                .match_body(Matcher::Json(serde_json::json!({
                    "grant_type": "client_credentials",
                    "client_id": "my-client",
                    "client_secret": "my-secret"
                })))
                .with_status(200)
                .with_body(r#"{"access_token":"json-token"}"#)
                .create_async()
                .await;

            let token = exchange(&form_client(&server).using_json()).await.unwrap();

            mock.assert_async().await;
            assert_eq!(token.as_str(), "json-token");
        }

        #[tokio::test]
        async fn an_unreadable_token_body_is_an_error() {
            let mut server = mockito::Server::new_async().await;
            server
                .mock("POST", "/oauth2/token")
                .with_status(200)
                .with_body("not json")
                .create_async()
                .await;

            let err = exchange(&form_client(&server)).await.unwrap_err();

            assert!(matches!(err, TokenRequestError::TokenBodyError(_)));
        }
    }

    mod when_the_authority_returns_an_error {
        use super::*;

        async fn error_response(status: usize, body: &str) -> TokenRequestError {
            let mut server = mockito::Server::new_async().await;
            server
                .mock("POST", "/oauth2/token")
                .with_status(status)
                .with_body(body)
                .create_async()
                .await;

            exchange(&form_client(&server)).await.unwrap_err()
        }

        #[tokio::test]
        async fn an_oauth2_error_body_is_decoded() {
            let err = error_response(
                401,
                r#"{"error":"invalid_client","error_description":"unknown client","error_uri":"https://auth.example.com/errors"}"#,
            )
            .await;

            match err {
                TokenRequestError::Rejected {
                    status,
                    error,
                    description,
                    uri,
                } => {
                    assert_eq!(status, StatusCode::UNAUTHORIZED);
                    assert_eq!(error, "invalid_client");
                    assert_eq!(description.as_deref(), Some("unknown client"));
                    assert_eq!(uri.as_deref(), Some("https://auth.example.com/errors"));
                }
                other => panic!("expected a rejection, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn an_empty_body_reports_the_status() {
            let err = error_response(503, "").await;

            assert!(matches!(
                err,
                TokenRequestError::ErrorStatus {
                    status: StatusCode::SERVICE_UNAVAILABLE
                }
            ));
            assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        }

        #[tokio::test]
        async fn an_undecodable_body_is_kept() {
            let err = error_response(500, "<html>oops</html>").await;

            match err {
                TokenRequestError::UndecodableErrorBody { status, body } => {
                    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                    assert_eq!(body, "<html>oops</html>");
                }
                other => panic!("expected an undecodable body, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn a_body_without_an_error_code_is_undecodable() {
            let err = error_response(400, r#"{"error_description":"no code"}"#).await;

            assert!(matches!(err, TokenRequestError::UndecodableErrorBody { .. }));
        }
    }

    mod when_the_caller_cancels {
        use super::*;

        #[tokio::test]
        async fn no_request_is_sent() {
            let mut server = mockito::Server::new_async().await;
            let mock = server
                .mock("POST", "/oauth2/token")
                .expect(0)
                .create_async()
                .await;

            let cancel = CancellationToken::new();
            cancel.cancel();

            let credentials = credentials();
            let err = form_client(&server)
                .create_client_credential_token(
                    &cancel,
                    &credentials.client_id,
                    &credentials.client_secret,
                )
                .await
                .unwrap_err();

            assert!(matches!(err, TokenRequestError::Cancelled));
            mock.assert_async().await;
        }
    }

    mod token_source {
        use super::*;

        /// Issues a token naming the client it was asked for
        #[derive(Debug)]
        struct EchoClient;

        #[async_trait]
        impl ClientCredentialsClient for EchoClient {
            async fn create_client_credential_token(
                &self,
                _: &CancellationToken,
                client_id: &ClientIdRef,
                client_secret: &ClientSecretRef,
            ) -> Result<AccessToken, TokenRequestError> {
                assert_eq!(client_secret.as_str(), "my-secret");
                Ok(AccessToken::from(format!("token-for-{}", client_id)))
            }
        }

        #[tokio::test]
        async fn the_bound_credentials_are_exchanged() {
            let source = ClientCredentialsTokenSource::new(EchoClient, credentials());

            let token = source
                .provide_token(&CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(token.as_str(), "token-for-my-client");
        }
    }
}
