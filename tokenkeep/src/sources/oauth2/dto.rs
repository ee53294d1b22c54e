//! DTOs for interacting with OAuth2 token endpoints

use serde::{Deserialize, Serialize};

use crate::{AccessToken, ClientId, ClientIdRef, ClientSecret, ClientSecretRef};

/// Client credentials
#[derive(Clone, Debug, Serialize)]
pub struct ClientCredentials {
    /// The client ID
    pub client_id: ClientId,

    /// The client secret
    pub client_secret: ClientSecret,
}

#[derive(Debug, Serialize)]
pub(super) struct ClientCredentialsRequest<'a> {
    pub grant_type: &'static str,
    pub client_id: &'a ClientIdRef,
    pub client_secret: &'a ClientSecretRef,
}

#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse {
    pub access_token: AccessToken,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// An error body as described by RFC 6749, section 5.2
#[derive(Debug, Deserialize)]
pub(super) struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub error_uri: Option<String>,
}
