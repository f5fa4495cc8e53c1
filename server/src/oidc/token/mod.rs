use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{header::ACCEPT, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{
    claims::lenient_seconds,
    config::{ClientConfig, TokenEndpointAuthMethod},
    discovery::ProviderMetadata,
    error::{request_error, OidcError, Result},
};

/// Raw token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub id_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Seconds until the access token expires
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Tokens held by an active session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    /// Compact signed identity token
    pub id_token: String,
    /// When the access token expires
    pub expires_at: DateTime<Utc>,
}

impl TokenSet {
    /// Lifetime assumed when the provider leaves out `expires_in`
    pub const DEFAULT_EXPIRES_IN: i64 = 3600;
    /// Upper bound on a provider-supplied lifetime (one year)
    pub const MAX_EXPIRES_IN: i64 = 365 * 24 * 3600;

    pub fn from_token_response(response: TokenResponse, issued_at: DateTime<Utc>) -> Self {
        let expires_in = response
            .expires_in
            .unwrap_or(Self::DEFAULT_EXPIRES_IN)
            .clamp(0, Self::MAX_EXPIRES_IN);

        Self {
            access_token: response.access_token,
            id_token: response.id_token,
            expires_at: issued_at + chrono::Duration::seconds(expires_in),
        }
    }

    /// Whole seconds left at `now`; negative once expired
    pub fn remaining_seconds_at(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    grant_type: &'static str,
    code: &'a str,
    redirect_uri: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_secret: Option<&'a str>,
}

/// Redeems authorization codes at the provider's token endpoint
#[derive(Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl TokenClient {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    /// Exchange an authorization code for tokens.
    ///
    /// `config.redirect_uri` must be the exact value used for the authorization
    /// request; providers reject the code otherwise.
    #[tracing::instrument(skip_all, fields(token_endpoint = %metadata.token_endpoint), err)]
    pub async fn exchange_code(
        &self,
        metadata: &ProviderMetadata,
        config: &ClientConfig,
        code: &str,
    ) -> Result<TokenSet> {
        let post_credentials =
            config.token_endpoint_auth_method == TokenEndpointAuthMethod::ClientSecretPost;

        let request = TokenRequest {
            grant_type: "authorization_code",
            code,
            redirect_uri: &config.redirect_uri,
            client_id: post_credentials.then_some(config.client_id.as_str()),
            client_secret: post_credentials.then_some(config.client_secret.as_str()),
        };

        debug!(
            redirect_uri = %config.redirect_uri,
            auth_method = ?config.token_endpoint_auth_method,
            "Exchanging authorization code"
        );

        let mut builder = self
            .http
            .post(&metadata.token_endpoint)
            .header(ACCEPT, "application/json")
            .timeout(self.timeout)
            .form(&request);

        if !post_credentials {
            // RFC 6749 section 2.3.1: form-encode both halves before Basic encoding
            builder = builder.basic_auth(
                urlencoding::encode(&config.client_id),
                Some(urlencoding::encode(&config.client_secret)),
            );
        }

        let issued_at = Utc::now();
        let response = builder
            .send()
            .await
            .map_err(|e| request_error(e, "token", self.timeout, OidcError::TokenExchange))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| request_error(e, "token", self.timeout, OidcError::TokenExchange))?;

        if !status.is_success() {
            error!(%status, "Token endpoint rejected the authorization code");
            return Err(OidcError::TokenExchange(describe_error(status, &body)));
        }

        let token_response: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            OidcError::TokenExchange(format!("token endpoint returned a malformed body: {e}"))
        })?;

        let token_set = TokenSet::from_token_response(token_response, issued_at);
        info!(expires_at = %token_set.expires_at, "Authorization code redeemed");

        Ok(token_set)
    }
}

fn describe_error(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(TokenErrorResponse {
            error,
            error_description: Some(description),
        }) => format!("HTTP {status}: {error}: {description}"),
        Ok(TokenErrorResponse { error, .. }) => format!("HTTP {status}: {error}"),
        Err(_) => format!("HTTP {status}: {body}"),
    }
}
