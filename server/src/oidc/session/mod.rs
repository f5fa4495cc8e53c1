//! Per-browser login state and the service that moves it through the
//! authorization code flow.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    authorize::build_authorization_url,
    claims::{extract_claims, Claims},
    config::{ClientConfig, IdTokenValidation},
    discovery::DiscoveryCache,
    error::{OidcError, Result},
    token::{TokenClient, TokenSet},
    verify::IdTokenVerifier,
};

/// Login state of one browser session.
///
/// `Active` always carries claims decoded from its identity token; anything that
/// fails to decode drops the session back to `Unauthenticated`.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Session {
    #[default]
    Unauthenticated,
    /// Redirected to the provider, waiting for the callback
    PendingLogin { nonce: String },
    Active { tokens: TokenSet, claims: Claims },
}

/// Result of [`Session::check_expiry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryStatus {
    Valid { remaining_seconds: i64 },
    /// The tokens ran out and the session was cleared
    Expired,
    NotAuthenticated,
}

/// What gets persisted for a session between requests.
///
/// Claims are never stored; they are decoded again from `id_token` on restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expiry: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an active session, decoding claims from the identity token
    pub fn active(tokens: TokenSet) -> Result<Self> {
        let claims = extract_claims(&tokens.id_token)?;
        Ok(Self::Active { tokens, claims })
    }

    /// Record a new login attempt. Any earlier unconsumed nonce, or an active
    /// login, is replaced.
    pub fn begin_login(&mut self, nonce: String) {
        *self = Self::PendingLogin { nonce };
    }

    /// Forget everything. Safe to call in any state.
    pub fn logout(&mut self) {
        *self = Self::Unauthenticated;
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn claims(&self) -> Option<&Claims> {
        match self {
            Self::Active { claims, .. } => Some(claims),
            _ => None,
        }
    }

    pub fn tokens(&self) -> Option<&TokenSet> {
        match self {
            Self::Active { tokens, .. } => Some(tokens),
            _ => None,
        }
    }

    /// Nonce of the login attempt in flight, for callers that check the
    /// identity token's `nonce` claim themselves
    pub fn pending_nonce(&self) -> Option<&str> {
        match self {
            Self::PendingLogin { nonce } => Some(nonce),
            _ => None,
        }
    }

    pub fn remaining_seconds(&self) -> Option<i64> {
        self.remaining_seconds_at(Utc::now())
    }

    /// Seconds until the tokens expire, never below zero
    pub fn remaining_seconds_at(&self, now: DateTime<Utc>) -> Option<i64> {
        self.tokens()
            .map(|tokens| tokens.remaining_seconds_at(now).max(0))
    }

    pub fn check_expiry(&mut self) -> ExpiryStatus {
        self.check_expiry_at(Utc::now())
    }

    pub fn check_expiry_at(&mut self, now: DateTime<Utc>) -> ExpiryStatus {
        let Some(tokens) = self.tokens() else {
            return ExpiryStatus::NotAuthenticated;
        };

        if tokens.is_expired_at(now) {
            info!(expired_at = %tokens.expires_at, "Session tokens expired, logging out");
            self.logout();
            return ExpiryStatus::Expired;
        }

        ExpiryStatus::Valid {
            remaining_seconds: tokens.remaining_seconds_at(now),
        }
    }

    /// Decode the claims again from the stored identity token.
    ///
    /// Returns `Ok(None)` when there is no active login. A decode failure logs
    /// the session out before the error is returned.
    pub fn refresh_claims(&mut self) -> Result<Option<&Claims>> {
        let decoded = match self {
            Self::Active { tokens, .. } => extract_claims(&tokens.id_token),
            _ => return Ok(None),
        };

        match decoded {
            Ok(fresh) => {
                if let Self::Active { claims, .. } = self {
                    *claims = fresh;
                }
                Ok(self.claims())
            }
            Err(err) => {
                warn!(error = %err, "Stored identity token no longer decodes, logging out");
                self.logout();
                Err(err)
            }
        }
    }

    pub fn to_record(&self) -> SessionRecord {
        match self {
            Self::Unauthenticated => SessionRecord::default(),
            Self::PendingLogin { nonce } => SessionRecord {
                nonce: Some(nonce.clone()),
                ..Default::default()
            },
            Self::Active { tokens, .. } => SessionRecord {
                nonce: None,
                access_token: Some(tokens.access_token.clone()),
                id_token: Some(tokens.id_token.clone()),
                token_expiry: Some(tokens.expires_at),
            },
        }
    }

    /// Rebuild a session from its stored form. Incomplete token fields or an
    /// identity token that no longer decodes yield `Unauthenticated`.
    pub fn from_record(record: SessionRecord) -> Self {
        match record {
            SessionRecord {
                access_token: Some(access_token),
                id_token: Some(id_token),
                token_expiry: Some(expires_at),
                ..
            } => {
                let tokens = TokenSet {
                    access_token,
                    id_token,
                    expires_at,
                };
                Self::active(tokens).unwrap_or_else(|err| {
                    warn!(error = %err, "Discarding stored session with undecodable identity token");
                    Self::Unauthenticated
                })
            }
            SessionRecord {
                nonce: Some(nonce), ..
            } => Self::PendingLogin { nonce },
            _ => Self::Unauthenticated,
        }
    }
}

/// Drives sessions through discovery, authorization, code exchange and claim
/// extraction. One instance is shared by every request.
pub struct SessionManager {
    config: ClientConfig,
    discovery: Arc<DiscoveryCache>,
    tokens: TokenClient,
    verifier: Option<IdTokenVerifier>,
}

impl SessionManager {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| OidcError::Config(format!("could not build HTTP client: {e}")))?;
        let discovery = Arc::new(DiscoveryCache::new(
            config.discovery_url()?,
            http.clone(),
            config.http_timeout,
        ));

        Ok(Self::with_discovery(config, discovery, http))
    }

    /// Use an existing discovery cache, e.g. one shared with other clients of
    /// the same provider
    pub fn with_discovery(
        config: ClientConfig,
        discovery: Arc<DiscoveryCache>,
        http: reqwest::Client,
    ) -> Self {
        let verifier = match config.id_token_validation {
            IdTokenValidation::Verified => {
                Some(IdTokenVerifier::new(http.clone(), config.http_timeout))
            }
            IdTokenValidation::Unverified => None,
        };

        Self {
            tokens: TokenClient::new(http, config.http_timeout),
            config,
            discovery,
            verifier,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start a login: store a fresh nonce in the session and return the URL to
    /// redirect the browser to
    #[tracing::instrument(skip_all, err)]
    pub async fn start_login(&self, session: &mut Session) -> Result<Url> {
        let metadata = self.discovery.get().await?;
        let request = build_authorization_url(&metadata, &self.config)?;

        if session.pending_nonce().is_some() {
            debug!("Replacing an unfinished login attempt");
        }
        session.begin_login(request.nonce);

        info!(authorization_endpoint = %metadata.authorization_endpoint, "Login started");
        Ok(request.url)
    }

    /// Complete a login with the `code` the provider sent to the redirect URI.
    ///
    /// On any failure the session is cleared and the error returned. Unless
    /// identity token verification is configured, the token's `nonce` claim is
    /// not compared with the pending nonce.
    #[tracing::instrument(skip_all, err)]
    pub async fn receive_callback(&self, session: &mut Session, code: &str) -> Result<()> {
        let pending_nonce = session.pending_nonce().map(str::to_owned);

        match self.redeem(code, pending_nonce.as_deref()).await {
            Ok((tokens, claims)) => {
                info!(sub = ?claims.sub, expires_at = %tokens.expires_at, "Login completed");
                *session = Session::Active { tokens, claims };
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Login callback failed, clearing session");
                session.logout();
                Err(err)
            }
        }
    }

    async fn redeem(&self, code: &str, pending_nonce: Option<&str>) -> Result<(TokenSet, Claims)> {
        let metadata = self.discovery.get().await?;
        let tokens = self
            .tokens
            .exchange_code(&metadata, &self.config, code)
            .await?;

        let claims = match &self.verifier {
            Some(verifier) => {
                verifier
                    .verify(&tokens.id_token, &metadata, &self.config, pending_nonce)
                    .await?
            }
            None => extract_claims(&tokens.id_token)?,
        };

        Ok((tokens, claims))
    }

    /// The provider's RP-initiated logout URL for this session, when the
    /// provider advertises an `end_session_endpoint`.
    ///
    /// This does not touch the session; call [`Session::logout`] as well.
    pub async fn end_session_url(&self, session: &Session) -> Result<Option<Url>> {
        let Some(tokens) = session.tokens() else {
            return Ok(None);
        };

        let metadata = self.discovery.get().await?;
        let Some(endpoint) = metadata.end_session_endpoint.as_deref() else {
            return Ok(None);
        };

        let mut url = Url::parse(endpoint).map_err(|e| {
            OidcError::Discovery(format!("end_session_endpoint `{endpoint}` is not a valid URL: {e}"))
        })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("id_token_hint", &tokens.id_token);
            query.append_pair("client_id", &self.config.client_id);
            if let Some(redirect) = &self.config.post_logout_redirect_uri {
                query.append_pair("post_logout_redirect_uri", redirect);
            }
        }

        Ok(Some(url))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::oidc::test_support::unsigned_token;

    fn alice_tokens(expires_at: DateTime<Utc>) -> TokenSet {
        TokenSet {
            access_token: "AT1".to_string(),
            id_token: unsigned_token(&json!({"sub": "u1", "name": "Alice"})),
            expires_at,
        }
    }

    fn active(expires_in: i64) -> Session {
        Session::active(alice_tokens(Utc::now() + Duration::seconds(expires_in))).unwrap()
    }

    #[test]
    fn new_session_is_unauthenticated() {
        let session = Session::new();

        assert!(!session.is_authenticated());
        assert_eq!(session.claims(), None);
        assert_eq!(session.remaining_seconds(), None);
        assert_eq!(session.pending_nonce(), None);
    }

    #[test]
    fn active_session_exposes_claims_and_remaining_time() {
        let session = active(120);

        assert!(session.is_authenticated());
        assert_eq!(
            session.claims().and_then(|c| c.name.as_deref()),
            Some("Alice")
        );
        let remaining = session.remaining_seconds().unwrap();
        assert!((0..=120).contains(&remaining));
    }

    #[test]
    fn second_login_overwrites_the_nonce() {
        let mut session = Session::new();
        session.begin_login("first".to_string());
        session.begin_login("second".to_string());

        assert_eq!(session.pending_nonce(), Some("second"));
    }

    #[test]
    fn logout_clears_every_state() {
        let mut states = vec![
            Session::Unauthenticated,
            Session::PendingLogin {
                nonce: "n".to_string(),
            },
            active(60),
        ];

        for session in &mut states {
            session.logout();
            assert_eq!(*session, Session::Unauthenticated);
            assert_eq!(session.to_record(), SessionRecord::default());

            session.logout();
            assert_eq!(*session, Session::Unauthenticated);
        }
    }

    #[test]
    fn undecodable_token_never_becomes_active() {
        let mut tokens = alice_tokens(Utc::now() + Duration::seconds(60));
        tokens.id_token = "only-one-segment".to_string();

        assert!(matches!(
            Session::active(tokens),
            Err(OidcError::ClaimsDecode(_))
        ));
    }

    #[test]
    fn corrupt_tokens_never_become_an_active_session() {
        let mut corrupt = alice_tokens(Utc::now() + Duration::seconds(600));
        corrupt.id_token = "only-one-segment".to_string();

        assert!(matches!(
            Session::active(corrupt),
            Err(OidcError::ClaimsDecode(msg)) if msg.contains("found 1")
        ));
    }

    #[test]
    fn refresh_claims_logs_out_when_the_token_is_corrupt() {
        let mut session = active(60);
        if let Session::Active { tokens, .. } = &mut session {
            tokens.id_token = "garbage".to_string();
        }

        assert!(matches!(
            session.refresh_claims(),
            Err(OidcError::ClaimsDecode(_))
        ));
        assert_eq!(session, Session::Unauthenticated);
    }

    #[test]
    fn refresh_claims_is_a_no_op_without_login() -> Result<()> {
        let mut session = Session::PendingLogin {
            nonce: "n".to_string(),
        };

        assert_eq!(session.refresh_claims()?, None);
        assert_eq!(session.pending_nonce(), Some("n"));
        Ok(())
    }

    #[test]
    fn check_expiry_keeps_a_live_session() {
        let now = Utc::now();
        let mut session = Session::active(alice_tokens(now + Duration::seconds(90))).unwrap();

        assert_eq!(
            session.check_expiry_at(now),
            ExpiryStatus::Valid {
                remaining_seconds: 90
            }
        );
        assert!(session.is_authenticated());
    }

    #[test]
    fn check_expiry_logs_out_an_expired_session() {
        let now = Utc::now();
        let mut session = Session::active(alice_tokens(now - Duration::seconds(1))).unwrap();

        assert_eq!(session.remaining_seconds_at(now), Some(0));
        assert_eq!(session.check_expiry_at(now), ExpiryStatus::Expired);
        assert_eq!(session, Session::Unauthenticated);
        assert_eq!(session.check_expiry_at(now), ExpiryStatus::NotAuthenticated);
    }

    #[test]
    fn records_restore_the_same_session() {
        let pending = Session::PendingLogin {
            nonce: "n".to_string(),
        };
        let active = active(60);

        for session in [Session::Unauthenticated, pending, active] {
            assert_eq!(Session::from_record(session.to_record()), session);
        }
    }

    #[test]
    fn record_with_corrupt_token_restores_unauthenticated() {
        let record = SessionRecord {
            nonce: None,
            access_token: Some("AT1".to_string()),
            id_token: Some("corrupt".to_string()),
            token_expiry: Some(Utc::now()),
        };

        assert_eq!(Session::from_record(record), Session::Unauthenticated);
    }

    #[test]
    fn partial_token_record_restores_unauthenticated() {
        let record = SessionRecord {
            access_token: Some("AT1".to_string()),
            ..Default::default()
        };

        assert_eq!(Session::from_record(record), Session::Unauthenticated);
    }

    #[test]
    fn manager_rejects_an_invalid_issuer() {
        let config = ClientConfig::new("rp", "secret", "::", "https://rp/callback");

        assert!(matches!(
            SessionManager::new(config),
            Err(OidcError::Config(_))
        ));
    }
}
