//! Identity token verification, used when
//! [`IdTokenValidation::Verified`](super::config::IdTokenValidation) is configured.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use jsonwebtoken::{
    decode, decode_header,
    jwk::{Jwk, JwkSet},
    Algorithm, DecodingKey, Header, Validation,
};
use reqwest::header::ACCEPT;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    claims::Claims,
    config::ClientConfig,
    discovery::ProviderMetadata,
    error::{request_error, OidcError, Result},
};

/// Clock skew tolerated on `exp`, `iat` and `nbf`
const LEEWAY_SECONDS: u64 = 60;

/// A key set fetched less than this long ago is not fetched again
const MIN_REFETCH_INTERVAL: Duration = Duration::from_secs(60);

struct CachedKeys {
    keys: Arc<JwkSet>,
    fetched_at: Instant,
}

/// Checks signature, issuer, audience, expiry and nonce of identity tokens
pub struct IdTokenVerifier {
    http: reqwest::Client,
    timeout: Duration,
    jwks: RwLock<Option<CachedKeys>>,
}

impl IdTokenVerifier {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self {
            http,
            timeout,
            jwks: RwLock::new(None),
        }
    }

    /// Verify `id_token` and return its claims.
    ///
    /// `expected_nonce` is the nonce stored when the login started; a token
    /// without a pending login attempt is rejected.
    #[tracing::instrument(skip_all, err)]
    pub async fn verify(
        &self,
        id_token: &str,
        metadata: &ProviderMetadata,
        config: &ClientConfig,
        expected_nonce: Option<&str>,
    ) -> Result<Claims> {
        let header = decode_header(id_token)
            .map_err(|e| OidcError::Verification(format!("invalid token header: {e}")))?;
        let key = self.decoding_key(&header, metadata, config).await?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = LEEWAY_SECONDS;
        validation.set_audience(&[&config.client_id]);
        validation.set_required_spec_claims(&["exp", "aud"]);
        if let Some(issuer) = &metadata.issuer {
            validation.set_issuer(&[issuer]);
        }

        let claims = decode::<Claims>(id_token, &key, &validation)
            .map_err(|e| OidcError::Verification(e.to_string()))?
            .claims;

        let expected = expected_nonce.ok_or_else(|| {
            OidcError::Verification("no login attempt is pending for this session".to_string())
        })?;

        match claims.nonce.as_deref() {
            Some(nonce) if nonce == expected => {
                debug!(sub = ?claims.sub, "Identity token verified");
                Ok(claims)
            }
            Some(_) => Err(OidcError::Verification(
                "nonce does not match the pending login attempt".to_string(),
            )),
            None => Err(OidcError::Verification(
                "identity token carries no nonce".to_string(),
            )),
        }
    }

    async fn decoding_key(
        &self,
        header: &Header,
        metadata: &ProviderMetadata,
        config: &ClientConfig,
    ) -> Result<DecodingKey> {
        if matches!(
            header.alg,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            // MAC-signed tokens use the client secret as the key (OIDC Core 10.1)
            return Ok(DecodingKey::from_secret(config.client_secret.as_bytes()));
        }

        let jwks_uri = metadata.jwks_uri.as_deref().ok_or_else(|| {
            OidcError::Verification(format!(
                "token is signed with {:?} but the provider advertises no jwks_uri",
                header.alg
            ))
        })?;
        let kid = header.kid.as_deref();

        let jwk = match self.find_key(jwks_uri, kid, false).await? {
            Some(jwk) => jwk,
            None => {
                // The provider may have rotated its keys since the last fetch
                info!(?kid, "Signing key not in cached key set, refetching");
                self.find_key(jwks_uri, kid, true).await?.ok_or_else(|| {
                    OidcError::Verification(format!("no signing key matches kid {kid:?}"))
                })?
            }
        };

        DecodingKey::from_jwk(&jwk)
            .map_err(|e| OidcError::Verification(format!("unusable signing key: {e}")))
    }

    async fn find_key(&self, jwks_uri: &str, kid: Option<&str>, refresh: bool) -> Result<Option<Jwk>> {
        let key_set = self.key_set(jwks_uri, refresh).await?;

        Ok(match kid {
            Some(kid) => key_set.find(kid).cloned(),
            None if key_set.keys.len() == 1 => key_set.keys.first().cloned(),
            None => {
                warn!(
                    keys = key_set.keys.len(),
                    "Token has no kid and the key set is ambiguous"
                );
                None
            }
        })
    }

    async fn key_set(&self, jwks_uri: &str, refresh: bool) -> Result<Arc<JwkSet>> {
        if let Some(cached) = self.jwks.read().await.as_ref() {
            if !refresh {
                return Ok(cached.keys.clone());
            }
            if cached.fetched_at.elapsed() < MIN_REFETCH_INTERVAL {
                debug!(
                    age = ?cached.fetched_at.elapsed(),
                    "Key set was fetched recently, not refetching"
                );
                return Ok(cached.keys.clone());
            }
        }

        let response = self
            .http
            .get(jwks_uri)
            .header(ACCEPT, "application/json")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| request_error(e, "jwks", self.timeout, OidcError::Verification))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OidcError::Verification(format!(
                "jwks endpoint returned HTTP {status}"
            )));
        }

        let key_set: JwkSet = response
            .json()
            .await
            .map_err(|e| request_error(e, "jwks", self.timeout, OidcError::Verification))?;
        let key_set = Arc::new(key_set);

        info!(keys = key_set.keys.len(), "Fetched provider signing keys");
        *self.jwks.write().await = Some(CachedKeys {
            keys: key_set.clone(),
            fetched_at: Instant::now(),
        });

        Ok(key_set)
    }
}
