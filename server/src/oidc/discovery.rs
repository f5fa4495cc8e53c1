//! Provider metadata discovery.
//!
//! The discovery document is fetched once per process and shared by every
//! session. Provider endpoints are effectively static, so the cached value never
//! expires on its own; [`DiscoveryCache::invalidate`] forces a refetch.

use std::{sync::Arc, time::Duration};

use reqwest::{header::ACCEPT, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, RwLock};
use tracing::{error, info};

use super::error::{request_error, OidcError, Result};

/// The subset of an OpenID Provider's discovery document this client cares about.
/// Everything else the provider advertises is kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_session_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub response_types_supported: Vec<String>,
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProviderMetadata {
    /// Parses a discovery document, rejecting endpoints that are not absolute URLs
    pub fn from_json(body: &str) -> Result<Self> {
        let metadata: Self = serde_json::from_str(body)
            .map_err(|e| OidcError::Discovery(format!("discovery document is not valid: {e}")))?;

        for (field, value) in [
            ("authorization_endpoint", &metadata.authorization_endpoint),
            ("token_endpoint", &metadata.token_endpoint),
        ] {
            Url::parse(value).map_err(|e| {
                OidcError::Discovery(format!("{field} `{value}` is not an absolute URL: {e}"))
            })?;
        }

        Ok(metadata)
    }
}

/// Process-wide, lazily populated cache of the provider's discovery document
pub struct DiscoveryCache {
    url: Url,
    http: reqwest::Client,
    timeout: Duration,
    // The lock only guards swapping in a fresh cell on invalidation; the cell
    // itself guarantees a single in-flight fetch.
    cell: RwLock<Arc<OnceCell<Arc<ProviderMetadata>>>>,
}

impl DiscoveryCache {
    pub fn new(url: Url, http: reqwest::Client, timeout: Duration) -> Self {
        Self {
            url,
            http,
            timeout,
            cell: RwLock::new(Arc::new(OnceCell::new())),
        }
    }

    /// Returns the cached metadata, fetching it on first use.
    ///
    /// Concurrent first callers wait on the same fetch. A failed fetch leaves
    /// the cache empty, so the next call tries again.
    pub async fn get(&self) -> Result<Arc<ProviderMetadata>> {
        let cell = self.cell.read().await.clone();
        let metadata = cell.get_or_try_init(|| self.fetch()).await?;

        Ok(metadata.clone())
    }

    /// Drops the cached document; the next [`get`](Self::get) refetches it
    pub async fn invalidate(&self) {
        *self.cell.write().await = Arc::new(OnceCell::new());
        info!(url = %self.url, "Provider metadata cache invalidated");
    }

    #[tracing::instrument(skip(self), fields(url = %self.url), err)]
    async fn fetch(&self) -> Result<Arc<ProviderMetadata>> {
        let response = self
            .http
            .get(self.url.clone())
            .header(ACCEPT, "application/json")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| request_error(e, "discovery", self.timeout, OidcError::Discovery))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| request_error(e, "discovery", self.timeout, OidcError::Discovery))?;

        if !status.is_success() {
            error!(%status, "Discovery endpoint returned an error");
            return Err(OidcError::Discovery(format!("HTTP {status}: {body}")));
        }

        let metadata = ProviderMetadata::from_json(&body)?;

        info!(
            issuer = ?metadata.issuer,
            authorization_endpoint = %metadata.authorization_endpoint,
            token_endpoint = %metadata.token_endpoint,
            "Fetched provider metadata"
        );

        Ok(Arc::new(metadata))
    }
}
