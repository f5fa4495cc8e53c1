use reqwest::Url;
use serde::Serialize;

use super::{
    config::ClientConfig,
    discovery::ProviderMetadata,
    error::{OidcError, Result},
    nonce::generate_nonce,
};

#[derive(Serialize)]
struct AuthUrlParams<'a> {
    client_id: &'a str,
    redirect_uri: &'a str,
    scope: &'a str,
    response_type: &'static str,
    nonce: &'a str,
}

/// Where to send the browser, and the nonce the caller must keep for the callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub url: Url,
    pub nonce: String,
}

/// Build the authorization code request URL with a freshly generated nonce.
///
/// Nothing is stored here; persisting the nonce is up to the caller.
pub fn build_authorization_url(
    metadata: &ProviderMetadata,
    config: &ClientConfig,
) -> Result<AuthorizationRequest> {
    let nonce = generate_nonce();
    let url = authorization_url_with_nonce(metadata, config, &nonce)?;

    Ok(AuthorizationRequest { url, nonce })
}

pub fn authorization_url_with_nonce(
    metadata: &ProviderMetadata,
    config: &ClientConfig,
    nonce: &str,
) -> Result<Url> {
    let mut url = Url::parse(&metadata.authorization_endpoint).map_err(|e| {
        OidcError::Discovery(format!(
            "authorization_endpoint `{}` is not a valid URL: {e}",
            metadata.authorization_endpoint
        ))
    })?;

    let scope = config.scope();
    let mut query = serde_urlencoded::to_string(AuthUrlParams {
        client_id: &config.client_id,
        redirect_uri: &config.redirect_uri,
        scope: &scope,
        response_type: "code",
        nonce,
    })
    .map_err(|e| OidcError::Config(format!("could not encode authorization request: {e}")))?;

    if !config.extra_authorization_params.is_empty() {
        let extra = serde_urlencoded::to_string(&config.extra_authorization_params).map_err(|e| {
            OidcError::Config(format!("could not encode extra authorization params: {e}"))
        })?;
        query = format!("{query}&{extra}");
    }

    // Some providers put required parameters on the endpoint itself
    let query = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
        _ => query,
    };
    url.set_query(Some(&query));

    Ok(url)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn metadata(authorization_endpoint: &str) -> ProviderMetadata {
        ProviderMetadata::from_json(&format!(
            r#"{{"authorization_endpoint":"{authorization_endpoint}","token_endpoint":"https://idp/token"}}"#
        ))
        .unwrap()
    }

    fn config() -> ClientConfig {
        ClientConfig::new(
            "my-client",
            "my-secret",
            "https://idp",
            "https://rp.example/callback",
        )
    }

    fn query(url: &Url) -> HashMap<String, String> {
        url.query_pairs().into_owned().collect()
    }

    #[test]
    fn url_targets_the_authorization_endpoint() -> Result<()> {
        let request = build_authorization_url(&metadata("https://idp/authorize"), &config())?;

        assert_eq!(request.url.scheme(), "https");
        assert_eq!(request.url.host_str(), Some("idp"));
        assert_eq!(request.url.path(), "/authorize");

        let query = query(&request.url);
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["client_id"], "my-client");
        assert_eq!(query["redirect_uri"], "https://rp.example/callback");
        assert_eq!(query["scope"], "openid profile");
        assert_eq!(query["nonce"], request.nonce);
        assert!(request.nonce.len() >= 43);
        Ok(())
    }

    #[test]
    fn scope_is_space_joined_and_form_encoded() -> Result<()> {
        let url = authorization_url_with_nonce(&metadata("https://idp/authorize"), &config(), "n")?;

        assert!(url.as_str().contains("scope=openid+profile"));
        Ok(())
    }

    #[test]
    fn every_request_gets_a_new_nonce() -> Result<()> {
        let first = build_authorization_url(&metadata("https://idp/authorize"), &config())?;
        let second = build_authorization_url(&metadata("https://idp/authorize"), &config())?;

        assert_ne!(first.nonce, second.nonce);
        Ok(())
    }

    #[test]
    fn extra_params_are_appended() -> Result<()> {
        let mut config = config();
        config.extra_authorization_params = vec![("prompt".to_string(), "login".to_string())];

        let url = authorization_url_with_nonce(&metadata("https://idp/authorize"), &config, "n")?;

        assert_eq!(query(&url)["prompt"], "login");
        Ok(())
    }

    #[test]
    fn existing_endpoint_query_is_preserved() -> Result<()> {
        let url = authorization_url_with_nonce(
            &metadata("https://idp/authorize?tenant=acme"),
            &config(),
            "n",
        )?;

        let query = query(&url);
        assert_eq!(query["tenant"], "acme");
        assert_eq!(query["nonce"], "n");
        Ok(())
    }
}
