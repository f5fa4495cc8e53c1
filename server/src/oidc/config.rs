use std::{env, fmt, str::FromStr, time::Duration};

use color_eyre::eyre::WrapErr as _;
use reqwest::Url;
use tracing::warn;

use super::error::{OidcError, Result};

/// Path appended to an issuer URL to reach its discovery document
pub const WELL_KNOWN_PATH: &str = ".well-known/openid-configuration";

/// How the client authenticates itself at the token endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenEndpointAuthMethod {
    /// HTTP Basic with the form-encoded client id and secret
    #[default]
    ClientSecretBasic,
    /// `client_id` and `client_secret` sent as form fields
    ClientSecretPost,
}

impl FromStr for TokenEndpointAuthMethod {
    type Err = OidcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "client_secret_basic" => Ok(Self::ClientSecretBasic),
            "client_secret_post" => Ok(Self::ClientSecretPost),
            other => Err(OidcError::Config(format!(
                "unsupported token endpoint auth method `{other}`"
            ))),
        }
    }
}

/// Whether identity tokens are checked before a session becomes active.
///
/// `Unverified` only decodes the payload. `Verified` checks the signature,
/// issuer, audience, expiry and that the `nonce` claim matches the pending
/// login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdTokenValidation {
    #[default]
    Unverified,
    Verified,
}

/// Relying-party registration details plus the knobs for talking to the provider
#[derive(Clone)]
pub struct ClientConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Issuer URL, or the full discovery document URL
    pub issuer: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    /// Provider-specific parameters appended to the authorization request
    pub extra_authorization_params: Vec<(String, String)>,
    pub token_endpoint_auth_method: TokenEndpointAuthMethod,
    pub id_token_validation: IdTokenValidation,
    pub http_timeout: Duration,
    pub post_logout_redirect_uri: Option<String>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field(
                "extra_authorization_params",
                &self.extra_authorization_params,
            )
            .field(
                "token_endpoint_auth_method",
                &self.token_endpoint_auth_method,
            )
            .field("id_token_validation", &self.id_token_validation)
            .field("http_timeout", &self.http_timeout)
            .field("post_logout_redirect_uri", &self.post_logout_redirect_uri)
            .finish()
    }
}

impl ClientConfig {
    pub const DEFAULT_SCOPES: [&'static str; 2] = ["openid", "profile"];
    pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        issuer: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            issuer: issuer.into(),
            redirect_uri: redirect_uri.into(),
            scopes: Self::DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            extra_authorization_params: Vec::new(),
            token_endpoint_auth_method: TokenEndpointAuthMethod::default(),
            id_token_validation: IdTokenValidation::default(),
            http_timeout: Self::DEFAULT_HTTP_TIMEOUT,
            post_logout_redirect_uri: None,
        }
    }

    pub fn from_env() -> color_eyre::Result<Self> {
        let mut config = Self::new(
            required_var("OIDC_CLIENT_ID")?,
            required_var("OIDC_CLIENT_SECRET")?,
            required_var("OIDC_ISSUER")?,
            required_var("OIDC_REDIRECT_URI")?,
        );

        if let Ok(scopes) = env::var("OIDC_SCOPES") {
            config.scopes = scopes.split_whitespace().map(str::to_owned).collect();
        }

        if let Ok(method) = env::var("OIDC_TOKEN_AUTH_METHOD") {
            config.token_endpoint_auth_method = method.parse()?;
        }

        let verify = env::var("OIDC_VERIFY_ID_TOKEN").unwrap_or_default();
        if verify == "true" || verify == "1" {
            config.id_token_validation = IdTokenValidation::Verified;
        }

        if let Ok(millis) = env::var("OIDC_HTTP_TIMEOUT_MS") {
            let millis: u64 = millis
                .parse()
                .wrap_err("OIDC_HTTP_TIMEOUT_MS must be a whole number of milliseconds")?;
            config.http_timeout = Duration::from_millis(millis);
        }

        config.post_logout_redirect_uri = env::var("OIDC_POST_LOGOUT_REDIRECT_URI").ok();

        if let Ok(extra) = env::var("OIDC_EXTRA_AUTH_PARAMS") {
            config.extra_authorization_params = serde_urlencoded::from_str(&extra)
                .wrap_err("OIDC_EXTRA_AUTH_PARAMS must look like `key=value&key2=value2`")?;
        }

        config.validate()?;

        Ok(config)
    }

    /// Checks the URLs up front so a bad deployment fails at startup rather
    /// than on the first login
    pub fn validate(&self) -> Result<()> {
        self.discovery_url()?;
        self.redirect_url()?;

        if !self.scopes.iter().any(|scope| scope == "openid") {
            warn!(
                scopes = ?self.scopes,
                "Configured scopes do not include `openid`, the provider may not issue an identity token"
            );
        }

        Ok(())
    }

    /// Space-joined scope list, as sent in the authorization request
    pub fn scope(&self) -> String {
        self.scopes.join(" ")
    }

    pub fn redirect_url(&self) -> Result<Url> {
        Url::parse(&self.redirect_uri).map_err(|e| {
            OidcError::Config(format!(
                "redirect_uri `{}` is not a valid URL: {e}",
                self.redirect_uri
            ))
        })
    }

    /// The configured issuer is used as-is when it already points at the
    /// discovery document, otherwise the well-known path is appended to it.
    pub fn discovery_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.issuer).map_err(|e| {
            OidcError::Config(format!("issuer `{}` is not a valid URL: {e}", self.issuer))
        })?;

        // Any `.well-known` path is already a metadata document
        let path = url.path().trim_end_matches('/');
        if !path.contains("/.well-known/") {
            let path = format!("{path}/{WELL_KNOWN_PATH}");
            url.set_path(&path);
        }

        Ok(url)
    }
}

fn required_var(name: &str) -> color_eyre::Result<String> {
    env::var(name).wrap_err_with(|| format!("{name} environment variable not set"))
}
