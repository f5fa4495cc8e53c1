use std::{env, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use color_eyre::eyre::{eyre, WrapErr as _};
use tower_cookies::Key;
use tracing::{info, warn};

use crate::oidc::{ClientConfig, SessionManager};

/// Paths the router serves itself; the callback cannot live on one of them
const RESERVED_PATHS: [&str; 3] = ["/login", "/logout", "/healthz"];

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub cookie_key: Key,
    /// Path component of the configured redirect URI
    pub callback_path: String,
    /// Mark cookies `Secure` when the redirect URI is served over https
    pub secure_cookies: bool,
}

impl AppState {
    pub fn from_env() -> color_eyre::Result<Self> {
        let config = ClientConfig::from_env()?;
        let cookie_key = cookie_key_from_env()?;

        info!(
            client_id = %config.client_id,
            issuer = %config.issuer,
            redirect_uri = %config.redirect_uri,
            "Loaded OIDC client configuration"
        );

        Self::new(config, cookie_key)
    }

    pub fn new(config: ClientConfig, cookie_key: Key) -> color_eyre::Result<Self> {
        let sessions = SessionManager::new(config)?;
        Self::with_manager(sessions, cookie_key)
    }

    pub fn with_manager(sessions: SessionManager, cookie_key: Key) -> color_eyre::Result<Self> {
        let redirect = sessions.config().redirect_url()?;
        let callback_path = redirect.path().to_string();

        if RESERVED_PATHS.contains(&callback_path.as_str()) {
            return Err(eyre!(
                "redirect URI path {callback_path} collides with a built-in route"
            ));
        }

        Ok(Self {
            sessions: Arc::new(sessions),
            cookie_key,
            callback_path,
            secure_cookies: redirect.scheme() == "https",
        })
    }
}

/// Reads the base64 `COOKIE_KEY`, generating a throwaway key when it is unset
fn cookie_key_from_env() -> color_eyre::Result<Key> {
    let Ok(encoded) = env::var("COOKIE_KEY") else {
        warn!("COOKIE_KEY not set, generating a random key; sessions will not survive a restart");
        return Ok(Key::generate());
    };

    let bytes = STANDARD
        .decode(encoded.trim())
        .wrap_err("COOKIE_KEY must be base64 encoded")?;

    Key::try_from(bytes.as_slice()).map_err(|e| eyre!("COOKIE_KEY is not a usable key: {e}"))
}
