use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse as _, Response},
};
use color_eyre::eyre::{eyre, WrapErr as _};
use tower_cookies::{
    cookie::{CookieJar, SameSite},
    Cookie, Cookies, Key,
};
use tracing::{error, warn};

use crate::{
    oidc::{Session, SessionRecord},
    state::AppState,
};

/// Name of the private cookie holding the serialized [`SessionRecord`]
pub const SESSION_COOKIE: &str = "oidc_session";

/// Browsers drop cookies whose `Set-Cookie` line is larger than this
pub const MAX_COOKIE_BYTES: usize = 4096;

/// Encrypted, cookie-backed storage for the login [`Session`]
pub struct SessionJar {
    cookies: Cookies,
    key: Key,
    secure: bool,
}

#[async_trait::async_trait]
impl FromRequestParts<AppState> for SessionJar {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let cookies = match Cookies::from_request_parts(parts, state).await {
            Ok(cookies) => cookies,
            Err(_) => {
                error!("Failed to extract cookies from request");
                return Err(StatusCode::INTERNAL_SERVER_ERROR.into_response());
            }
        };

        Ok(SessionJar {
            cookies,
            key: state.cookie_key.clone(),
            secure: state.secure_cookies,
        })
    }
}

impl SessionJar {
    /// The session stored in the request, or `Unauthenticated` when there is
    /// none or it cannot be read back
    pub fn load(&self) -> Session {
        let Some(cookie) = self.cookies.private(&self.key).get(SESSION_COOKIE) else {
            return Session::default();
        };

        match serde_json::from_str::<SessionRecord>(cookie.value()) {
            Ok(record) => Session::from_record(record),
            Err(err) => {
                warn!(error = %err, "Ignoring unreadable session cookie");
                Session::default()
            }
        }
    }

    /// Writes `session` into the response. A session too large for a browser
    /// to keep is not written and any stored one is cleared instead.
    pub fn store(&self, session: &Session) -> color_eyre::Result<()> {
        if *session == Session::Unauthenticated {
            self.clear();
            return Ok(());
        }

        let value = serde_json::to_string(&session.to_record())
            .wrap_err("Failed to serialize session record")?;

        let mut cookie = Cookie::build((SESSION_COOKIE, value))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(self.secure)
            .build();
        if let Some(remaining) = session.remaining_seconds() {
            cookie.set_max_age(time::Duration::seconds(remaining));
        }

        let size = self.encrypted_size(&cookie)?;
        if size > MAX_COOKIE_BYTES {
            self.clear();
            return Err(eyre!(
                "Session cookie would be {size} bytes, over the {MAX_COOKIE_BYTES} byte browser limit"
            ));
        }

        self.cookies.private(&self.key).add(cookie);
        Ok(())
    }

    /// Length of the `Set-Cookie` value once `cookie` is encrypted
    fn encrypted_size(&self, cookie: &Cookie<'static>) -> color_eyre::Result<usize> {
        let mut scratch = CookieJar::new();
        scratch.private_mut(&self.key).add(cookie.clone());

        scratch
            .get(SESSION_COOKIE)
            .map(|encrypted| encrypted.to_string().len())
            .ok_or_else(|| eyre!("Encrypted session cookie went missing"))
    }

    pub fn clear(&self) {
        self.cookies
            .private(&self.key)
            .remove(Cookie::build(SESSION_COOKIE).path("/").build());
    }
}
