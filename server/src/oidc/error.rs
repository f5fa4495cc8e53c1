use std::time::Duration;

/// Everything that can go wrong while driving a login against the provider.
#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    /// The discovery document could not be fetched or parsed
    #[error("provider discovery failed: {0}")]
    Discovery(String),
    /// The token endpoint refused the code or answered with something unreadable
    #[error("token exchange failed: {0}")]
    TokenExchange(String),
    /// The identity token is not a three-segment token with a JSON payload
    #[error("identity token could not be decoded: {0}")]
    ClaimsDecode(String),
    #[error("request to the {endpoint} endpoint timed out after {timeout:?}")]
    Timeout {
        endpoint: &'static str,
        timeout: Duration,
    },
    /// Only raised when identity token verification is switched on
    #[error("identity token rejected: {0}")]
    Verification(String),
    #[error("invalid client configuration: {0}")]
    Config(String),
}

pub type Result<T, E = OidcError> = std::result::Result<T, E>;

/// Maps a transport error onto [`OidcError::Timeout`] when the deadline was hit,
/// and onto `kind` otherwise.
pub(crate) fn request_error(
    err: reqwest::Error,
    endpoint: &'static str,
    timeout: Duration,
    kind: fn(String) -> OidcError,
) -> OidcError {
    if err.is_timeout() {
        OidcError::Timeout { endpoint, timeout }
    } else {
        kind(format!("request to the {endpoint} endpoint failed: {err}"))
    }
}
