use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use color_eyre::Report;

use crate::oidc::OidcError;

/// A handler error: the report gets logged, `R` is what the browser sees
#[derive(Debug)]
pub struct ServerError<R: IntoResponse>(pub(crate) Report, pub(crate) R);

pub type ServerResult<S, F = Response> = Result<S, ServerError<F>>;

/// Status plus a short message that is safe to show the user
pub type UserFacing = (StatusCode, String);

impl<R: IntoResponse> IntoResponse for ServerError<R> {
    fn into_response(self) -> axum::response::Response {
        tracing::error!(error = ?self.0, "Request Error");

        self.1.into_response()
    }
}

impl From<OidcError> for ServerError<UserFacing> {
    fn from(err: OidcError) -> Self {
        let status = login_failure_status(&err);
        let message = format!("Login failed: {err}");

        ServerError(err.into(), (status, message))
    }
}

/// Provider or network trouble is a bad gateway; a rejected code or token
/// means the login itself was not accepted.
pub fn login_failure_status(err: &OidcError) -> StatusCode {
    match err {
        OidcError::Discovery(_) | OidcError::Timeout { .. } => StatusCode::BAD_GATEWAY,
        OidcError::TokenExchange(_) | OidcError::ClaimsDecode(_) | OidcError::Verification(_) => {
            StatusCode::UNAUTHORIZED
        }
        OidcError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) trait WithStatus<T> {
    fn with_status(self, status: StatusCode, message: &str) -> ServerResult<T, UserFacing>;
}

impl<T> WithStatus<T> for Result<T, Report> {
    fn with_status(self, status: StatusCode, message: &str) -> ServerResult<T, UserFacing> {
        match self {
            Ok(val) => Ok(val),
            Err(err) => Err(ServerError(err, (status, message.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn provider_trouble_is_a_bad_gateway() {
        assert_eq!(
            login_failure_status(&OidcError::Discovery("down".to_string())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            login_failure_status(&OidcError::Timeout {
                endpoint: "token",
                timeout: Duration::from_secs(1)
            }),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn rejected_logins_are_unauthorized() {
        for err in [
            OidcError::TokenExchange("invalid_grant".to_string()),
            OidcError::ClaimsDecode("1 segment".to_string()),
            OidcError::Verification("nonce".to_string()),
        ] {
            assert_eq!(login_failure_status(&err), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn oidc_errors_render_a_user_message() {
        let response =
            ServerError::<UserFacing>::from(OidcError::TokenExchange("invalid_grant".to_string()))
                .into_response();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
