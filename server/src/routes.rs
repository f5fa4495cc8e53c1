use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use color_eyre::eyre::eyre;
use serde::{Deserialize, Serialize};
use tower_cookies::CookieManagerLayer;
use tracing::{info, warn};

use crate::{
    cookies::SessionJar,
    errors::{ServerError, ServerResult, UserFacing, WithStatus as _},
    oidc::{Claims, ExpiryStatus, Session},
    state::AppState,
};

/// Build the application router
pub fn routes(app_state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(home))
        .route("/login", get(login))
        .route("/logout", get(logout))
        .route("/healthz", get(healthz));

    // A redirect URI pointing at `/` is handled by `home`
    if app_state.callback_path != "/" {
        router = router.route(&app_state.callback_path, get(callback));
    }

    router
        .layer(CookieManagerLayer::new())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Query parameters the provider sends to the redirect URI
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
    /// Echoed back by providers that require it; not used for matching
    pub state: Option<String>,
}

impl CallbackParams {
    fn is_callback(&self) -> bool {
        self.code.is_some() || self.error.is_some()
    }
}

/// What `/` reports about the current browser session
#[derive(Debug, Serialize)]
pub struct SessionView<'a> {
    pub authenticated: bool,
    pub claims: Option<&'a Claims>,
    pub remaining_seconds: Option<i64>,
}

impl<'a> SessionView<'a> {
    fn of(session: &'a Session) -> Self {
        Self {
            authenticated: session.is_authenticated(),
            claims: session.claims(),
            remaining_seconds: session.remaining_seconds(),
        }
    }
}

async fn home(
    state: State<AppState>,
    jar: SessionJar,
    Query(params): Query<CallbackParams>,
) -> ServerResult<Response, UserFacing> {
    if state.callback_path == "/" && params.is_callback() {
        return handle_callback(&state, &jar, params).await;
    }

    let mut session = jar.load();
    if session.check_expiry() == ExpiryStatus::Expired {
        jar.clear();
    }

    Ok(Json(SessionView::of(&session)).into_response())
}

async fn callback(
    state: State<AppState>,
    jar: SessionJar,
    Query(params): Query<CallbackParams>,
) -> ServerResult<Response, UserFacing> {
    handle_callback(&state, &jar, params).await
}

async fn handle_callback(
    state: &AppState,
    jar: &SessionJar,
    params: CallbackParams,
) -> ServerResult<Response, UserFacing> {
    info!(
        has_code = params.code.is_some(),
        error = ?params.error,
        state = ?params.state,
        "Callback received"
    );

    let mut session = jar.load();

    if let Some(error) = params.error {
        session.logout();
        jar.clear();

        let message = match params.error_description {
            Some(description) => format!("{error}: {description}"),
            None => error,
        };
        return Err(ServerError(
            eyre!("Provider returned an error: {message}"),
            (StatusCode::UNAUTHORIZED, format!("Login failed: {message}")),
        ));
    }

    let Some(code) = params.code else {
        jar.clear();
        return Err(ServerError(
            eyre!("Callback without an authorization code"),
            (
                StatusCode::BAD_REQUEST,
                "Login failed: missing authorization code".to_string(),
            ),
        ));
    };

    if let Err(err) = state.sessions.receive_callback(&mut session, &code).await {
        jar.clear();
        return Err(err.into());
    }

    jar.store(&session)
        .with_status(StatusCode::INTERNAL_SERVER_ERROR, "Could not save the session")?;

    Ok(Redirect::to("/").into_response())
}

async fn login(
    State(state): State<AppState>,
    jar: SessionJar,
) -> ServerResult<Redirect, UserFacing> {
    let mut session = jar.load();
    let url = state.sessions.start_login(&mut session).await?;

    jar.store(&session)
        .with_status(StatusCode::INTERNAL_SERVER_ERROR, "Could not save the session")?;

    Ok(Redirect::to(url.as_str()))
}

async fn logout(State(state): State<AppState>, jar: SessionJar) -> Redirect {
    let mut session = jar.load();

    let target = match state.sessions.end_session_url(&session).await {
        Ok(Some(url)) => url.to_string(),
        Ok(None) => "/".to_string(),
        Err(err) => {
            warn!(error = %err, "Could not build the provider logout URL");
            "/".to_string()
        }
    };

    session.logout();
    jar.clear();

    info!("User logged out successfully");
    Redirect::to(&target)
}

async fn healthz() -> &'static str {
    "ok"
}
