//! A fake OpenID Provider: discovery, authorization, token and JWKS endpoints
//! backed by in-memory grants. Identity tokens are HS256-signed with the client
//! secret.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::{Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use jsonwebtoken::{encode, EncodingKey, Header};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Lifetime of the identity tokens this provider issues
const ID_TOKEN_TTL: u64 = 300;

/// How the fake provider behaves
#[derive(Debug, Clone)]
pub struct IdpConfig {
    pub client_id: String,
    pub client_secret: String,
    pub subject: String,
    pub name: String,
    /// Sent verbatim as `expires_in`; left out of the token response when `None`
    pub expires_in: Option<Value>,
    /// Returned instead of a freshly signed identity token
    pub id_token_override: Option<String>,
    pub discovery_delay: Option<Duration>,
    pub token_delay: Option<Duration>,
    /// Advertise an `end_session_endpoint`
    pub end_session: bool,
}

impl Default for IdpConfig {
    fn default() -> Self {
        Self {
            client_id: "test-client".to_string(),
            client_secret: "test-secret".to_string(),
            subject: "u1".to_string(),
            name: "Alice".to_string(),
            expires_in: Some(json!(3600)),
            id_token_override: None,
            discovery_delay: None,
            token_delay: None,
            end_session: true,
        }
    }
}

#[derive(Debug, Clone)]
struct Grant {
    nonce: Option<String>,
    redirect_uri: String,
}

#[derive(Clone)]
pub struct IdpState {
    config: Arc<IdpConfig>,
    issuer: String,
    grants: Arc<Mutex<HashMap<String, Grant>>>,
    discovery_hits: Arc<AtomicUsize>,
    token_hits: Arc<AtomicUsize>,
    jwks_hits: Arc<AtomicUsize>,
}

impl IdpState {
    pub fn new(config: IdpConfig, issuer: impl Into<String>) -> Self {
        Self {
            config: Arc::new(config),
            issuer: issuer.into(),
            grants: Arc::default(),
            discovery_hits: Arc::default(),
            token_hits: Arc::default(),
            jwks_hits: Arc::default(),
        }
    }
}

pub fn router(state: IdpState) -> Router {
    Router::new()
        .route("/.well-known/openid-configuration", get(discovery))
        .route("/broken/.well-known/openid-configuration", get(broken_discovery))
        .route("/garbage/.well-known/openid-configuration", get(garbage_discovery))
        .route("/authorize", get(authorize))
        .route("/token", post(token))
        .route("/jwks.json", get(jwks))
        .route("/logout", get(end_session))
        .with_state(state)
}

async fn discovery(State(state): State<IdpState>) -> impl IntoResponse {
    state.discovery_hits.fetch_add(1, Ordering::SeqCst);
    if let Some(delay) = state.config.discovery_delay {
        tokio::time::sleep(delay).await;
    }

    let issuer = &state.issuer;
    let mut document = json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/authorize"),
        "token_endpoint": format!("{issuer}/token"),
        "jwks_uri": format!("{issuer}/jwks.json"),
        "response_types_supported": ["code"],
        "scopes_supported": ["openid", "profile"],
        "id_token_signing_alg_values_supported": ["HS256"],
        "token_endpoint_auth_methods_supported": ["client_secret_basic", "client_secret_post"],
    });
    if state.config.end_session {
        document["end_session_endpoint"] = json!(format!("{issuer}/logout"));
    }

    info!(%issuer, "IdP: serving discovery document");
    Json(document)
}

async fn broken_discovery() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "discovery is down")
}

async fn garbage_discovery() -> impl IntoResponse {
    (StatusCode::OK, "<html>maintenance</html>")
}

#[derive(Debug, Deserialize)]
struct AuthorizeParams {
    client_id: String,
    redirect_uri: String,
    response_type: String,
    nonce: Option<String>,
    state: Option<String>,
}

async fn authorize(
    State(state): State<IdpState>,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    if params.client_id != state.config.client_id {
        return (StatusCode::BAD_REQUEST, "unknown client_id").into_response();
    }
    if params.response_type != "code" {
        return (StatusCode::BAD_REQUEST, "unsupported response_type").into_response();
    }

    let Ok(mut redirect) = Url::parse(&params.redirect_uri) else {
        return (StatusCode::BAD_REQUEST, "invalid redirect_uri").into_response();
    };

    let code = Uuid::new_v4().to_string();
    {
        let mut query = redirect.query_pairs_mut();
        query.append_pair("code", &code);
        if let Some(client_state) = &params.state {
            query.append_pair("state", client_state);
        }
    }

    info!(%code, nonce = ?params.nonce, "IdP: issuing authorization code");
    if let Ok(mut grants) = state.grants.lock() {
        grants.insert(
            code,
            Grant {
                nonce: params.nonce,
                redirect_uri: params.redirect_uri,
            },
        );
    }

    Redirect::to(redirect.as_str()).into_response()
}

#[derive(Debug, Deserialize)]
struct TokenForm {
    grant_type: String,
    code: String,
    redirect_uri: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

fn token_error(status: StatusCode, error: &str, description: &str) -> Response {
    warn!(%status, error, description, "IdP: rejecting token request");
    (
        status,
        Json(json!({ "error": error, "error_description": description })),
    )
        .into_response()
}

/// Client credentials from HTTP Basic, falling back to the form body.
/// Credentials are compared verbatim, so test clients should stick to
/// characters that form-encode to themselves.
fn client_credentials(headers: &HeaderMap, form: &TokenForm) -> Option<(String, String)> {
    let basic = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .and_then(|decoded| {
            decoded
                .split_once(':')
                .map(|(id, secret)| (id.to_string(), secret.to_string()))
        });

    basic.or_else(|| match (&form.client_id, &form.client_secret) {
        (Some(id), Some(secret)) => Some((id.clone(), secret.clone())),
        _ => None,
    })
}

async fn token(
    State(state): State<IdpState>,
    headers: HeaderMap,
    Form(form): Form<TokenForm>,
) -> Response {
    state.token_hits.fetch_add(1, Ordering::SeqCst);
    if let Some(delay) = state.config.token_delay {
        tokio::time::sleep(delay).await;
    }

    let config = &state.config;
    match client_credentials(&headers, &form) {
        Some((id, secret)) if id == config.client_id && secret == config.client_secret => {}
        _ => {
            return token_error(
                StatusCode::UNAUTHORIZED,
                "invalid_client",
                "client authentication failed",
            )
        }
    }

    if form.grant_type != "authorization_code" {
        return token_error(
            StatusCode::BAD_REQUEST,
            "unsupported_grant_type",
            "only authorization_code is supported",
        );
    }

    // Codes are single use
    let grant = state
        .grants
        .lock()
        .ok()
        .and_then(|mut grants| grants.remove(&form.code));
    let Some(grant) = grant else {
        return token_error(
            StatusCode::BAD_REQUEST,
            "invalid_grant",
            "unknown or already used code",
        );
    };

    if grant.redirect_uri != form.redirect_uri {
        return token_error(
            StatusCode::BAD_REQUEST,
            "invalid_grant",
            "redirect_uri mismatch",
        );
    }

    let id_token = match &config.id_token_override {
        Some(id_token) => id_token.clone(),
        None => match sign_id_token(&state, grant.nonce.as_deref()) {
            Ok(id_token) => id_token,
            Err(err) => {
                error!(error = %err, "IdP: failed to sign identity token");
                return (StatusCode::INTERNAL_SERVER_ERROR, "signing failed").into_response();
            }
        },
    };

    let mut body = json!({
        "access_token": Uuid::new_v4().to_string(),
        "token_type": "Bearer",
        "id_token": id_token,
    });
    if let Some(expires_in) = &config.expires_in {
        body["expires_in"] = expires_in.clone();
    }

    info!(sub = %config.subject, "IdP: issued tokens");
    Json(body).into_response()
}

fn sign_id_token(state: &IdpState, nonce: Option<&str>) -> anyhow::Result<String> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let config = &state.config;

    let mut claims = json!({
        "iss": state.issuer,
        "sub": config.subject,
        "aud": config.client_id,
        "name": config.name,
        "iat": now,
        "exp": now + ID_TOKEN_TTL,
    });
    if let Some(nonce) = nonce {
        claims["nonce"] = json!(nonce);
    }

    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.client_secret.as_bytes()),
    )?)
}

async fn jwks(State(state): State<IdpState>) -> impl IntoResponse {
    state.jwks_hits.fetch_add(1, Ordering::SeqCst);
    // Tokens are MAC-signed with the client secret, so there are no public keys
    Json(json!({ "keys": [] }))
}

async fn end_session(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    info!(
        has_hint = params.contains_key("id_token_hint"),
        "IdP: end session"
    );
    "logged out"
}

/// A provider served from a background task on an ephemeral local port.
/// The server stops when this is dropped.
pub struct RunningIdp {
    state: IdpState,
    handle: JoinHandle<()>,
}

impl RunningIdp {
    pub async fn spawn(config: IdpConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = IdpState::new(config, format!("http://{addr}"));

        let app = router(state.clone());
        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                error!(error = %err, "IdP fixture stopped");
            }
        });

        Ok(Self { state, handle })
    }

    pub fn issuer(&self) -> &str {
        &self.state.issuer
    }

    /// Issuer whose discovery endpoint answers HTTP 500
    pub fn broken_issuer(&self) -> String {
        format!("{}/broken", self.issuer())
    }

    /// Issuer whose discovery endpoint answers with HTML
    pub fn garbage_issuer(&self) -> String {
        format!("{}/garbage", self.issuer())
    }

    pub fn discovery_hits(&self) -> usize {
        self.state.discovery_hits.load(Ordering::SeqCst)
    }

    pub fn token_hits(&self) -> usize {
        self.state.token_hits.load(Ordering::SeqCst)
    }

    pub fn jwks_hits(&self) -> usize {
        self.state.jwks_hits.load(Ordering::SeqCst)
    }

    /// Play the browser: follow an authorization URL and return the `code`
    /// the provider redirects back with
    pub async fn authorize(&self, authorization_url: &str) -> anyhow::Result<String> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let response = client.get(authorization_url).send().await?;
        if !response.status().is_redirection() {
            anyhow::bail!("authorize answered {} instead of a redirect", response.status());
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .ok_or_else(|| anyhow::anyhow!("authorize redirect has no Location"))?
            .to_str()?;
        let location = Url::parse(location)?;

        location
            .query_pairs()
            .find(|(key, _)| key == "code")
            .map(|(_, code)| code.into_owned())
            .ok_or_else(|| anyhow::anyhow!("redirect {location} carries no code"))
    }
}

impl Drop for RunningIdp {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
