//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::bouncer::{Bouncer, bounce};
use super::rate_limit::{RateLimiter, limit_access};
use super::service::{AuthGateway, AuthenticatedSession};
use crate::error::AuthError;
use crate::identity::{AccessPolicy, Identity};
use crate::token::{RevocationList, SessionToken};
use crate::upstream::UpstreamCredentialCache;
use crate::verifier::{Credentials, UserRecord};

/// Shared application state
pub struct AppState {
    /// Login, logout and password flows
    pub gateway: Arc<AuthGateway>,
    /// Revoked session tokens
    pub revocations: Arc<RevocationList>,
    /// Upstream credential cache (reported on `/health`)
    pub upstream: UpstreamCredentialCache,
}

/// Create the router.
///
/// Public authentication routes sit behind the rate limiter; everything else
/// behind the bouncer with the route's access policy.
pub fn create_router(
    state: Arc<AppState>,
    bouncer: &Arc<Bouncer>,
    limiter: Arc<RateLimiter>,
) -> Router {
    let login = Router::new()
        .route("/auth", post(authenticate_handler))
        .route("/auth/oauth/validate", post(validate_oauth_handler))
        .route_layer(middleware::from_fn_with_state(
            bouncer.guard(AccessPolicy::Public),
            bounce,
        ))
        .route_layer(middleware::from_fn_with_state(limiter, limit_access));

    let session = Router::new()
        .route("/auth/logout", post(logout_handler))
        .route("/users/me", get(me_handler))
        .route("/users/me/passwd", put(change_password_handler))
        .route_layer(middleware::from_fn_with_state(
            bouncer.guard(AccessPolicy::Authenticated),
            bounce,
        ));

    let admin = Router::new()
        .route("/users", get(list_users_handler))
        .route_layer(middleware::from_fn_with_state(
            bouncer.guard(AccessPolicy::admin_only()),
            bounce,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .merge(login)
        .merge(session)
        .merge(admin)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `POST /auth` body
#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

/// `POST /auth/oauth/validate` body
#[derive(Debug, Deserialize)]
struct OAuthValidateRequest {
    code: String,
}

/// `PUT /users/me/passwd` body
#[derive(Deserialize)]
struct ChangePasswordRequest {
    password: String,
    new_password: String,
}

fn payload<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AuthError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| AuthError::InvalidRequest(rejection.body_text()))
}

/// POST /auth
async fn authenticate_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<AuthenticatedSession>, AuthError> {
    let LoginRequest { username, password } = payload(body)?;
    if username.trim().is_empty() || password.is_empty() {
        return Err(AuthError::InvalidRequest(
            "username and password are required".to_string(),
        ));
    }

    let session = state
        .gateway
        .authenticate(Credentials::Password { username, password })
        .await?;
    Ok(Json(session))
}

/// POST /auth/oauth/validate
async fn validate_oauth_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<OAuthValidateRequest>, JsonRejection>,
) -> Result<Json<AuthenticatedSession>, AuthError> {
    let OAuthValidateRequest { code } = payload(body)?;
    let session = state.gateway.validate_oauth(code).await?;
    Ok(Json(session))
}

/// POST /auth/logout
async fn logout_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionToken>,
) -> StatusCode {
    state.gateway.logout(&session);
    StatusCode::NO_CONTENT
}

/// GET /users/me
async fn me_handler(Extension(identity): Extension<Identity>) -> Json<Identity> {
    Json(identity)
}

/// PUT /users/me/passwd
async fn change_password_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    body: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> Result<StatusCode, AuthError> {
    let request = payload(body)?;
    state
        .gateway
        .change_password(&identity, &request.password, &request.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /users
async fn list_users_handler(State(state): State<Arc<AppState>>) -> Json<Vec<UserRecord>> {
    Json(state.gateway.verifier().users().list().await)
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "revoked_sessions": state.revocations.len(),
        "upstream_credentials": state.upstream.stats(),
    }))
}
