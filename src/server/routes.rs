//! HTTP routes.
//!
//! | Method | Path | Auth |
//! |--------|------|------|
//! | `GET` | `/health` | none |
//! | `GET` | `/.well-known/jwks.json`, `/v1/.well-known/jwks.json` | none |
//! | `GET` | `/.well-known/openid-configuration` | none |
//! | `POST` | `/v1/auth/login` | password |
//! | `POST` | `/v1/auth/register` | none |
//! | `POST` | `/v1/auth/refresh` | session credential |
//! | `POST` | `/v1/auth/logout` | session credential |
//! | `GET` | `/v1/oauth/authorize` | session cookie |
//! | `POST` | `/v1/oauth/token` | authorization code |
//! | `GET` | `/v1/user/info` | bearer, any audience |
//! | `DELETE` | `/v1/admin/users/{user_id}/sessions` | bearer, `MANAGE_USERS` |

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Form, Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{Extensions, HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use url::Url;

use super::{AppContext, client_info, error_response};
use crate::auth::{
    AuthError, AuthState, Identity, LoginRequest, RegisterRequest, SessionState,
    auth_middleware, cookie_value, require_permission, session_middleware,
};
use crate::oidc::discovery::{AUTHORIZE_PATH, JWKS_PATH, TOKEN_PATH, USERINFO_PATH};
use crate::oidc::{AuthorizeRequest, TokenRequest};
use crate::permission::{has_manage_users, has_system_admin};
use crate::session::SessionCredential;

/// Create the router
pub fn create_router(ctx: Arc<AppContext>) -> Router {
    let session_state = SessionState {
        sessions: Arc::clone(&ctx.sessions),
        permissions: Arc::clone(&ctx.permissions),
        cookie_name: Arc::from(ctx.config.auth.session_cookie.as_str()),
    };
    let any_audience = AuthState {
        tokens: Arc::clone(&ctx.tokens),
        revocation: Arc::clone(&ctx.revocation),
        expected_audience: Arc::from(Vec::<String>::new()),
    };
    let admin_audience = AuthState {
        expected_audience: Arc::from(ctx.config.auth.expected_audience.clone()),
        ..any_audience.clone()
    };

    let authorize_routes = Router::new()
        .route(AUTHORIZE_PATH, get(authorize))
        .route_layer(middleware::from_fn_with_state(session_state, session_middleware));

    let userinfo_routes = Router::new()
        .route(USERINFO_PATH, get(userinfo))
        .route_layer(middleware::from_fn_with_state(any_audience, auth_middleware));

    // layers run bottom-up: authenticate, then check the system scope
    let admin_routes = Router::new()
        .route(
            "/v1/admin/users/{user_id}/sessions",
            delete(revoke_user_sessions),
        )
        .route_layer(middleware::from_fn_with_state(
            can_manage_sessions as fn(u64) -> bool,
            require_permission,
        ))
        .route_layer(middleware::from_fn_with_state(admin_audience, auth_middleware));

    let request_timeout = ctx.config.server.request_timeout;

    Router::new()
        .route("/health", get(health_handler))
        .route("/.well-known/jwks.json", get(jwks_handler))
        .route(JWKS_PATH, get(jwks_handler))
        .route("/.well-known/openid-configuration", get(discovery_handler))
        .route("/v1/auth/login", post(login))
        .route("/v1/auth/register", post(register))
        .route("/v1/auth/refresh", post(refresh))
        .route("/v1/auth/logout", post(logout))
        .route(TOKEN_PATH, post(token))
        .merge(authorize_routes)
        .merge(userinfo_routes)
        .merge(admin_routes)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(ctx)
}

fn can_manage_sessions(mask: u64) -> bool {
    has_manage_users(mask) || has_system_admin(mask)
}

/// Map an [`AuthError`] to a JSON error. Server-side causes are logged, not returned.
fn auth_error(e: &AuthError) -> Response {
    if e.status_code().is_server_error() {
        error!(error = %e, "Auth request failed");
    }
    error_response(e.status_code(), e.error_code(), &e.client_message())
}

fn session_cookie(ctx: &AppContext, value: &str, max_age: Duration) -> String {
    let mut cookie = format!(
        "{}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        ctx.config.auth.session_cookie,
        max_age.as_secs()
    );
    if ctx.secure_cookies() {
        cookie.push_str("; Secure");
    }
    cookie
}

// ── Discovery ──────────────────────────────────────────────────────────────

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn jwks_handler(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "public, max-age=300")],
        Json(ctx.keys.current().jwks()),
    )
}

async fn discovery_handler(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    Json(ctx.discovery.clone())
}

// ── Sessions ───────────────────────────────────────────────────────────────

/// `POST /v1/auth/login`
async fn login(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Response {
    match ctx.auth.login(&body, &client_info(&headers)).await {
        Ok(resp) => {
            let cookie = session_cookie(
                &ctx,
                &resp.tokens.session_cookie_value(),
                ctx.config.auth.session_ttl,
            );
            ([(header::SET_COOKIE, cookie)], Json(resp)).into_response()
        }
        Err(e) => auth_error(&e),
    }
}

/// `POST /v1/auth/register`
async fn register(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<RegisterRequest>,
) -> Response {
    match ctx.auth.register(&body).await {
        Ok(profile) => {
            info!(user_id = %profile.id, "User registered");
            (StatusCode::CREATED, Json(profile)).into_response()
        }
        Err(e) => auth_error(&e),
    }
}

/// Session credential in a refresh or logout body.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CredentialBody {
    refresh_sid: String,
    refresh_token: String,
}

/// The credential from the JSON body if given, else from the session cookie.
fn session_credential(
    ctx: &AppContext,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<SessionCredential, AuthError> {
    if !body.is_empty() {
        let parsed: CredentialBody = serde_json::from_slice(body)
            .map_err(|e| AuthError::InvalidRequest(e.to_string()))?;
        if !parsed.refresh_sid.is_empty() || !parsed.refresh_token.is_empty() {
            return SessionCredential::parse(&format!(
                "{}:{}",
                parsed.refresh_sid, parsed.refresh_token
            ))
            .ok_or(AuthError::InvalidSession);
        }
    }
    cookie_value(headers, &ctx.config.auth.session_cookie)
        .and_then(SessionCredential::parse)
        .ok_or(AuthError::InvalidSession)
}

/// `POST /v1/auth/refresh`
async fn refresh(State(ctx): State<Arc<AppContext>>, headers: HeaderMap, body: Bytes) -> Response {
    let credential = match session_credential(&ctx, &headers, &body) {
        Ok(c) => c,
        Err(e) => return auth_error(&e),
    };
    match ctx.auth.refresh(&credential).await {
        Ok(tokens) => {
            let cookie = session_cookie(
                &ctx,
                &tokens.session_cookie_value(),
                ctx.config.auth.session_ttl,
            );
            ([(header::SET_COOKIE, cookie)], Json(tokens)).into_response()
        }
        Err(e) => auth_error(&e),
    }
}

/// `POST /v1/auth/logout`
async fn logout(State(ctx): State<Arc<AppContext>>, headers: HeaderMap, body: Bytes) -> Response {
    let credential = match session_credential(&ctx, &headers, &body) {
        Ok(c) => c,
        Err(e) => return auth_error(&e),
    };
    match ctx.auth.logout(&credential).await {
        Ok(()) => {
            let cookie = session_cookie(&ctx, "", Duration::ZERO);
            (StatusCode::NO_CONTENT, [(header::SET_COOKIE, cookie)]).into_response()
        }
        Err(e) => auth_error(&e),
    }
}

// ── Authorization code flow ────────────────────────────────────────────────

/// `GET /v1/oauth/authorize`
async fn authorize(
    State(ctx): State<Arc<AppContext>>,
    extensions: Extensions,
    Query(request): Query<AuthorizeRequest>,
) -> Response {
    if let Some(field) = request.missing_field() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            &format!("{field} is required"),
        );
    }

    let Some(identity) = extensions.get::<Identity>() else {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "login_required",
            "a logged-in session is required",
        );
    };

    let issued = match ctx.authorization.authorize(&request, &identity.user_id).await {
        Ok(issued) => issued,
        Err(e) => {
            if e.status_code().is_server_error() {
                error!(error = %e, "Authorization failed");
                return error_response(e.status_code(), e.error_code(), "internal error");
            }
            return error_response(e.status_code(), e.error_code(), &e.to_string());
        }
    };

    let mut location = match Url::parse(&request.redirect_uri) {
        Ok(url) => url,
        Err(e) => {
            warn!(client_id = %request.client_id, error = %e, "Registered redirect URI does not parse");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_redirect_uri",
                "redirect_uri is not a valid URL",
            );
        }
    };
    {
        let mut query = location.query_pairs_mut();
        query.append_pair("code", &issued.code);
        if !issued.state.is_empty() {
            query.append_pair("state", &issued.state);
        }
    }

    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// Token endpoint success body.
#[derive(Debug, Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
    expires_in: u64,
    scope: String,
}

/// `POST /v1/oauth/token`
async fn token(State(ctx): State<Arc<AppContext>>, Form(request): Form<TokenRequest>) -> Response {
    let code = match ctx.authorization.redeem(&request).await {
        Ok(code) => code,
        Err(e) => {
            if e.status_code().is_server_error() {
                error!(error = %e, "Code redemption failed");
                return error_response(e.status_code(), e.error_code(), "internal error");
            }
            return error_response(e.status_code(), e.error_code(), &e.to_string());
        }
    };

    // code-flow tokens are not bound to a refresh session
    let issued = match ctx.auth.mint(&code.user_id, "").await {
        Ok(issued) => issued,
        Err(e) => return auth_error(&e),
    };

    let body = TokenResponse {
        expires_in: issued.expires_in(),
        access_token: issued.token,
        token_type: "Bearer",
        scope: code.scopes.join(" "),
    };
    (
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::PRAGMA, "no-cache"),
        ],
        Json(body),
    )
        .into_response()
}

// ── Protected ──────────────────────────────────────────────────────────────

/// `GET /v1/user/info`
async fn userinfo(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
) -> Response {
    match ctx.auth.profile(&identity.user_id).await {
        Ok(profile) => Json(profile).into_response(),
        Err(e) => auth_error(&e),
    }
}

/// `DELETE /v1/admin/users/{user_id}/sessions`
async fn revoke_user_sessions(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Path(user_id): Path<String>,
) -> Response {
    match ctx.auth.revoke_user(&user_id).await {
        Ok(revoked) => {
            info!(admin = %identity.user_id, user_id = %user_id, revoked, "Revoked user sessions");
            Json(json!({"revoked": revoked})).into_response()
        }
        Err(e) => auth_error(&e),
    }
}
