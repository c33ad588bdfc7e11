//! Request authentication.
//!
//! [`auth_middleware`] turns a bearer token into an [`Identity`]:
//!
//! ```text
//! no header ─────────────▶ 401
//! not "Bearer <jwt>" ────▶ 401
//! bad signature / kid ───▶ 401
//! expired / iss / aud ───▶ 401
//! revocation unknown ────▶ 500 (fail-closed only)
//! revoked ───────────────▶ 401
//! otherwise ─────────────▶ Identity in request extensions
//! ```
//!
//! [`require_scope`] and [`require_permission`] run after it and fail closed.
//! [`session_middleware`] resolves the session cookie into the same
//! [`Identity`] for the authorization endpoint; a missing or bad cookie
//! simply leaves no identity behind.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::audit::{self, AuditEvent};
use crate::permission::{self, PermissionEngine, PermissionError, has_all};
use crate::revocation::{RevocationCache, RevocationError};
use crate::server::error_response;
use crate::session::{SessionCredential, SessionManager};
use crate::token::{Scopes, TokenError, TokenService};

/// Authenticated caller, valid for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// `sub`
    pub user_id: String,
    /// `sid`. Empty for tokens minted by the code exchange.
    pub session_id: String,
    /// `pver`
    pub permission_version: i64,
    /// Bitmask per scope key.
    pub scopes: Scopes,
}

impl Identity {
    /// Mask held for `scope_key`, zero if absent.
    #[must_use]
    pub fn mask(&self, scope_key: &str) -> u64 {
        self.scopes.get(scope_key).copied().unwrap_or(0)
    }

    /// Whether every bit of `required` is held for `scope_key`.
    #[must_use]
    pub fn has_scope(&self, scope_key: &str, required: u64) -> bool {
        has_all(self.mask(scope_key), required)
    }
}

/// Why a request was not authenticated.
#[derive(Debug)]
pub enum AuthRejection {
    /// No `Authorization` header.
    NoHeader,
    /// Header present but not `Bearer <token>`.
    MalformedHeader,
    /// Signature, kid or token structure invalid.
    SignatureInvalid(TokenError),
    /// Expired, wrong issuer or wrong audience.
    ClaimsInvalid(TokenError),
    /// Revocation status unknown under fail-closed.
    RevocationCheckFailed(RevocationError),
    /// The session behind the token is revoked.
    Revoked,
}

impl AuthRejection {
    /// HTTP status.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RevocationCheckFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::NoHeader => "missing authorization header",
            Self::MalformedHeader => "malformed authorization header",
            Self::SignatureInvalid(_) => "invalid token",
            Self::ClaimsInvalid(TokenError::Expired) => "token expired",
            Self::ClaimsInvalid(_) => "invalid token claims",
            Self::RevocationCheckFailed(_) => "revocation check failed",
            Self::Revoked => "token revoked",
        }
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        if self.status_code().is_server_error() {
            return error_response(self.status_code(), "server_error", "internal error");
        }
        let mut response = error_response(StatusCode::UNAUTHORIZED, "unauthorized", self.reason());
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, header::HeaderValue::from_static("Bearer"));
        response
    }
}

/// State for [`auth_middleware`].
#[derive(Clone)]
pub struct AuthState {
    /// Token verification.
    pub tokens: Arc<TokenService>,
    /// Revocation lookups.
    pub revocation: Arc<RevocationCache>,
    /// Audience the protected routes require. Empty accepts any.
    pub expected_audience: Arc<[String]>,
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthRejection> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthRejection::NoHeader)?
        .to_str()
        .map_err(|_| AuthRejection::MalformedHeader)?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .ok_or(AuthRejection::MalformedHeader)?
        .trim();
    if token.is_empty() {
        return Err(AuthRejection::MalformedHeader);
    }
    Ok(token)
}

/// Run the authentication steps in order, stopping at the first failure.
pub async fn authenticate(headers: &HeaderMap, state: &AuthState) -> Result<Identity, AuthRejection> {
    let token = bearer_token(headers)?;

    let claims = state
        .tokens
        .verify_signature(token)
        .map_err(AuthRejection::SignatureInvalid)?;

    state
        .tokens
        .validate(&claims, &state.expected_audience)
        .map_err(AuthRejection::ClaimsInvalid)?;

    match state.revocation.is_session_revoked(&claims.sid).await {
        Ok(false) => {}
        Ok(true) => return Err(AuthRejection::Revoked),
        Err(e) => return Err(AuthRejection::RevocationCheckFailed(e)),
    }

    Ok(Identity {
        user_id: claims.sub,
        session_id: claims.sid,
        permission_version: claims.pver,
        scopes: claims.scopes,
    })
}

/// Bearer authentication middleware.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    match authenticate(request.headers(), &state).await {
        Ok(identity) => {
            debug!(user_id = %identity.user_id, path = %request.uri().path(), "Authenticated request");
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(rejection) => {
            warn!(path = %request.uri().path(), reason = rejection.reason(), "Request not authenticated");
            audit::emit(&AuditEvent::token_rejected(rejection.reason()));
            rejection.into_response()
        }
    }
}

fn forbidden() -> Response {
    error_response(StatusCode::FORBIDDEN, "forbidden", "insufficient permissions")
}

/// Guard: the identity must hold every bit of `required` on `scope_key`.
///
/// Use with `axum::middleware::from_fn_with_state((scope_key, required), require_scope)`.
pub async fn require_scope(
    State((scope_key, required)): State<(&'static str, u64)>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let allowed = request
        .extensions()
        .get::<Identity>()
        .is_some_and(|id| required != 0 && id.has_scope(scope_key, required));
    if !allowed {
        debug!(scope_key, required, "Scope check failed");
        return forbidden();
    }
    next.run(request).await
}

/// Guard: the identity's system scope must pass `check`
/// (e.g. [`permission::has_manage_users`]).
pub async fn require_permission(
    State(check): State<fn(u64) -> bool>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let allowed = request
        .extensions()
        .get::<Identity>()
        .is_some_and(|id| check(id.mask(&permission::system_scope_key(None))));
    if !allowed {
        return forbidden();
    }
    next.run(request).await
}

/// State for [`session_middleware`].
#[derive(Clone)]
pub struct SessionState {
    /// Session validation.
    pub sessions: Arc<SessionManager>,
    /// Scopes and permission version of the session owner.
    pub permissions: Arc<PermissionEngine>,
    /// Cookie name.
    pub cookie_name: Arc<str>,
}

/// Value of cookie `name` in the `Cookie` headers.
#[must_use]
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

/// Resolve the session cookie in `headers` into an [`Identity`].
///
/// A missing, malformed, unknown or revoked cookie is `Ok(None)`. Only a
/// failed permission lookup is an error.
pub async fn resolve_session(
    headers: &HeaderMap,
    state: &SessionState,
) -> Result<Option<Identity>, PermissionError> {
    let Some(credential) =
        cookie_value(headers, &state.cookie_name).and_then(SessionCredential::parse)
    else {
        return Ok(None);
    };

    let session = match state.sessions.validate(credential.id, &credential.secret).await {
        Ok(session) => session,
        Err(e) => {
            debug!(session_id = %credential.id, error = %e, "Session cookie rejected");
            return Ok(None);
        }
    };

    let scopes = state.permissions.build_scopes(&session.user_id).await?;
    let permission_version = match state.permissions.permission_version(&session.user_id).await {
        Ok(v) => v,
        Err(e) => {
            warn!(user_id = %session.user_id, error = %e, "Permission version unavailable, using 1");
            1
        }
    };

    Ok(Some(Identity {
        user_id: session.user_id,
        session_id: session.id.to_string(),
        permission_version,
        scopes,
    }))
}

/// Attach the cookie's [`Identity`], if any. Only a failed permission
/// lookup rejects the request.
pub async fn session_middleware(
    State(state): State<SessionState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    match resolve_session(request.headers(), &state).await {
        Ok(Some(identity)) => {
            request.extensions_mut().insert(identity);
        }
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, "Session permissions unavailable");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "internal error",
            );
        }
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::HeaderValue;

    use super::*;
    use crate::permission::test_support::FailingPermissionStore;
    use crate::permission::{InMemoryPermissionStore, PermissionStore, Role};
    use crate::revocation::test_support::DownKvStore;
    use crate::session::InMemorySessionStore;
    use crate::revocation::{InMemoryKvStore, RetrySettings, RevocationPolicy};
    use crate::token::test_support::key_handle;

    const ISSUER: &str = "https://id.test";

    fn state_with(policy: RevocationPolicy, kv: Arc<dyn crate::revocation::KvStore>) -> AuthState {
        AuthState {
            tokens: Arc::new(TokenService::new(
                Arc::new(key_handle()),
                ISSUER,
                Duration::from_secs(900),
            )),
            revocation: Arc::new(RevocationCache::new(
                kv,
                policy,
                RetrySettings {
                    timeout: Duration::from_millis(50),
                    attempts: 1,
                    backoff: Duration::from_millis(1),
                },
            )),
            expected_audience: Arc::from(vec!["billing".to_string()]),
        }
    }

    fn state() -> AuthState {
        state_with(RevocationPolicy::FailOpen, Arc::new(InMemoryKvStore::new()))
    }

    fn token(state: &AuthState, service: &str) -> String {
        let mut scopes = Scopes::new();
        scopes.insert(service.to_string(), 0b101);
        state
            .tokens
            .generate_access_token("u1", "s1", scopes, 4)
            .unwrap()
            .token
    }

    fn headers(auth: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        h
    }

    #[tokio::test]
    async fn valid_token_yields_identity() {
        let state = state();
        let jwt = token(&state, "billing");

        let identity = authenticate(&headers(&format!("Bearer {jwt}")), &state)
            .await
            .unwrap();

        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.session_id, "s1");
        assert_eq!(identity.permission_version, 4);
        assert!(identity.has_scope("billing", 0b100));
        assert!(!identity.has_scope("billing", 0b010));
    }

    #[tokio::test]
    async fn missing_and_malformed_headers() {
        let state = state();
        assert!(matches!(
            authenticate(&HeaderMap::new(), &state).await,
            Err(AuthRejection::NoHeader)
        ));
        for bad in ["Basic abc", "Bearer", "Bearer   ", "token"] {
            assert!(
                matches!(
                    authenticate(&headers(bad), &state).await,
                    Err(AuthRejection::MalformedHeader)
                ),
                "{bad}"
            );
        }
    }

    #[tokio::test]
    async fn garbage_token_is_signature_invalid() {
        let state = state();
        let result = authenticate(&headers("Bearer not.a.jwt"), &state).await;
        assert!(matches!(result, Err(AuthRejection::SignatureInvalid(_))));
    }

    #[tokio::test]
    async fn wrong_audience_is_claims_invalid() {
        let state = state();
        let jwt = token(&state, "crm");
        let result = authenticate(&headers(&format!("Bearer {jwt}")), &state).await;
        assert!(matches!(
            result,
            Err(AuthRejection::ClaimsInvalid(TokenError::AudienceMismatch))
        ));
    }

    #[tokio::test]
    async fn revoked_session_is_rejected() {
        let state = state();
        let jwt = token(&state, "billing");
        state
            .revocation
            .revoke_session("s1", Duration::from_secs(60))
            .await
            .unwrap();

        let rejection = authenticate(&headers(&format!("Bearer {jwt}")), &state)
            .await
            .unwrap_err();
        assert!(matches!(rejection, AuthRejection::Revoked));
        assert_eq!(rejection.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_cache_fails_open_or_closed() {
        let open = state_with(RevocationPolicy::FailOpen, Arc::new(DownKvStore::default()));
        let jwt = token(&open, "billing");
        assert!(
            authenticate(&headers(&format!("Bearer {jwt}")), &open)
                .await
                .is_ok()
        );

        let closed = state_with(RevocationPolicy::FailClosed, Arc::new(DownKvStore::default()));
        let rejection = authenticate(&headers(&format!("Bearer {jwt}")), &closed)
            .await
            .unwrap_err();
        assert!(matches!(rejection, AuthRejection::RevocationCheckFailed(_)));
        assert_eq!(rejection.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn unauthorized_carries_www_authenticate() {
        let response = AuthRejection::NoHeader.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer"
        );

        let response = AuthRejection::RevocationCheckFailed(RevocationError::Timeout).into_response();
        assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
    }

    #[test]
    fn cookie_lookup() {
        let mut h = HeaderMap::new();
        h.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; session=abc:def; other=1"),
        );
        assert_eq!(cookie_value(&h, "session"), Some("abc:def"));
        assert_eq!(cookie_value(&h, "missing"), None);
    }

    fn session_state(roles: Arc<dyn crate::permission::PermissionStore>) -> SessionState {
        SessionState {
            sessions: Arc::new(SessionManager::new(
                Arc::new(InMemorySessionStore::new()),
                Duration::from_secs(1),
            )),
            permissions: Arc::new(PermissionEngine::new(roles, Duration::from_secs(1))),
            cookie_name: Arc::from("session"),
        }
    }

    fn cookie(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("session={value}")).unwrap(),
        );
        h
    }

    #[tokio::test]
    async fn session_cookie_resolves_to_full_identity() {
        // GIVEN: a live session for a user holding billing bits 0 and 2
        let roles = Arc::new(InMemoryPermissionStore::new());
        roles.upsert_role(Role::new("billing-ops", "billing", None, &[0, 2]).unwrap());
        roles.assign_role("u1", "billing-ops").unwrap();
        let state = session_state(roles.clone());
        let created = state
            .sessions
            .create("u1", None, None, Duration::from_secs(60))
            .await
            .unwrap();

        // WHEN: resolving its cookie
        let identity = resolve_session(&cookie(&created.credential().encode()), &state)
            .await
            .unwrap()
            .unwrap();

        // THEN: the identity carries the session, scopes and version
        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.session_id, created.session.id.to_string());
        assert!(identity.has_scope("billing", 0b101));
        assert_eq!(
            identity.permission_version,
            roles.permission_version("u1").await.unwrap()
        );
    }

    #[tokio::test]
    async fn bad_cookie_is_no_identity() {
        let state = session_state(Arc::new(InMemoryPermissionStore::new()));
        let created = state
            .sessions
            .create("u1", None, None, Duration::from_secs(60))
            .await
            .unwrap();
        let wrong = SessionCredential {
            id: created.session.id,
            secret: "not-the-secret".into(),
        };

        for headers in [HeaderMap::new(), cookie("garbage"), cookie(&wrong.encode())] {
            assert!(resolve_session(&headers, &state).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn failed_permission_lookup_is_an_error() {
        let state = session_state(Arc::new(FailingPermissionStore));
        let created = state
            .sessions
            .create("u1", None, None, Duration::from_secs(60))
            .await
            .unwrap();

        let result = resolve_session(&cookie(&created.credential().encode()), &state).await;

        assert!(matches!(result, Err(PermissionError::Store(_))));
    }
}
