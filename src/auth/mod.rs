//! Login, registration, refresh and logout.
//!
//! [`AuthService`] ties the user repository, [`SessionManager`],
//! [`PermissionEngine`] and [`TokenService`] together:
//!
//! ```text
//! login ──▶ verify password ──▶ build scopes + pver ──▶ create session ──▶ mint token
//! refresh ──▶ rotate session ──▶ re-read scopes + pver ──▶ mint token
//! logout ──▶ revoke session ──▶ record sid in the revocation cache
//! ```
//!
//! Every credential failure is reported as [`AuthError::InvalidCredentials`]
//! or [`AuthError::InvalidSession`] so callers cannot tell an unknown user
//! from a wrong password.

pub mod middleware;
mod users;

pub use middleware::{
    AuthRejection, AuthState, Identity, SessionState, auth_middleware, authenticate,
    cookie_value, require_permission, require_scope, resolve_session, session_middleware,
};
pub use users::{
    InMemoryUserRepository, User, UserProfile, UserRepository, hash_password, verify_password,
};

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{self, AuditEvent};
use crate::error::{StoreError, with_deadline};
use crate::permission::{PermissionEngine, PermissionError};
use crate::revocation::{RevocationCache, RevocationError};
use crate::session::{SessionCredential, SessionError, SessionManager};
use crate::token::{AccessTokenClaims, IssuedToken, Scopes, TokenError, TokenService};

/// Authentication failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Unknown user, wrong password or inactive account.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Unknown, expired, revoked or replayed session.
    #[error("invalid session")]
    InvalidSession,

    /// A concurrent refresh of the same session won.
    #[error("session was refreshed concurrently")]
    Conflict,

    /// Malformed registration or login input.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Username already registered.
    #[error("username already exists")]
    UsernameExists,

    /// Email already registered.
    #[error("email already exists")]
    EmailExists,

    /// No such user.
    #[error("user not found")]
    UserNotFound,

    /// Permission lookup failed.
    #[error(transparent)]
    Permission(#[from] PermissionError),

    /// Token minting failed.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Revocation lookup failed under fail-closed.
    #[error(transparent)]
    Revocation(#[from] RevocationError),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<SessionError> for AuthError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::InvalidSession
            | SessionError::InvalidSecret
            | SessionError::ReplayDetected => Self::InvalidSession,
            SessionError::Conflict => Self::Conflict,
            SessionError::Store(e) => Self::Store(e),
        }
    }
}

impl AuthError {
    /// HTTP status.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidCredentials | Self::InvalidSession => StatusCode::UNAUTHORIZED,
            Self::Conflict | Self::UsernameExists | Self::EmailExists => StatusCode::CONFLICT,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::UserNotFound => StatusCode::NOT_FOUND,
            Self::Permission(_)
            | Self::Token(_)
            | Self::Store(_)
            | Self::Revocation(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::InvalidSession => "invalid_session",
            Self::Conflict => "conflict",
            Self::InvalidRequest(_) => "invalid_request",
            Self::UsernameExists => "username_exists",
            Self::EmailExists => "email_exists",
            Self::UserNotFound => "user_not_found",
            _ => "server_error",
        }
    }

    /// Message safe to show a client. Internal details stay in the logs.
    #[must_use]
    pub fn client_message(&self) -> String {
        if self.status_code().is_server_error() {
            "internal error".to_string()
        } else {
            self.to_string()
        }
    }
}

/// Where a request came from.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    /// `User-Agent` header.
    pub user_agent: Option<String>,
    /// Client address.
    pub ip: Option<IpAddr>,
}

/// Login body.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    /// Login name.
    #[serde(default)]
    pub username: String,
    /// Plaintext password.
    #[serde(default)]
    pub password: String,
}

/// Registration body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegisterRequest {
    /// Login name.
    pub username: String,
    /// Optional email.
    pub email: String,
    /// Plaintext password.
    pub password: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
}

/// Tokens handed out by login and refresh.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    /// Signed access token.
    pub access_token: String,
    /// Always `Bearer`.
    pub token_type: &'static str,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    /// Session secret.
    pub refresh_token: String,
    /// Session id.
    pub refresh_sid: String,
}

impl TokenPair {
    fn new(issued: IssuedToken, credential: &SessionCredential) -> Self {
        Self {
            expires_in: issued.expires_in(),
            access_token: issued.token,
            token_type: "Bearer",
            refresh_token: credential.secret.clone(),
            refresh_sid: credential.id.to_string(),
        }
    }

    /// `"<sid>:<secret>"` for the session cookie.
    #[must_use]
    pub fn session_cookie_value(&self) -> String {
        format!("{}:{}", self.refresh_sid, self.refresh_token)
    }
}

/// Successful login.
#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    /// Token pair.
    #[serde(flatten)]
    pub tokens: TokenPair,
    /// The logged-in user.
    pub user: UserProfile,
}

struct PermissionSnapshot {
    scopes: Scopes,
    pver: i64,
}

/// Logins, registrations and session lifecycle.
pub struct AuthService {
    users: Arc<dyn UserRepository>,
    sessions: Arc<SessionManager>,
    permissions: Arc<PermissionEngine>,
    tokens: Arc<TokenService>,
    revocation: Arc<RevocationCache>,
    session_ttl: Duration,
    store_timeout: Duration,
}

impl AuthService {
    /// Wire the service.
    #[must_use]
    pub fn new(
        users: Arc<dyn UserRepository>,
        sessions: Arc<SessionManager>,
        permissions: Arc<PermissionEngine>,
        tokens: Arc<TokenService>,
        revocation: Arc<RevocationCache>,
        session_ttl: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            users,
            sessions,
            permissions,
            tokens,
            revocation,
            session_ttl,
            store_timeout,
        }
    }

    /// Check credentials, start a session and mint an access token.
    ///
    /// No session is created unless the credentials are valid and the
    /// permission snapshot could be read.
    pub async fn login(
        &self,
        request: &LoginRequest,
        client: &ClientInfo,
    ) -> Result<LoginResponse, AuthError> {
        let user = with_deadline(
            self.store_timeout,
            self.users.find_by_username(&request.username),
        )
        .await?;

        // unknown users pay for a verification too
        let hash = match &user {
            Some(u) => u.password_hash.as_str(),
            None => users::dummy_password_hash(),
        };
        let password_ok = verify_password_blocking(&request.password, hash).await?;

        let Some(user) = user else {
            return Err(login_failed(client, "unknown user"));
        };
        if !password_ok {
            return Err(login_failed(client, "wrong password"));
        }
        if !user.active {
            return Err(login_failed(client, "inactive user"));
        }

        let user_id = user.id.to_string();
        let snapshot = self.snapshot(&user_id).await?;
        let session = self
            .sessions
            .create(
                &user_id,
                client.user_agent.as_deref(),
                client.ip,
                self.session_ttl,
            )
            .await?;
        let credential = session.credential();
        let sid = credential.id.to_string();
        let issued = match self.sign(&user_id, &sid, snapshot) {
            Ok(issued) => issued,
            Err(e) => {
                if let Err(revoke) = self.sessions.revoke(credential.id).await {
                    warn!(session_id = %sid, error = %revoke, "Failed to revoke unused session");
                }
                return Err(e);
            }
        };

        audit::emit(&AuditEvent::login_succeeded(&user_id, &sid).with_ip(client.ip));
        info!(user_id = %user_id, "User logged in");
        Ok(LoginResponse {
            tokens: TokenPair::new(issued, &credential),
            user: UserProfile::from(&user),
        })
    }

    /// Create an account.
    pub async fn register(&self, request: &RegisterRequest) -> Result<UserProfile, AuthError> {
        let username = request.username.trim();
        if username.is_empty() {
            return Err(AuthError::InvalidRequest("username is required".into()));
        }
        if request.password.is_empty() {
            return Err(AuthError::InvalidRequest("password is required".into()));
        }
        let email = request.email.trim();
        if !email.is_empty() && !email.contains('@') {
            return Err(AuthError::InvalidRequest("email is malformed".into()));
        }

        if !email.is_empty()
            && with_deadline(self.store_timeout, self.users.find_by_email(email))
                .await?
                .is_some()
        {
            return Err(AuthError::EmailExists);
        }
        if with_deadline(self.store_timeout, self.users.find_by_username(username))
            .await?
            .is_some()
        {
            return Err(AuthError::UsernameExists);
        }

        let password = request.password.clone();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .map_err(|e| AuthError::Internal(e.to_string()))?;

        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            first_name: request.first_name.trim().to_string(),
            last_name: request.last_name.trim().to_string(),
            password_hash,
            active: true,
            created_at: Utc::now(),
        };

        match with_deadline(self.store_timeout, self.users.create(user.clone())).await {
            Ok(()) => {}
            // lost a race against a concurrent registration
            Err(StoreError::Conflict(_)) => return Err(AuthError::UsernameExists),
            Err(e) => return Err(e.into()),
        }

        audit::emit(&AuditEvent::user_registered(&user.id.to_string()));
        Ok(UserProfile::from(&user))
    }

    /// Rotate the session secret and mint a fresh access token.
    ///
    /// A replayed secret revokes the whole session; the session id is also
    /// recorded in the revocation cache so outstanding access tokens stop
    /// working before they expire.
    pub async fn refresh(&self, credential: &SessionCredential) -> Result<TokenPair, AuthError> {
        let rotated = match self
            .sessions
            .rotate(credential.id, &credential.secret, self.session_ttl)
            .await
        {
            Ok(rotated) => rotated,
            Err(SessionError::ReplayDetected) => {
                self.record_revocation(&credential.id.to_string()).await;
                return Err(AuthError::InvalidSession);
            }
            Err(e) => return Err(e.into()),
        };

        let next = rotated.credential();
        let issued = self
            .mint(&rotated.session.user_id, &next.id.to_string())
            .await?;
        Ok(TokenPair::new(issued, &next))
    }

    /// End a session. The caller must hold its current secret.
    pub async fn logout(&self, credential: &SessionCredential) -> Result<(), AuthError> {
        self.sessions
            .validate(credential.id, &credential.secret)
            .await?;
        self.sessions.revoke(credential.id).await?;
        self.record_revocation(&credential.id.to_string()).await;
        Ok(())
    }

    /// Whether the session behind `claims` has been revoked, with the
    /// configured failure policy applied.
    pub async fn is_token_revoked(&self, claims: &AccessTokenClaims) -> Result<bool, AuthError> {
        Ok(self.revocation.is_session_revoked(&claims.sid).await?)
    }

    /// Public profile of `user_id`.
    pub async fn profile(&self, user_id: &str) -> Result<UserProfile, AuthError> {
        let id = Uuid::parse_str(user_id).map_err(|_| AuthError::UserNotFound)?;
        let user = with_deadline(self.store_timeout, self.users.find_by_id(id))
            .await?
            .ok_or(AuthError::UserNotFound)?;
        Ok(UserProfile::from(&user))
    }

    /// Revoke every session of `user_id` and record each one in the
    /// revocation cache. Returns the number revoked.
    pub async fn revoke_user(&self, user_id: &str) -> Result<usize, AuthError> {
        let revoked = self.sessions.revoke_user(user_id).await?;
        for id in &revoked {
            self.record_revocation(&id.to_string()).await;
        }
        Ok(revoked.len())
    }

    /// Mint an access token for `user_id` from a fresh permission snapshot.
    pub async fn mint(&self, user_id: &str, sid: &str) -> Result<IssuedToken, AuthError> {
        let snapshot = self.snapshot(user_id).await?;
        self.sign(user_id, sid, snapshot)
    }

    async fn snapshot(&self, user_id: &str) -> Result<PermissionSnapshot, AuthError> {
        let scopes = self.permissions.build_scopes(user_id).await?;
        let pver = match self.permissions.permission_version(user_id).await {
            Ok(v) => v,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Permission version unavailable, using 1");
                1
            }
        };
        Ok(PermissionSnapshot { scopes, pver })
    }

    fn sign(
        &self,
        user_id: &str,
        sid: &str,
        snapshot: PermissionSnapshot,
    ) -> Result<IssuedToken, AuthError> {
        let issued =
            self.tokens
                .generate_access_token(user_id, sid, snapshot.scopes, snapshot.pver)?;
        audit::emit(&AuditEvent::token_issued(user_id, sid));
        Ok(issued)
    }

    async fn record_revocation(&self, sid: &str) {
        // outstanding access tokens expire on their own after this
        let ttl = self.tokens.access_ttl();
        if let Err(e) = self.revocation.revoke_session(sid, ttl).await {
            warn!(session_id = %sid, error = %e, "Failed to record session revocation");
        }
    }
}

fn login_failed(client: &ClientInfo, reason: &str) -> AuthError {
    audit::emit(&AuditEvent::login_failed(reason).with_ip(client.ip));
    AuthError::InvalidCredentials
}

async fn verify_password_blocking(password: &str, hash: &str) -> Result<bool, AuthError> {
    let password = password.to_string();
    let hash = hash.to_string();
    tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(|e| AuthError::Internal(e.to_string()))
}
