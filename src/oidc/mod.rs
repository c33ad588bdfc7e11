//! OAuth2 / OIDC authorization-code grant with PKCE.
//!
//! ```text
//! GET /authorize ──▶ AuthorizationService::authorize ──▶ code (10 min, unused)
//! POST /token    ──▶ AuthorizationService::redeem    ──▶ code (used) ──▶ access token
//! ```
//!
//! Every validation failure is a distinct [`AuthorizeError`] / [`RedeemError`]
//! variant with a stable OAuth error code, so the HTTP layer maps them 1:1.

mod client;
mod codes;
pub mod discovery;
pub mod pkce;

pub use client::{CachedClientRegistry, Client, ClientRegistry, InMemoryClientRegistry};
pub use codes::{AuthorizationCode, CodeStore, InMemoryCodeStore, Redemption};
pub use discovery::DiscoveryDocument;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::audit::{self, AuditEvent};
use crate::error::{StoreError, with_deadline};

/// Default authorization code lifetime.
pub const DEFAULT_CODE_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// Query parameters of an authorization request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizeRequest {
    /// Must be `code`.
    pub response_type: String,
    /// Requesting client.
    pub client_id: String,
    /// Exact registered redirect URI.
    pub redirect_uri: String,
    /// Space-delimited scopes.
    pub scope: String,
    /// Opaque client state, echoed back.
    pub state: String,
    /// PKCE challenge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    /// PKCE method.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
}

impl AuthorizeRequest {
    /// First missing required parameter, if any.
    #[must_use]
    pub fn missing_field(&self) -> Option<&'static str> {
        [
            ("response_type", &self.response_type),
            ("client_id", &self.client_id),
            ("redirect_uri", &self.redirect_uri),
            ("scope", &self.scope),
        ]
        .into_iter()
        .find(|(_, v)| v.is_empty())
        .map(|(name, _)| name)
    }

    fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope.split_whitespace()
    }
}

/// Successful authorization: redirect the user agent back with these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeResponse {
    /// Issued code.
    pub code: String,
    /// Echoed state.
    pub state: String,
}

/// Authorization request failures.
#[derive(Debug, Error)]
pub enum AuthorizeError {
    /// `response_type` is not `code`.
    #[error("unsupported response type")]
    UnsupportedResponseType,

    /// No client with this id.
    #[error("unknown client")]
    InvalidClientId,

    /// The client is deactivated.
    #[error("client is not active")]
    ClientNotActive,

    /// `redirect_uri` is not registered for the client.
    #[error("redirect URI not registered")]
    InvalidRedirectUri,

    /// A requested scope is not allowed for the client.
    #[error("scope not allowed")]
    InvalidScope,

    /// `code_challenge_method` is not `S256`.
    #[error("unsupported code challenge method")]
    InvalidCodeChallengeMethod,

    /// Challenge is not 43 base64url characters.
    #[error("malformed code challenge")]
    InvalidCodeChallenge,

    /// Registry or code store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthorizeError {
    /// OAuth error code for the response body.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::InvalidClientId => "invalid_client_id",
            Self::ClientNotActive => "client_not_active",
            Self::InvalidRedirectUri => "invalid_redirect_uri",
            Self::InvalidScope => "invalid_scope",
            Self::InvalidCodeChallengeMethod => "unsupported_code_challenge_method",
            Self::InvalidCodeChallenge => "invalid_code_challenge",
            Self::Store(_) => "server_error",
        }
    }

    /// HTTP status.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Form parameters of a token request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenRequest {
    /// Must be `authorization_code`.
    pub grant_type: String,
    /// Code from the redirect.
    pub code: String,
    /// Same redirect URI as the authorization request.
    pub redirect_uri: String,
    /// Client the code was issued to.
    pub client_id: String,
    /// PKCE verifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
}

/// Code exchange failures.
#[derive(Debug, Error)]
pub enum RedeemError {
    /// `grant_type` is not `authorization_code`.
    #[error("unsupported grant type")]
    UnsupportedGrantType,

    /// A required parameter is missing.
    #[error("missing parameter: {0}")]
    InvalidRequest(&'static str),

    /// Code unknown, used, expired, or bound to another client, redirect or verifier.
    #[error("invalid grant: {0}")]
    InvalidGrant(&'static str),

    /// Code store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RedeemError {
    /// OAuth error code for the response body.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::Store(_) => "server_error",
        }
    }

    /// HTTP status.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

fn generate_code() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Issues and redeems authorization codes.
pub struct AuthorizationService {
    clients: Arc<dyn ClientRegistry>,
    codes: Arc<dyn CodeStore>,
    code_lifetime: Duration,
    store_timeout: Duration,
}

impl AuthorizationService {
    /// Create a service.
    #[must_use]
    pub fn new(
        clients: Arc<dyn ClientRegistry>,
        codes: Arc<dyn CodeStore>,
        code_lifetime: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            clients,
            codes,
            code_lifetime,
            store_timeout,
        }
    }

    /// Underlying code store (for the reaper).
    #[must_use]
    pub fn codes(&self) -> Arc<dyn CodeStore> {
        Arc::clone(&self.codes)
    }

    /// Validate `request` for the logged-in `user_id` and issue a code.
    ///
    /// Checks run in order: response type, client, client active, redirect
    /// URI, scopes, PKCE.
    pub async fn authorize(
        &self,
        request: &AuthorizeRequest,
        user_id: &str,
    ) -> Result<AuthorizeResponse, AuthorizeError> {
        if request.response_type != "code" {
            return Err(AuthorizeError::UnsupportedResponseType);
        }

        let client = with_deadline(
            self.store_timeout,
            self.clients.find_by_client_id(&request.client_id),
        )
        .await?
        .ok_or(AuthorizeError::InvalidClientId)?;

        if !client.active {
            return Err(AuthorizeError::ClientNotActive);
        }
        if !client.allows_redirect(&request.redirect_uri) {
            return Err(AuthorizeError::InvalidRedirectUri);
        }
        if !client.allows_scopes(request.scopes()) {
            return Err(AuthorizeError::InvalidScope);
        }

        let (code_challenge, challenge_method) = match request.code_challenge.as_deref() {
            None | Some("") => (None, None),
            Some(challenge) => {
                if request.code_challenge_method.as_deref() != Some(pkce::METHOD_S256) {
                    return Err(AuthorizeError::InvalidCodeChallengeMethod);
                }
                if !pkce::is_valid_challenge(challenge) {
                    return Err(AuthorizeError::InvalidCodeChallenge);
                }
                (
                    Some(challenge.to_string()),
                    Some(pkce::METHOD_S256.to_string()),
                )
            }
        };

        let expires_at = chrono::Duration::from_std(self.code_lifetime)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .ok_or_else(|| StoreError::Unavailable("code lifetime out of range".into()))?;

        let record = AuthorizationCode {
            code: generate_code(),
            client_id: client.client_id.clone(),
            user_id: user_id.to_string(),
            redirect_uri: request.redirect_uri.clone(),
            scopes: request.scopes().map(str::to_string).collect(),
            code_challenge,
            challenge_method,
            expires_at,
            used: false,
        };
        let code = record.code.clone();
        with_deadline(self.store_timeout, self.codes.insert(record)).await?;

        audit::emit(&AuditEvent::code_issued(user_id, &client.client_id));
        Ok(AuthorizeResponse {
            code,
            state: request.state.clone(),
        })
    }

    /// Exchange a code exactly once. Returns the record as issued.
    ///
    /// The code is consumed before the client, redirect and verifier checks,
    /// so a failed exchange still burns it.
    pub async fn redeem(&self, request: &TokenRequest) -> Result<AuthorizationCode, RedeemError> {
        if request.grant_type != "authorization_code" {
            return Err(RedeemError::UnsupportedGrantType);
        }
        if request.code.is_empty() {
            return Err(RedeemError::InvalidRequest("code"));
        }
        if request.client_id.is_empty() {
            return Err(RedeemError::InvalidRequest("client_id"));
        }
        if request.redirect_uri.is_empty() {
            return Err(RedeemError::InvalidRequest("redirect_uri"));
        }

        let outcome = with_deadline(
            self.store_timeout,
            self.codes.redeem(&request.code, Utc::now()),
        )
        .await?;

        let code = match outcome {
            Redemption::Redeemed(code) => code,
            Redemption::NotFound => return Err(self.reject(request, "unknown code")),
            Redemption::AlreadyUsed => return Err(self.reject(request, "code already used")),
            Redemption::Expired => return Err(self.reject(request, "code expired")),
        };

        if code.client_id != request.client_id {
            return Err(self.reject(request, "client mismatch"));
        }
        if code.redirect_uri != request.redirect_uri {
            return Err(self.reject(request, "redirect_uri mismatch"));
        }
        if let Some(challenge) = code.code_challenge.as_deref() {
            let verified = request
                .code_verifier
                .as_deref()
                .is_some_and(|v| pkce::verify(v, challenge));
            if !verified {
                return Err(self.reject(request, "code_verifier mismatch"));
            }
        }

        debug!(client_id = %code.client_id, "Authorization code redeemed");
        audit::emit(&AuditEvent::code_redeemed(&code.user_id, &code.client_id));
        Ok(code)
    }

    fn reject(&self, request: &TokenRequest, reason: &'static str) -> RedeemError {
        warn!(client_id = %request.client_id, reason, "Authorization code rejected");
        audit::emit(&AuditEvent::code_rejected(&request.client_id, reason));
        RedeemError::InvalidGrant(reason)
    }
}
