//! Refresh sessions with rotating secrets and replay detection.
//!
//! ```text
//! Created ──▶ Active ──rotate──▶ Active (new secret, old hash superseded)
//!                │
//!                └──revoke / replay──▶ Revoked (terminal)
//! ```
//!
//! A client holds `"<session id>:<secret>"`. The store only ever sees the
//! SHA-256 of the secret. Presenting a secret that was already rotated away
//! from means the credential was copied: the session is revoked and the call
//! fails with [`SessionError::ReplayDetected`].

mod store;

pub use store::{InMemorySessionStore, Session, SessionStore};

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use subtle::{Choice, ConstantTimeEq};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::{self, AuditEvent};
use crate::error::{StoreError, with_deadline};

/// Default session lifetime.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Superseded hashes kept per session. Older ones are dropped first.
const SUPERSEDED_HISTORY: usize = 64;

/// Session operation failures.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Unknown, expired or revoked session.
    #[error("invalid session")]
    InvalidSession,

    /// The secret does not match.
    #[error("invalid session secret")]
    InvalidSecret,

    /// A superseded secret was presented. The session has been revoked.
    #[error("session secret replay detected")]
    ReplayDetected,

    /// A concurrent rotation won.
    #[error("concurrent session update")]
    Conflict,

    /// The session store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The `"<session id>:<secret>"` pair held by a client.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredential {
    /// Session id.
    pub id: Uuid,
    /// Bearer secret.
    pub secret: String,
}

impl SessionCredential {
    /// Parse `"<uuid>:<secret>"`. Returns `None` on any malformation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let (id, secret) = raw.split_once(':')?;
        if secret.is_empty() {
            return None;
        }
        Some(Self {
            id: Uuid::parse_str(id).ok()?,
            secret: secret.to_string(),
        })
    }

    /// Wire form.
    #[must_use]
    pub fn encode(&self) -> String {
        format!("{}:{}", self.id, self.secret)
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A session together with the plaintext secret, handed to the client once.
#[derive(Debug, Clone)]
pub struct NewSession {
    /// Stored session row.
    pub session: Session,
    /// Plaintext secret. Not stored anywhere.
    pub secret: String,
}

impl NewSession {
    /// Credential to give to the client.
    #[must_use]
    pub fn credential(&self) -> SessionCredential {
        SessionCredential {
            id: self.session.id,
            secret: self.secret.clone(),
        }
    }
}

/// Hex SHA-256 of a secret.
#[must_use]
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

enum SecretMatch {
    Current,
    Superseded,
    None,
}

/// Compare against every stored hash without short-circuiting.
fn match_secret(session: &Session, secret: &str) -> SecretMatch {
    let presented = hash_secret(secret);
    let presented = presented.as_bytes();

    let current: bool = presented.ct_eq(session.secret_hash.as_bytes()).into();
    let superseded: bool = session
        .superseded_hashes
        .iter()
        .fold(Choice::from(0), |acc, old| acc | presented.ct_eq(old.as_bytes()))
        .into();

    if current {
        SecretMatch::Current
    } else if superseded {
        SecretMatch::Superseded
    } else {
        SecretMatch::None
    }
}

/// Creates, validates, rotates and revokes sessions.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    store_timeout: Duration,
}

impl SessionManager {
    /// Create a manager. Every store call is bounded by `store_timeout`.
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    /// Underlying store (for the reaper).
    #[must_use]
    pub fn store(&self) -> Arc<dyn SessionStore> {
        Arc::clone(&self.store)
    }

    /// Start a session for `user_id`.
    pub async fn create(
        &self,
        user_id: &str,
        user_agent: Option<&str>,
        ip: Option<IpAddr>,
        ttl: Duration,
    ) -> Result<NewSession, SessionError> {
        let secret = generate_secret();
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            secret_hash: hash_secret(&secret),
            superseded_hashes: Vec::new(),
            user_agent: user_agent.map(str::to_string),
            ip,
            created_at: now,
            expires_at: expiry_after(now, ttl),
            rotated_at: None,
            revoked_at: None,
            version: 0,
        };

        with_deadline(self.store_timeout, self.store.insert(session.clone())).await?;

        audit::emit(&AuditEvent::session_created(user_id, &session.id.to_string()).with_ip(ip));
        Ok(NewSession { session, secret })
    }

    /// Check `secret` against session `id`.
    pub async fn validate(&self, id: Uuid, secret: &str) -> Result<Session, SessionError> {
        self.load_checked(id, secret).await
    }

    /// Replace the secret of session `id` and extend its expiry by `ttl`.
    ///
    /// Of two concurrent rotations presenting the same secret, exactly one
    /// succeeds. The other fails with [`SessionError::Conflict`] or, if it
    /// reads after the winner committed, [`SessionError::ReplayDetected`].
    pub async fn rotate(
        &self,
        id: Uuid,
        old_secret: &str,
        ttl: Duration,
    ) -> Result<NewSession, SessionError> {
        let current = self.load_checked(id, old_secret).await?;

        let secret = generate_secret();
        let now = Utc::now();
        let mut next = current.clone();
        let old_hash = std::mem::replace(&mut next.secret_hash, hash_secret(&secret));
        next.superseded_hashes.push(old_hash);
        if next.superseded_hashes.len() > SUPERSEDED_HISTORY {
            let excess = next.superseded_hashes.len() - SUPERSEDED_HISTORY;
            next.superseded_hashes.drain(..excess);
        }
        next.expires_at = expiry_after(now, ttl);
        next.rotated_at = Some(now);
        next.version = current.version + 1;

        let swapped = with_deadline(
            self.store_timeout,
            self.store.compare_and_swap(current.version, next.clone()),
        )
        .await?;
        if !swapped {
            debug!(session_id = %id, "Lost session rotation race");
            return Err(SessionError::Conflict);
        }

        audit::emit(&AuditEvent::session_rotated(&next.user_id, &id.to_string()));
        Ok(NewSession {
            session: next,
            secret,
        })
    }

    /// Revoke session `id`. Returns `false` if it was unknown or already revoked.
    pub async fn revoke(&self, id: Uuid) -> Result<bool, SessionError> {
        let revoked =
            with_deadline(self.store_timeout, self.store.revoke(id, Utc::now())).await?;
        if revoked {
            audit::emit(&AuditEvent::session_revoked(&id.to_string(), "revoked"));
        }
        Ok(revoked)
    }

    /// Revoke every live session of `user_id`. Returns the revoked ids.
    pub async fn revoke_user(&self, user_id: &str) -> Result<Vec<Uuid>, SessionError> {
        let revoked =
            with_deadline(self.store_timeout, self.store.revoke_user(user_id, Utc::now())).await?;
        for id in &revoked {
            audit::emit(&AuditEvent::session_revoked(&id.to_string(), "admin"));
        }
        Ok(revoked)
    }

    async fn load_checked(&self, id: Uuid, secret: &str) -> Result<Session, SessionError> {
        let session = with_deadline(self.store_timeout, self.store.get(id))
            .await?
            .ok_or(SessionError::InvalidSession)?;

        if session.is_revoked() || session.is_expired_at(Utc::now()) {
            return Err(SessionError::InvalidSession);
        }

        match match_secret(&session, secret) {
            SecretMatch::Current => Ok(session),
            SecretMatch::None => Err(SessionError::InvalidSecret),
            SecretMatch::Superseded => {
                warn!(session_id = %id, user_id = %session.user_id, "Superseded session secret presented");
                audit::emit(&AuditEvent::replay_detected(&session.user_id, &id.to_string()));
                match with_deadline(self.store_timeout, self.store.revoke(id, Utc::now())).await {
                    Ok(_) => {
                        audit::emit(&AuditEvent::session_revoked(&id.to_string(), "replay"));
                    }
                    Err(e) => {
                        warn!(session_id = %id, error = %e, "Failed to revoke replayed session");
                    }
                }
                Err(SessionError::ReplayDetected)
            }
        }
    }
}
