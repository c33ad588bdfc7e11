//! Session persistence.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;

/// A refresh session. Only hashes of bearer secrets are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session id.
    pub id: Uuid,
    /// Owner.
    pub user_id: String,
    /// Hex SHA-256 of the current secret.
    pub secret_hash: String,
    /// Hashes of secrets already rotated away from, oldest first.
    #[serde(default)]
    pub superseded_hashes: Vec<String>,
    /// Client user agent at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Client address at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time. Extended on rotation.
    pub expires_at: DateTime<Utc>,
    /// Time of the last rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_at: Option<DateTime<Utc>>,
    /// Time of revocation. A revoked session never validates again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    /// Row version for optimistic updates.
    pub version: u64,
}

impl Session {
    /// Whether `now` is past the expiry.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the session has been revoked.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// Session persistence.
///
/// Implementations must make [`compare_and_swap`](SessionStore::compare_and_swap)
/// atomic per session row: of two concurrent swaps against the same version,
/// exactly one succeeds.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Insert a new session.
    async fn insert(&self, session: Session) -> Result<(), StoreError>;

    /// Fetch a session by id, including revoked and expired ones.
    async fn get(&self, id: Uuid) -> Result<Option<Session>, StoreError>;

    /// Replace the row iff its stored version equals `expected_version`.
    ///
    /// Returns `false` when the row is missing or the version moved.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        session: Session,
    ) -> Result<bool, StoreError>;

    /// Mark a session revoked. Returns `false` if it does not exist or was
    /// already revoked.
    async fn revoke(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Revoke every live session of a user. Returns the ids revoked.
    async fn revoke_user(&self, user_id: &str, at: DateTime<Utc>)
    -> Result<Vec<Uuid>, StoreError>;

    /// Drop sessions expired before `now`. Called by the background reaper.
    async fn reap_expired(&self, now: DateTime<Utc>) -> usize;
}

/// In-memory session store backed by a `DashMap`.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<Uuid, Session>,
}

impl InMemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: Session) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;

        match self.sessions.entry(session.id) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "session {} already exists",
                session.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(&id).map(|s| s.clone()))
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        session: Session,
    ) -> Result<bool, StoreError> {
        // The shard write lock is held for the whole check-and-replace.
        let Some(mut row) = self.sessions.get_mut(&session.id) else {
            return Ok(false);
        };
        if row.version != expected_version {
            return Ok(false);
        }
        *row = session;
        Ok(true)
    }

    async fn revoke(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let Some(mut row) = self.sessions.get_mut(&id) else {
            return Ok(false);
        };
        if row.revoked_at.is_some() {
            return Ok(false);
        }
        row.revoked_at = Some(at);
        row.version += 1;
        Ok(true)
    }

    async fn revoke_user(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut revoked = Vec::new();
        for mut row in self.sessions.iter_mut() {
            if row.user_id == user_id && row.revoked_at.is_none() {
                row.revoked_at = Some(at);
                row.version += 1;
                revoked.push(row.id);
            }
        }
        Ok(revoked)
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired_at(now));
        let reaped = before.saturating_sub(self.sessions.len());
        if reaped > 0 {
            debug!(count = reaped, "Reaped expired sessions");
        }
        reaped
    }
}
