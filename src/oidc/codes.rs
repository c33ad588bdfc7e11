//! Authorization code persistence with single-use redemption.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;

/// An issued authorization code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationCode {
    /// Opaque code value.
    pub code: String,
    /// Client the code was issued to.
    pub client_id: String,
    /// Authenticated user.
    pub user_id: String,
    /// Redirect URI used at issuance. Must match at redemption.
    pub redirect_uri: String,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// PKCE challenge, when the client sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    /// PKCE method, when a challenge is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_method: Option<String>,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
    /// Set once on redemption.
    pub used: bool,
}

impl AuthorizationCode {
    /// Whether the code is past its expiry.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Outcome of a redemption attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redemption {
    /// The code was live and is now used. Carries the record as it was.
    Redeemed(AuthorizationCode),
    /// No such code.
    NotFound,
    /// Already redeemed.
    AlreadyUsed,
    /// Past its expiry.
    Expired,
}

/// Authorization code persistence.
///
/// [`redeem`](CodeStore::redeem) must flip `used` atomically: of any number of
/// concurrent redemptions of one code, at most one returns
/// [`Redemption::Redeemed`].
#[async_trait::async_trait]
pub trait CodeStore: Send + Sync + 'static {
    /// Persist a new code.
    async fn insert(&self, code: AuthorizationCode) -> Result<(), StoreError>;

    /// Mark a code used if it is live.
    async fn redeem(&self, code: &str, now: DateTime<Utc>) -> Result<Redemption, StoreError>;

    /// Drop expired codes.
    async fn reap_expired(&self, now: DateTime<Utc>) -> usize;
}

/// In-memory code store.
#[derive(Debug, Default)]
pub struct InMemoryCodeStore {
    codes: DashMap<String, AuthorizationCode>,
}

impl InMemoryCodeStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored codes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[async_trait::async_trait]
impl CodeStore for InMemoryCodeStore {
    async fn insert(&self, code: AuthorizationCode) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;

        match self.codes.entry(code.code.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict("authorization code collision".into())),
            Entry::Vacant(slot) => {
                slot.insert(code);
                Ok(())
            }
        }
    }

    async fn redeem(&self, code: &str, now: DateTime<Utc>) -> Result<Redemption, StoreError> {
        let Some(mut row) = self.codes.get_mut(code) else {
            return Ok(Redemption::NotFound);
        };
        if row.used {
            return Ok(Redemption::AlreadyUsed);
        }
        if row.is_expired_at(now) {
            return Ok(Redemption::Expired);
        }
        let snapshot = row.clone();
        row.used = true;
        Ok(Redemption::Redeemed(snapshot))
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.codes.len();
        self.codes.retain(|_, c| !c.is_expired_at(now));
        let reaped = before.saturating_sub(self.codes.len());
        if reaped > 0 {
            debug!(count = reaped, "Reaped expired authorization codes");
        }
        reaped
    }
}
