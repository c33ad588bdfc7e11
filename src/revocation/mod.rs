//! Revocation cache: fast "is this session revoked" checks over a TTL store.
//!
//! The cache is auxiliary to the session store. When it cannot answer (the
//! backend is down or slow) the lookup reports [`RevocationStatus::Unknown`]
//! and the configured [`RevocationPolicy`] decides what happens next.

mod kv;

pub use kv::{InMemoryKvStore, KvStore};

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{StoreError, with_deadline};

const SESSION_PREFIX: &str = "session:revoked:";
const TOKEN_PREFIX: &str = "token:revoked:";

/// What to do when the cache cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationPolicy {
    /// Treat the credential as not revoked and log a warning.
    #[default]
    FailOpen,
    /// Reject the request.
    FailClosed,
}

/// Result of a single lookup, before the policy is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevocationStatus {
    /// An entry exists.
    Revoked,
    /// No entry exists.
    NotRevoked,
    /// The store failed or timed out after all retries.
    Unknown(StoreError),
}

/// Revocation check failures surfaced under [`RevocationPolicy::FailClosed`],
/// and write failures under either policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RevocationError {
    /// Backend unreachable.
    #[error("revocation store unavailable: {0}")]
    Unavailable(String),

    /// Backend did not answer in time.
    #[error("revocation store timed out")]
    Timeout,
}

impl From<StoreError> for RevocationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Timeout => Self::Timeout,
            StoreError::Unavailable(msg) | StoreError::Conflict(msg) => Self::Unavailable(msg),
        }
    }
}

/// Per-call timeout and retry settings.
#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    /// Deadline for one store call.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub attempts: usize,
    /// Initial backoff between attempts.
    pub backoff: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(200),
            attempts: 2,
            backoff: Duration::from_millis(20),
        }
    }
}

fn is_transient(e: &StoreError) -> bool {
    matches!(e, StoreError::Timeout | StoreError::Unavailable(_))
}

/// Session and token revocation lookups.
pub struct RevocationCache {
    kv: Arc<dyn KvStore>,
    policy: RevocationPolicy,
    retry: RetrySettings,
}

impl RevocationCache {
    /// Create a cache over `kv`.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, policy: RevocationPolicy, retry: RetrySettings) -> Self {
        Self { kv, policy, retry }
    }

    /// Configured failure policy.
    #[must_use]
    pub fn policy(&self) -> RevocationPolicy {
        self.policy
    }

    /// Underlying store (for the reaper).
    #[must_use]
    pub fn store(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.kv)
    }

    /// Raw lookup for a session id. An empty id is never revoked.
    pub async fn session_status(&self, sid: &str) -> RevocationStatus {
        if sid.is_empty() {
            return RevocationStatus::NotRevoked;
        }
        self.lookup(format!("{SESSION_PREFIX}{sid}")).await
    }

    /// Raw lookup for a token id. An empty id is never revoked.
    pub async fn token_status(&self, jti: &str) -> RevocationStatus {
        if jti.is_empty() {
            return RevocationStatus::NotRevoked;
        }
        self.lookup(format!("{TOKEN_PREFIX}{jti}")).await
    }

    /// Whether session `sid` is revoked, with the policy applied.
    pub async fn is_session_revoked(&self, sid: &str) -> Result<bool, RevocationError> {
        let status = self.session_status(sid).await;
        self.decide(sid, status)
    }

    /// Whether token `jti` is revoked, with the policy applied.
    pub async fn is_token_revoked(&self, jti: &str) -> Result<bool, RevocationError> {
        let status = self.token_status(jti).await;
        self.decide(jti, status)
    }

    /// Record session `sid` as revoked for `ttl`.
    pub async fn revoke_session(&self, sid: &str, ttl: Duration) -> Result<(), RevocationError> {
        self.write(format!("{SESSION_PREFIX}{sid}"), ttl).await
    }

    /// Record token `jti` as revoked for `ttl`.
    pub async fn revoke_token(&self, jti: &str, ttl: Duration) -> Result<(), RevocationError> {
        self.write(format!("{TOKEN_PREFIX}{jti}"), ttl).await
    }

    /// Apply the policy to a lookup result.
    pub fn decide(&self, id: &str, status: RevocationStatus) -> Result<bool, RevocationError> {
        match status {
            RevocationStatus::Revoked => Ok(true),
            RevocationStatus::NotRevoked => Ok(false),
            RevocationStatus::Unknown(e) => match self.policy {
                RevocationPolicy::FailOpen => {
                    warn!(id = %id, error = %e, "Revocation status unknown, failing open");
                    Ok(false)
                }
                RevocationPolicy::FailClosed => {
                    warn!(id = %id, error = %e, "Revocation status unknown, failing closed");
                    Err(e.into())
                }
            },
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.retry.backoff)
            .with_max_times(self.retry.attempts)
    }

    async fn lookup(&self, key: String) -> RevocationStatus {
        let kv = Arc::clone(&self.kv);
        let timeout = self.retry.timeout;
        let check = move || {
            let kv = Arc::clone(&kv);
            let key = key.clone();
            async move { with_deadline(timeout, kv.exists(&key)).await }
        };

        let result = check
            .retry(self.backoff())
            .when(is_transient)
            .notify(|e: &StoreError, after: Duration| {
                debug!(error = %e, retry_in = ?after, "Retrying revocation lookup");
            })
            .await;

        match result {
            Ok(true) => RevocationStatus::Revoked,
            Ok(false) => RevocationStatus::NotRevoked,
            Err(e) => RevocationStatus::Unknown(e),
        }
    }

    async fn write(&self, key: String, ttl: Duration) -> Result<(), RevocationError> {
        let kv = Arc::clone(&self.kv);
        let timeout = self.retry.timeout;
        let set = move || {
            let kv = Arc::clone(&kv);
            let key = key.clone();
            async move { with_deadline(timeout, kv.set(&key, "1", ttl)).await }
        };

        set.retry(self.backoff())
            .when(is_transient)
            .notify(|e: &StoreError, after: Duration| {
                debug!(error = %e, retry_in = ?after, "Retrying revocation write");
            })
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to record revocation");
                RevocationError::from(e)
            })
    }
}
