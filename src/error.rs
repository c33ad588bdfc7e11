//! Error types for startup, configuration and the server loop.
//!
//! Component errors (`KeyLoadError`, `SessionError`, `AuthorizeError`, ...)
//! live beside their components. This type covers the process-level failures
//! that stop the server from starting or keep it from serving.

use std::future::Future;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::keys::KeyLoadError;

/// Result type alias for idgate
pub type Result<T> = std::result::Result<T, Error>;

/// Process-level errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Signing key material could not be loaded
    #[error("Key material error: {0}")]
    Keys(#[from] KeyLoadError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Process exit code for this error.
    ///
    /// Configuration and key errors exit with `78` (`EX_CONFIG`) so init
    /// systems can tell a bad deploy from a crash.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Keys(_) => 78,
            Self::Io(_) => 74,
            _ => 1,
        }
    }
}

/// Failure of a persistence collaborator (user repository, session store,
/// role store, key-value cache).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend unreachable or returned an error.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The call did not finish within its deadline.
    #[error("store call timed out")]
    Timeout,

    /// A uniqueness or version constraint was violated.
    #[error("store conflict: {0}")]
    Conflict(String),
}

/// Run a persistence call with a deadline. Elapsed deadlines become
/// [`StoreError::Timeout`].
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> std::result::Result<T, StoreError>
where
    F: Future<Output = std::result::Result<T, StoreError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| StoreError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_and_key_errors_map_to_ex_config() {
        assert_eq!(Error::Config("bad".into()).exit_code(), 78);
        let keys = Error::Keys(KeyLoadError::DirectoryNotAccessible {
            path: "/nope".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        });
        assert_eq!(keys.exit_code(), 78);
        assert_eq!(Error::Internal("boom".into()).exit_code(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_call_times_out() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, StoreError>(1)
        };
        assert_eq!(
            with_deadline(Duration::from_millis(50), slow).await,
            Err(StoreError::Timeout)
        );
    }

    #[tokio::test]
    async fn fast_store_call_passes_through() {
        let fast = async { Err::<u8, _>(StoreError::Unavailable("down".into())) };
        assert_eq!(
            with_deadline(Duration::from_secs(1), fast).await,
            Err(StoreError::Unavailable("down".into()))
        );
    }
}
