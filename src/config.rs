//! Configuration management

use std::{path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::oidc::Client;
use crate::revocation::{RetrySettings, RevocationPolicy};
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files loaded before the `IDGATE_` overrides are read.
    /// Paths support ~ expansion. Variables already set are left alone.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Token and session configuration
    pub auth: AuthConfig,
    /// Revocation cache configuration
    pub revocation: RevocationConfig,
    /// Authorization-code flow configuration
    pub oidc: OidcConfig,
    /// Client registry configuration
    pub registry: RegistryConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // env files can carry IDGATE_ overrides, so they go first
        let env_files: Vec<String> = figment.extract_inner("env_files").unwrap_or_default();
        load_env_files(&env_files);

        // IDGATE_AUTH__ISSUER=... overrides auth.issuer
        figment = figment.merge(Env::prefixed("IDGATE_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.auth.issuer.trim().is_empty() {
            return Err(Error::Config("auth.issuer must not be empty".into()));
        }
        if self.auth.active_kid.trim().is_empty() {
            return Err(Error::Config("auth.active_kid must not be empty".into()));
        }
        if self.auth.access_token_ttl.is_zero() || self.auth.session_ttl.is_zero() {
            return Err(Error::Config("token and session lifetimes must be non-zero".into()));
        }
        if self.oidc.code_lifetime.is_zero() {
            return Err(Error::Config("oidc.code_lifetime must be non-zero".into()));
        }
        url::Url::parse(&self.oidc.base_url)
            .map_err(|e| Error::Config(format!("oidc.base_url is not a URL: {e}")))?;
        Ok(())
    }
}

/// Load environment files into the process environment.
/// Supports ~ expansion. Files that don't exist are silently skipped.
fn load_env_files(paths: &[String]) {
    for path_str in paths {
        let expanded = expand_home(path_str);
        let path = Path::new(&expanded);
        if path.exists() {
            match dotenvy::from_path(path) {
                Ok(()) => {
                    tracing::info!("Loaded env file: {expanded}");
                }
                Err(e) => {
                    tracing::warn!("Failed to load env file {expanded}: {e}");
                }
            }
        } else {
            tracing::debug!("Env file not found (skipped): {expanded}");
        }
    }
}

fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Interval of the expired-record reaper
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
    /// Deadline for every session/user/role store call
    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(60),
            store_timeout: Duration::from_secs(2),
        }
    }
}

/// Token and session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// `iss` of every issued token
    pub issuer: String,
    /// Directory holding `private-<kid>.pem` / `public-<kid>.pem` pairs
    pub keys_path: PathBuf,
    /// Kid of the signing key (without the `key-` prefix)
    pub active_kid: String,
    /// Access token lifetime
    #[serde(with = "humantime_serde")]
    pub access_token_ttl: Duration,
    /// Refresh session lifetime
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,
    /// Audience required by the admin endpoints. Empty accepts any.
    pub expected_audience: Vec<String>,
    /// Name of the session cookie
    pub session_cookie: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: "idgate".to_string(),
            keys_path: PathBuf::from("keys"),
            active_kid: "default".to_string(),
            access_token_ttl: crate::token::DEFAULT_ACCESS_TOKEN_TTL,
            session_ttl: crate::session::DEFAULT_SESSION_TTL,
            expected_audience: vec![crate::permission::SYSTEM_SERVICE_CODE.to_string()],
            session_cookie: "session".to_string(),
        }
    }
}

/// Revocation cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RevocationConfig {
    /// Behaviour when the cache cannot answer
    pub policy: RevocationPolicy,
    /// Deadline for one cache call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Retries after the first attempt
    pub retry_attempts: usize,
    /// Initial backoff between attempts
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        let retry = RetrySettings::default();
        Self {
            policy: RevocationPolicy::default(),
            timeout: retry.timeout,
            retry_attempts: retry.attempts,
            retry_backoff: retry.backoff,
        }
    }
}

impl RevocationConfig {
    /// Retry settings for the cache.
    #[must_use]
    pub fn retry(&self) -> RetrySettings {
        RetrySettings {
            timeout: self.timeout,
            attempts: self.retry_attempts,
            backoff: self.retry_backoff,
        }
    }
}

/// Authorization-code flow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcConfig {
    /// Public base URL used in the discovery document
    pub base_url: String,
    /// Scopes advertised by discovery
    pub scopes_supported: Vec<String>,
    /// Authorization code lifetime
    #[serde(with = "humantime_serde")]
    pub code_lifetime: Duration,
    /// Clients registered at startup
    pub clients: Vec<Client>,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:39500".to_string(),
            scopes_supported: vec![
                "openid".to_string(),
                "profile".to_string(),
                "email".to_string(),
            ],
            code_lifetime: crate::oidc::DEFAULT_CODE_LIFETIME,
            clients: Vec::new(),
        }
    }
}

/// Client registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How long resolved clients are cached
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "150ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "15m", "24h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();

        // "ms" before "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
