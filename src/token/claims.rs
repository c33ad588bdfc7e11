//! Access token claims.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Scope key (`"<service>"` or `"<service>:<resource>"`) to permission bitmask.
pub type Scopes = BTreeMap<String, u64>;

/// Claims carried by every access token.
///
/// `scopes` is the only permission representation. Tokens minted by older
/// issuers that used the claim name `permissions` decode into the same field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// User id.
    pub sub: String,
    /// Session id the token was minted for.
    pub sid: String,
    /// Issuer.
    #[serde(default)]
    pub iss: String,
    /// Service codes allowed to accept this token.
    #[serde(default, deserialize_with = "one_or_many")]
    pub aud: Vec<String>,
    /// Issued-at (Unix seconds).
    #[serde(default)]
    pub iat: i64,
    /// Expiry (Unix seconds). Zero means unset and never validates.
    #[serde(default)]
    pub exp: i64,
    /// Permission bitmasks per scope key.
    #[serde(default, alias = "permissions")]
    pub scopes: Scopes,
    /// Permission version at mint time.
    #[serde(default)]
    pub pver: i64,
}

/// `aud` may be a single string or an array (RFC 7519 §4.1.3).
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}
