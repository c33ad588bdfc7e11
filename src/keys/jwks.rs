//! JSON Web Key Set export (RFC 7517).

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rsa::RsaPublicKey;
use rsa::traits::PublicKeyParts;
use serde::{Deserialize, Serialize};

/// A single RSA public key in JWK form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type, always `"RSA"`.
    pub kty: String,
    /// Intended use, always `"sig"`.
    #[serde(rename = "use")]
    pub key_use: String,
    /// Signing algorithm, always `"RS256"`.
    pub alg: String,
    /// Key id matching the `kid` header of tokens signed with this key.
    pub kid: String,
    /// Modulus, base64url without padding.
    pub n: String,
    /// Public exponent, base64url without padding.
    pub e: String,
}

impl Jwk {
    /// Build the JWK for an RSA public key.
    #[must_use]
    pub fn from_rsa(kid: &str, key: &RsaPublicKey) -> Self {
        Self {
            kty: "RSA".to_string(),
            key_use: "sig".to_string(),
            alg: "RS256".to_string(),
            kid: kid.to_string(),
            n: URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
        }
    }
}

/// The published key set: `{"keys": [...]}` and nothing else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    /// Public keys, one per loaded kid.
    pub keys: Vec<Jwk>,
}

impl Jwks {
    /// Look up a key by kid.
    #[must_use]
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}
