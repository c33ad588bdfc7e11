//! RS256 signing key store.
//!
//! A [`KeyStore`] is loaded once from a directory of PEM pairs:
//!
//! ```text
//! keys/
//!   private-2024a.pem   # PKCS#1 or PKCS#8 RSA private key
//!   public-2024a.pem    # SPKI or PKCS#1 RSA public key
//!   private-2025b.pem
//!   public-2025b.pem
//! ```
//!
//! Each pair is registered under the normalized kid `key-<kid>`, which is also
//! the `kid` written into token headers and published in the JWKS.
//!
//! # Rotation
//!
//! The store is immutable. Rotation builds a new store (optionally carrying
//! the previous store's keys via [`KeyStore::with_grace_keys`] so tokens signed
//! moments before the switch still verify) and swaps it in wholesale. Pruning a
//! retired key with [`KeyStore::without`] makes its tokens fail with
//! [`KeyError::UnknownKey`].

mod error;
mod jwks;

pub use error::{KeyError, KeyLoadError};
pub use jwks::{Jwk, Jwks};

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::RwLock;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey};
use rsa::pkcs8::der::pem;
use rsa::pkcs8::spki::SubjectPublicKeyInfoRef;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, PrivateKeyInfo};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

const KID_PREFIX: &str = "key-";
const PRIVATE_PREFIX: &str = "private-";
const PEM_SUFFIX: &str = ".pem";

/// Normalize a configured kid to its internal `key-<kid>` form.
#[must_use]
pub fn normalize_kid(kid: &str) -> String {
    if kid.starts_with(KID_PREFIX) {
        kid.to_string()
    } else {
        format!("{KID_PREFIX}{kid}")
    }
}

/// One RSA key pair. The private half never leaves this struct.
pub struct SigningKey {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    public: RsaPublicKey,
}

impl SigningKey {
    fn from_parts(
        kid: String,
        private: &RsaPrivateKey,
        public: RsaPublicKey,
    ) -> Result<Self, KeyLoadError> {
        if private.to_public_key() != public {
            return Err(KeyLoadError::KeyPairMismatch { kid });
        }

        let der = private
            .to_pkcs1_der()
            .map_err(|e| KeyLoadError::KeyMaterial {
                kid: kid.clone(),
                detail: e.to_string(),
            })?;
        let encoding = EncodingKey::from_rsa_der(der.as_bytes());

        let jwk = Jwk::from_rsa(&kid, &public);
        let decoding =
            DecodingKey::from_rsa_components(&jwk.n, &jwk.e).map_err(|e| {
                KeyLoadError::KeyMaterial {
                    kid: kid.clone(),
                    detail: e.to_string(),
                }
            })?;

        Ok(Self {
            kid,
            encoding,
            decoding,
            public,
        })
    }

    /// Normalized key id.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Public half as a JWK.
    #[must_use]
    pub fn jwk(&self) -> Jwk {
        Jwk::from_rsa(&self.kid, &self.public)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

/// Immutable set of signing keys with one active signer.
#[derive(Debug, Clone)]
pub struct KeyStore {
    active_kid: String,
    keys: BTreeMap<String, Arc<SigningKey>>,
}

impl KeyStore {
    /// Load every `private-<kid>.pem` / `public-<kid>.pem` pair in `path`.
    ///
    /// Files not matching `private-*.pem` are ignored. `active_kid` may be
    /// given with or without the `key-` prefix.
    pub fn load(path: impl AsRef<Path>, active_kid: &str) -> Result<Self, KeyLoadError> {
        let dir = path.as_ref();

        let meta = fs::metadata(dir).map_err(|source| KeyLoadError::DirectoryNotAccessible {
            path: dir.to_path_buf(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(KeyLoadError::NotADirectory {
                path: dir.to_path_buf(),
            });
        }

        let read_dir_failed = |source: io::Error| KeyLoadError::ReadDirFailed {
            path: dir.to_path_buf(),
            source,
        };

        let mut pairs = Vec::new();
        for entry in fs::read_dir(dir).map_err(read_dir_failed)? {
            let entry = entry.map_err(read_dir_failed)?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(kid) = name
                .strip_prefix(PRIVATE_PREFIX)
                .and_then(|rest| rest.strip_suffix(PEM_SUFFIX))
                .filter(|kid| !kid.is_empty())
            else {
                continue;
            };

            debug!(kid = %kid, "Loading key pair");
            pairs.push(load_pair(dir, kid)?);
        }

        let store = Self::from_keys(active_kid, pairs)?;
        info!(
            path = %dir.display(),
            active_kid = %store.active_kid,
            keys = store.keys.len(),
            "Signing keys loaded"
        );
        Ok(store)
    }

    /// Build a store from already-parsed key pairs.
    pub fn from_keys(
        active_kid: &str,
        keys: impl IntoIterator<Item = SigningKey>,
    ) -> Result<Self, KeyLoadError> {
        let keys: BTreeMap<String, Arc<SigningKey>> = keys
            .into_iter()
            .map(|k| (k.kid.clone(), Arc::new(k)))
            .collect();

        let active_kid = normalize_kid(active_kid);
        if !keys.contains_key(&active_kid) {
            return Err(KeyLoadError::ActiveKeyMissing { kid: active_kid });
        }

        Ok(Self { active_kid, keys })
    }

    /// Kid used for new signatures.
    #[must_use]
    pub fn active_kid(&self) -> &str {
        &self.active_kid
    }

    /// All loaded kids, sorted.
    pub fn kids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Whether `kid` (normalized form) is loaded.
    #[must_use]
    pub fn contains(&self, kid: &str) -> bool {
        self.keys.contains_key(kid)
    }

    /// Sign `claims` with the active key.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, KeyError> {
        self.sign_with(&self.active_kid, claims)
    }

    /// Sign `claims` with a specific loaded key.
    pub fn sign_with<T: Serialize>(&self, kid: &str, claims: &T) -> Result<String, KeyError> {
        let key = self
            .keys
            .get(kid)
            .ok_or_else(|| KeyError::UnknownKey(kid.to_string()))?;

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(key.kid.clone());
        Ok(jsonwebtoken::encode(&header, claims, &key.encoding)?)
    }

    /// Check the signature of `token` and decode its claims.
    ///
    /// Only the signature is checked. Expiry, issuer and audience are
    /// business rules applied by the token service.
    pub fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T, KeyError> {
        let header = jsonwebtoken::decode_header(token)?;
        let kid = header.kid.ok_or(KeyError::MissingKeyId)?;
        let key = self.keys.get(&kid).ok_or(KeyError::UnknownKey(kid))?;

        let data = jsonwebtoken::decode::<T>(token, &key.decoding, &signature_only())?;
        Ok(data.claims)
    }

    /// Public keys for every loaded kid.
    #[must_use]
    pub fn jwks(&self) -> Jwks {
        Jwks {
            keys: self.keys.values().map(|k| k.jwk()).collect(),
        }
    }

    /// Carry over keys from `previous` that this store does not have.
    ///
    /// The active kid stays this store's.
    #[must_use]
    pub fn with_grace_keys(mut self, previous: &KeyStore) -> Self {
        for (kid, key) in &previous.keys {
            self.keys
                .entry(kid.clone())
                .or_insert_with(|| Arc::clone(key));
        }
        self
    }

    /// A copy of this store without `kid`. The active key cannot be pruned.
    pub fn without(&self, kid: &str) -> Result<Self, KeyLoadError> {
        if kid == self.active_kid {
            return Err(KeyLoadError::ActiveKeyMissing {
                kid: kid.to_string(),
            });
        }
        let mut pruned = self.clone();
        pruned.keys.remove(kid);
        Ok(pruned)
    }
}

/// Shared, swappable reference to the current [`KeyStore`].
///
/// Readers clone the inner `Arc` and never hold the lock across signing or
/// verification.
#[derive(Debug)]
pub struct KeyHandle {
    current: RwLock<Arc<KeyStore>>,
}

impl KeyHandle {
    /// Wrap an initial store.
    #[must_use]
    pub fn new(store: KeyStore) -> Self {
        Self {
            current: RwLock::new(Arc::new(store)),
        }
    }

    /// Snapshot of the current store.
    #[must_use]
    pub fn current(&self) -> Arc<KeyStore> {
        Arc::clone(&self.current.read())
    }

    /// Replace the store wholesale. Returns the previous one.
    pub fn rotate(&self, next: KeyStore) -> Arc<KeyStore> {
        let next = Arc::new(next);
        info!(active_kid = %next.active_kid, keys = next.keys.len(), "Signing keys rotated");
        std::mem::replace(&mut *self.current.write(), next)
    }
}

fn signature_only() -> Validation {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    validation
}

fn load_pair(dir: &Path, kid: &str) -> Result<SigningKey, KeyLoadError> {
    let private_path = dir.join(format!("{PRIVATE_PREFIX}{kid}{PEM_SUFFIX}"));
    let public_path = dir.join(format!("public-{kid}{PEM_SUFFIX}"));

    let private_pem = fs::read(&private_path).map_err(|source| KeyLoadError::ReadPrivateKey {
        path: private_path.clone(),
        source,
    })?;
    let private = parse_private_key(&private_path, &private_pem)?;

    let public_pem = match fs::read(&public_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(KeyLoadError::MissingPublicKey {
                kid: kid.to_string(),
                path: public_path,
            });
        }
        Err(source) => {
            return Err(KeyLoadError::ReadPublicKey {
                path: public_path,
                source,
            });
        }
    };
    let public = parse_public_key(&public_path, &public_pem)?;

    SigningKey::from_parts(normalize_kid(kid), &private, public)
}

fn parse_private_key(path: &Path, pem_bytes: &[u8]) -> Result<RsaPrivateKey, KeyLoadError> {
    let (label, der) = pem::decode_vec(pem_bytes).map_err(|e| KeyLoadError::DecodePrivatePem {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    if let Ok(key) = RsaPrivateKey::from_pkcs1_der(&der) {
        return Ok(key);
    }
    if let Ok(key) = RsaPrivateKey::from_pkcs8_der(&der) {
        return Ok(key);
    }

    // A well-formed PKCS#8 or SEC1 container that is not RSA.
    if label == "EC PRIVATE KEY" || PrivateKeyInfo::try_from(der.as_slice()).is_ok() {
        return Err(KeyLoadError::PrivateKeyNotRsa {
            path: path.to_path_buf(),
        });
    }
    Err(KeyLoadError::ParsePrivateKey {
        path: path.to_path_buf(),
    })
}

fn parse_public_key(path: &Path, pem_bytes: &[u8]) -> Result<RsaPublicKey, KeyLoadError> {
    let (_label, der) = pem::decode_vec(pem_bytes).map_err(|e| KeyLoadError::DecodePublicPem {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    if let Ok(key) = RsaPublicKey::from_public_key_der(&der) {
        return Ok(key);
    }
    if let Ok(key) = RsaPublicKey::from_pkcs1_der(&der) {
        return Ok(key);
    }

    if SubjectPublicKeyInfoRef::try_from(der.as_slice()).is_ok() {
        return Err(KeyLoadError::PublicKeyNotRsa {
            path: path.to_path_buf(),
        });
    }
    Err(KeyLoadError::ParsePublicKey {
        path: path.to_path_buf(),
    })
}
