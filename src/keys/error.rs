//! Key loading and token signing errors.
//!
//! Every way a key directory can be wrong has its own variant carrying the
//! offending path, so a broken rotation shows up in the startup log as the
//! exact file and failure instead of a generic "bad key".

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures while loading a key directory.
#[derive(Debug, Error)]
pub enum KeyLoadError {
    /// The key directory does not exist or cannot be stat'ed.
    #[error("key directory {path} is not accessible: {source}")]
    DirectoryNotAccessible {
        /// Configured key directory.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },

    /// The key path exists but is not a directory.
    #[error("key path {path} is not a directory")]
    NotADirectory {
        /// Configured key path.
        path: PathBuf,
    },

    /// The directory listing failed.
    #[error("failed to read key directory {path}: {source}")]
    ReadDirFailed {
        /// Configured key directory.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },

    /// A `private-<kid>.pem` file could not be read.
    #[error("failed to read private key {path}: {source}")]
    ReadPrivateKey {
        /// Private key file.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },

    /// The private key file is not valid PEM.
    #[error("failed to decode PEM in private key {path}: {detail}")]
    DecodePrivatePem {
        /// Private key file.
        path: PathBuf,
        /// Decoder message.
        detail: String,
    },

    /// The PEM body is neither a PKCS#1 nor a PKCS#8 private key.
    #[error("failed to parse private key {path} as PKCS#1 or PKCS#8")]
    ParsePrivateKey {
        /// Private key file.
        path: PathBuf,
    },

    /// The private key parsed but is not an RSA key.
    #[error("private key {path} is not an RSA key")]
    PrivateKeyNotRsa {
        /// Private key file.
        path: PathBuf,
    },

    /// `private-<kid>.pem` has no `public-<kid>.pem` next to it.
    #[error("no public key for kid {kid}: expected {path}")]
    MissingPublicKey {
        /// Key id taken from the private key filename.
        kid: String,
        /// Expected public key file.
        path: PathBuf,
    },

    /// A `public-<kid>.pem` file could not be read.
    #[error("failed to read public key {path}: {source}")]
    ReadPublicKey {
        /// Public key file.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },

    /// The public key file is not valid PEM.
    #[error("failed to decode PEM in public key {path}: {detail}")]
    DecodePublicPem {
        /// Public key file.
        path: PathBuf,
        /// Decoder message.
        detail: String,
    },

    /// The PEM body is neither an SPKI nor a PKCS#1 public key.
    #[error("failed to parse public key {path}")]
    ParsePublicKey {
        /// Public key file.
        path: PathBuf,
    },

    /// The public key parsed but is not an RSA key.
    #[error("public key {path} is not an RSA key")]
    PublicKeyNotRsa {
        /// Public key file.
        path: PathBuf,
    },

    /// The public key on disk does not belong to the private key.
    #[error("public key does not match private key for kid {kid}")]
    KeyPairMismatch {
        /// Key id.
        kid: String,
    },

    /// The key material parsed but could not be turned into a signer/verifier.
    #[error("unusable key material for kid {kid}: {detail}")]
    KeyMaterial {
        /// Key id.
        kid: String,
        /// Backend message.
        detail: String,
    },

    /// The configured active kid has no loaded key pair.
    #[error("active key {kid} not found among loaded keys")]
    ActiveKeyMissing {
        /// Normalized active kid.
        kid: String,
    },
}

/// Failures while signing or verifying a token.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The token header carries no `kid`.
    #[error("token header has no kid")]
    MissingKeyId,

    /// The token's `kid` is not in this key store.
    #[error("unknown signing key: {0}")]
    UnknownKey(String),

    /// Signature, encoding or structural JWT failure.
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}
