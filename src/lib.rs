//! idgate Library
//!
//! Core of an OpenID Connect identity provider.
//!
//! # Features
//!
//! - **Key store**: RS256 keys loaded from a PEM directory, published as JWKS, rotated in place
//! - **Access tokens**: bitmask scopes per service, audience derived from the scope keys
//! - **Sessions**: opaque `"<sid>:<secret>"` credentials with rotation and replay detection
//! - **Revocation cache**: fail-open or fail-closed lookups with bounded retries
//! - **Authorization code flow**: S256 PKCE, single-use codes, exact redirect matching
//! - **Middleware**: bearer authentication and scope guards for axum
//!
//! # Layout
//!
//! ```text
//! keys ──▶ token ──▶ auth::middleware ◀── revocation
//!            ▲
//! permission ┤
//! session ───┴──▶ auth ──▶ server ◀── oidc
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod keys;
pub mod oidc;
pub mod permission;
pub mod revocation;
pub mod server;
pub mod session;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
