//! OpenID Provider metadata (`/.well-known/openid-configuration`).

use serde::{Deserialize, Serialize};

/// Path of the authorization endpoint.
pub const AUTHORIZE_PATH: &str = "/v1/oauth/authorize";
/// Path of the token endpoint.
pub const TOKEN_PATH: &str = "/v1/oauth/token";
/// Path of the userinfo endpoint.
pub const USERINFO_PATH: &str = "/v1/user/info";
/// Path of the JWKS document.
pub const JWKS_PATH: &str = "/v1/.well-known/jwks.json";

/// OpenID Provider Metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    /// Issuer identifier
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Userinfo endpoint URL
    pub userinfo_endpoint: String,

    /// JWKS URL
    pub jwks_uri: String,

    /// Supported scopes
    pub scopes_supported: Vec<String>,

    /// Supported response types
    pub response_types_supported: Vec<String>,

    /// Supported grant types
    pub grant_types_supported: Vec<String>,

    /// Supported subject identifier types
    pub subject_types_supported: Vec<String>,

    /// Supported ID token signing algorithms
    pub id_token_signing_alg_values_supported: Vec<String>,

    /// Supported PKCE code challenge methods
    pub code_challenge_methods_supported: Vec<String>,
}

impl DiscoveryDocument {
    /// Build the document for a deployment reachable at `base_url`.
    #[must_use]
    pub fn new(issuer: &str, base_url: &str, scopes_supported: &[String]) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            issuer: issuer.to_string(),
            authorization_endpoint: format!("{base}{AUTHORIZE_PATH}"),
            token_endpoint: format!("{base}{TOKEN_PATH}"),
            userinfo_endpoint: format!("{base}{USERINFO_PATH}"),
            jwks_uri: format!("{base}{JWKS_PATH}"),
            scopes_supported: scopes_supported.to_vec(),
            response_types_supported: vec!["code".to_string()],
            grant_types_supported: vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ],
            subject_types_supported: vec!["public".to_string()],
            id_token_signing_alg_values_supported: vec!["RS256".to_string()],
            code_challenge_methods_supported: vec![super::pkce::METHOD_S256.to_string()],
        }
    }
}
