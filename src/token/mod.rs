//! Access token issuance and validation.
//!
//! Access tokens are short-lived RS256 JWTs. The audience is never configured
//! per token: it is derived from the scope keys the token carries, so a token
//! holding `{"billing": 3, "billing:invoices": 1}` is accepted by the
//! `billing` service and nobody else.
//!
//! `pver` (permission version) lets a resource server notice that the
//! user's permissions changed after the token was minted without a database
//! round trip.

mod claims;

pub use claims::{AccessTokenClaims, Scopes};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::keys::{KeyError, KeyHandle};

/// Default access token lifetime.
pub const DEFAULT_ACCESS_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

/// Token issuance and validation failures.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Signature, kid or structural failure.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// `exp` is zero or missing.
    #[error("token has no expiration")]
    MissingExpiration,

    /// `exp` is in the past.
    #[error("token expired")]
    Expired,

    /// `iss` differs from the configured issuer.
    #[error("issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Configured issuer.
        expected: String,
        /// Issuer in the token.
        actual: String,
    },

    /// No overlap between token audience and the expected audience.
    #[error("audience mismatch")]
    AudienceMismatch,
}

/// A freshly minted access token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Compact JWS.
    pub token: String,
    /// Claims inside `token`.
    pub claims: AccessTokenClaims,
}

impl IssuedToken {
    /// Seconds until expiry as of minting.
    #[must_use]
    pub fn expires_in(&self) -> u64 {
        u64::try_from(self.claims.exp - self.claims.iat).unwrap_or(0)
    }
}

/// Distinct service codes of `scopes`, taken up to the first `:`.
///
/// Empty codes are skipped. The result is sorted.
#[must_use]
pub fn build_audience(scopes: &Scopes) -> Vec<String> {
    scopes
        .keys()
        .map(|key| key.split_once(':').map_or(key.as_str(), |(code, _)| code))
        .filter(|code| !code.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Business validation of already signature-checked claims at time `now`.
///
/// An empty `issuer` skips the issuer check. An empty `expected_audience`
/// accepts any audience.
pub fn validate_at(
    claims: &AccessTokenClaims,
    issuer: &str,
    expected_audience: &[String],
    now: i64,
) -> Result<(), TokenError> {
    if claims.exp == 0 {
        return Err(TokenError::MissingExpiration);
    }
    if now > claims.exp {
        return Err(TokenError::Expired);
    }
    if !issuer.is_empty() && claims.iss != issuer {
        return Err(TokenError::IssuerMismatch {
            expected: issuer.to_string(),
            actual: claims.iss.clone(),
        });
    }
    if !expected_audience.is_empty()
        && !claims.aud.iter().any(|aud| expected_audience.contains(aud))
    {
        return Err(TokenError::AudienceMismatch);
    }
    Ok(())
}

/// [`validate_at`] against the current clock.
pub fn validate(
    claims: &AccessTokenClaims,
    issuer: &str,
    expected_audience: &[String],
) -> Result<(), TokenError> {
    validate_at(claims, issuer, expected_audience, Utc::now().timestamp())
}

/// Mints and checks access tokens with the current signing keys.
#[derive(Debug)]
pub struct TokenService {
    keys: Arc<KeyHandle>,
    issuer: String,
    access_ttl: Duration,
}

impl TokenService {
    /// Create a token service.
    #[must_use]
    pub fn new(keys: Arc<KeyHandle>, issuer: impl Into<String>, access_ttl: Duration) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
            access_ttl,
        }
    }

    /// Configured issuer.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Configured access token lifetime.
    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    /// Mint an access token for `subject` bound to session `sid`.
    pub fn generate_access_token(
        &self,
        subject: &str,
        sid: &str,
        scopes: Scopes,
        permission_version: i64,
    ) -> Result<IssuedToken, TokenError> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.access_ttl.as_secs()).unwrap_or(i64::MAX);

        let claims = AccessTokenClaims {
            sub: subject.to_string(),
            sid: sid.to_string(),
            iss: self.issuer.clone(),
            aud: build_audience(&scopes),
            iat: now,
            exp: now.saturating_add(ttl),
            scopes,
            pver: permission_version,
        };

        let token = self.keys.current().sign(&claims)?;
        debug!(sub = %subject, sid = %sid, aud = ?claims.aud, "Access token minted");
        Ok(IssuedToken { token, claims })
    }

    /// Signature check only.
    pub fn verify_signature(&self, token: &str) -> Result<AccessTokenClaims, TokenError> {
        Ok(self.keys.current().verify(token)?)
    }

    /// Business checks against this service's issuer.
    pub fn validate(
        &self,
        claims: &AccessTokenClaims,
        expected_audience: &[String],
    ) -> Result<(), TokenError> {
        validate(claims, &self.issuer, expected_audience)
    }

    /// Signature check followed by business checks.
    pub fn verify(
        &self,
        token: &str,
        expected_audience: &[String],
    ) -> Result<AccessTokenClaims, TokenError> {
        let claims = self.verify_signature(token)?;
        self.validate(&claims, expected_audience)?;
        Ok(claims)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn claims(exp: i64) -> AccessTokenClaims {
        AccessTokenClaims {
            sub: "u1".into(),
            sid: "s1".into(),
            iss: "https://id.example.com".into(),
            aud: vec!["billing".into(), "crm".into()],
            iat: 0,
            exp,
            scopes: Scopes::new(),
            pver: 1,
        }
    }

    fn service() -> TokenService {
        TokenService::new(
            Arc::new(test_support::key_handle()),
            "https://id.example.com",
            DEFAULT_ACCESS_TOKEN_TTL,
        )
    }

    #[test]
    fn build_audience_dedups_service_codes() {
        let scopes = Scopes::from([("svc".to_string(), 3), ("svc:res".to_string(), 1)]);
        assert_eq!(build_audience(&scopes), vec!["svc".to_string()]);
    }

    #[test]
    fn build_audience_skips_empty_codes_and_sorts() {
        let scopes = Scopes::from([
            ("crm:leads".to_string(), 1),
            (":orphan".to_string(), 1),
            ("billing".to_string(), 2),
            ("crm".to_string(), 4),
        ]);
        assert_eq!(
            build_audience(&scopes),
            vec!["billing".to_string(), "crm".to_string()]
        );
    }

    #[test]
    fn validate_rejects_unset_expiration() {
        assert!(matches!(
            validate_at(&claims(0), "", &[], 100),
            Err(TokenError::MissingExpiration)
        ));
    }

    #[test]
    fn validate_rejects_after_expiration() {
        assert!(matches!(
            validate_at(&claims(100), "", &[], 101),
            Err(TokenError::Expired)
        ));
        assert!(validate_at(&claims(100), "", &[], 100).is_ok());
    }

    #[test]
    fn validate_checks_issuer_only_when_configured() {
        let c = claims(100);
        assert!(validate_at(&c, "", &[], 50).is_ok());
        assert!(validate_at(&c, "https://id.example.com", &[], 50).is_ok());
        assert!(matches!(
            validate_at(&c, "https://evil.example.com", &[], 50),
            Err(TokenError::IssuerMismatch { .. })
        ));
    }

    #[test]
    fn validate_requires_audience_intersection() {
        let c = claims(100);
        assert!(validate_at(&c, "", &["crm".into()], 50).is_ok());
        assert!(validate_at(&c, "", &["hr".into(), "billing".into()], 50).is_ok());
        assert!(matches!(
            validate_at(&c, "", &["hr".into()], 50),
            Err(TokenError::AudienceMismatch)
        ));
    }

    #[test]
    fn generated_token_verifies_and_carries_derived_audience() {
        // GIVEN: a token service and a scope map spanning two services
        let svc = service();
        let scopes = Scopes::from([
            ("billing".to_string(), 3),
            ("billing:invoices".to_string(), 1),
            ("crm".to_string(), 8),
        ]);

        // WHEN: a token is minted
        let issued = svc.generate_access_token("u1", "s1", scopes.clone(), 7).unwrap();

        // THEN: it verifies and round-trips every claim
        let decoded = svc.verify(&issued.token, &["crm".into()]).unwrap();
        assert_eq!(decoded, issued.claims);
        assert_eq!(decoded.aud, vec!["billing".to_string(), "crm".to_string()]);
        assert_eq!(decoded.scopes, scopes);
        assert_eq!(decoded.pver, 7);
        assert_eq!(decoded.sid, "s1");
        assert_eq!(issued.expires_in(), 15 * 60);
    }

    #[test]
    fn verify_rejects_foreign_audience() {
        let svc = service();
        let scopes = Scopes::from([("billing".to_string(), 1)]);
        let issued = svc.generate_access_token("u1", "s1", scopes, 1).unwrap();

        assert!(matches!(
            svc.verify(&issued.token, &["hr".into()]),
            Err(TokenError::AudienceMismatch)
        ));
    }

    #[test]
    fn verify_rejects_expired_token() {
        let svc = service();
        let expired = claims(Utc::now().timestamp() - 60);
        let token = svc.keys.current().sign(&expired).unwrap();

        assert!(matches!(svc.verify(&token, &[]), Err(TokenError::Expired)));
    }
}
