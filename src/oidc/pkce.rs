//! PKCE (RFC 7636) challenge checks, S256 only.

use base64::{
    Engine, alphabet,
    engine::{
        DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig, general_purpose::URL_SAFE_NO_PAD,
    },
};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// The only accepted challenge method.
pub const METHOD_S256: &str = "S256";

/// Length of an unpadded base64url SHA-256 digest.
pub const CHALLENGE_LEN: usize = 43;

/// Unpadded base64url that ignores the unused low bits of the last symbol.
const LENIENT_URL_SAFE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::RequireNone)
        .with_decode_allow_trailing_bits(true),
);

/// Whether `challenge` is a well-formed S256 challenge: 43 base64url
/// characters that decode to 32 bytes.
#[must_use]
pub fn is_valid_challenge(challenge: &str) -> bool {
    if challenge.len() != CHALLENGE_LEN {
        return false;
    }
    matches!(LENIENT_URL_SAFE.decode(challenge), Ok(bytes) if bytes.len() == 32)
}

/// S256 challenge for `verifier`.
#[must_use]
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Whether `verifier` hashes to `challenge`. Constant-time.
#[must_use]
pub fn verify(verifier: &str, challenge: &str) -> bool {
    // RFC 7636 4.1: 43..=128 unreserved characters
    if !(43..=128).contains(&verifier.len()) {
        return false;
    }
    let computed = challenge_for(verifier);
    computed.as_bytes().ct_eq(challenge.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7636 appendix B
    const RFC_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const RFC_CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn rfc_vector_verifies() {
        assert_eq!(challenge_for(RFC_VERIFIER), RFC_CHALLENGE);
        assert!(verify(RFC_VERIFIER, RFC_CHALLENGE));
    }

    #[test]
    fn wrong_verifier_fails() {
        let other = "x".repeat(43);
        assert!(!verify(&other, RFC_CHALLENGE));
    }

    #[test]
    fn short_verifier_fails() {
        assert!(!verify("short", &challenge_for("short")));
    }

    #[test]
    fn challenge_must_be_43_chars() {
        assert!(is_valid_challenge(RFC_CHALLENGE));
        assert!(!is_valid_challenge(&RFC_CHALLENGE[..42]));
        assert!(!is_valid_challenge(&format!("{RFC_CHALLENGE}A")));
        assert!(!is_valid_challenge(""));
    }

    #[test]
    fn challenge_must_be_base64url() {
        // 43 chars, but '+' and '/' are not in the URL-safe alphabet
        let challenge = format!("{}+/", &RFC_CHALLENGE[..41]);
        assert_eq!(challenge.len(), 43);
        assert!(!is_valid_challenge(&challenge));

        let spaces = " ".repeat(43);
        assert!(!is_valid_challenge(&spaces));
    }

    #[test]
    fn trailing_bits_of_last_symbol_are_ignored() {
        // 'N' sets low bits that a canonical encoder leaves zero
        let challenge = format!("{}N", &RFC_CHALLENGE[..42]);
        assert!(is_valid_challenge(&challenge));
        assert!(!verify(RFC_VERIFIER, &challenge));
    }
}
