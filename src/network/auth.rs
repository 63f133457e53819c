//! Access Token Inspection
//!
//! The client never verifies tokens - the server does. It only reads the
//! claims to learn its own user id and to avoid presenting a token that has
//! already expired.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims read from an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject - the user id.
    pub sub: String,
    /// Expiry timestamp (Unix seconds). Zero when absent.
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer (auth provider).
    #[serde(default)]
    pub iss: Option<String>,
}

impl TokenClaims {
    /// Whether the token is past its expiry at `now` (Unix seconds).
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.exp > 0 && now > self.exp
    }
}

/// Token inspection errors.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Read the claims of `token` without checking its signature or expiry.
pub fn inspect_token(token: &str) -> Result<TokenClaims, TokenError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    let token_data: TokenData<TokenClaims> =
        decode(token, &DecodingKey::from_secret(&[]), &validation).map_err(map_jwt_error)?;

    let claims = token_data.claims;
    if claims.sub.is_empty() {
        return Err(TokenError::MissingClaim("sub".into()));
    }
    Ok(claims)
}

/// Read the claims of `token` and reject it if it has expired.
pub fn check_token(token: &str) -> Result<TokenClaims, TokenError> {
    let claims = inspect_token(token)?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    if claims.is_expired_at(now) {
        return Err(TokenError::Expired);
    }
    Ok(claims)
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> TokenError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            TokenError::InvalidFormat
        }
        _ => TokenError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn create_test_token(claims: &TokenClaims) -> String {
        let header = Header::new(Algorithm::HS256);
        let key = EncodingKey::from_secret(b"server-side-secret-client-never-sees");
        encode(&header, claims, &key).unwrap()
    }

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    fn test_claims() -> TokenClaims {
        TokenClaims {
            sub: "user123".into(),
            exp: now() + 3600,
            iat: now(),
            iss: Some("test-issuer".into()),
        }
    }

    #[test]
    fn test_inspect_reads_subject_without_key() {
        let token = create_test_token(&test_claims());
        let claims = inspect_token(&token).unwrap();
        assert_eq!(claims.sub, "user123");
        assert_eq!(claims.iss.as_deref(), Some("test-issuer"));
    }

    #[test]
    fn test_expired_token_rejected_by_check() {
        let mut claims = test_claims();
        claims.exp = 1; // Expired in 1970
        let token = create_test_token(&claims);

        assert!(inspect_token(&token).is_ok());
        assert!(matches!(check_token(&token), Err(TokenError::Expired)));
    }

    #[test]
    fn test_token_without_expiry_never_expires() {
        let mut claims = test_claims();
        claims.exp = 0;
        let token = create_test_token(&claims);
        assert!(check_token(&token).is_ok());
    }

    #[test]
    fn test_missing_sub_rejected() {
        let mut claims = test_claims();
        claims.sub = String::new();
        let token = create_test_token(&claims);

        assert!(matches!(inspect_token(&token), Err(TokenError::MissingClaim(_))));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(inspect_token("not-a-jwt").is_err());
        assert!(inspect_token("a.b.c").is_err());
    }
}
