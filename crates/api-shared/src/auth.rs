//! Bearer-token claims and signing keys.
//!
//! Tokens are HS256 JWTs. Besides the user id and role they carry the session id (`sid`)
//! that was current when the token was issued; the API rejects a token whose session is no
//! longer the user's current one.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Minimum length of the shared signing secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Default token lifetime: one clinic shift.
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 12 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: i64,
    pub role: String,
    /// Session id.
    pub sid: String,
    /// Expiry, seconds since the Unix epoch.
    pub exp: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("signing secret must be at least {MIN_SECRET_LEN} bytes")]
    WeakSecret,
    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// Encoding and decoding keys derived from one shared secret.
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for TokenKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenKeys(..)")
    }
}

impl TokenKeys {
    pub fn from_secret(secret: &str) -> Result<Self, AuthError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(AuthError::WeakSecret);
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        })
    }

    /// Signs a token for `user_id` valid for `ttl_secs` seconds from now.
    pub fn issue(
        &self,
        user_id: i64,
        role: &str,
        session_id: &str,
        ttl_secs: i64,
    ) -> Result<String, AuthError> {
        let exp = chrono::Utc::now().timestamp().saturating_add(ttl_secs).max(0) as usize;
        let claims = Claims {
            sub: user_id,
            role: role.to_string(),
            sid: session_id.to_string(),
            exp,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    /// Verifies signature and expiry.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: &str) -> Result<&str, AuthError> {
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)
}
