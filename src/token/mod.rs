//! Bearer token signing and verification.
//!
//! Tokens are compact JWS (`header.claims.signature`) signed with HMAC-SHA256.
//! Verification pins the algorithm: anything other than `HS256` in the header,
//! including `none`, is rejected before the signature is even looked at.

mod error;
mod jwt;

pub use error::TokenError;
pub use jwt::{JwtAuthenticator, ALGORITHM};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Mandatory claims carried by every token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Subject (user id).
    pub sub: String,
    pub iss: String,
    pub aud: String,
    /// Issued at, unix seconds.
    pub iat: i64,
    /// Expires at, unix seconds.
    pub exp: i64,
    /// Unique token id; keeps two tokens minted in the same second distinct.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

/// Token capability consumed by the auth engine.
///
/// The secret is a parameter rather than state because access and refresh
/// tokens are signed with independent secrets.
pub trait TokenAuthenticator: Send + Sync + 'static {
    /// Sign `claims` with `secret`.
    ///
    /// # Errors
    /// Returns an error if the secret is empty or the claims cannot be encoded.
    fn generate(&self, claims: &Claims, secret: &SecretString) -> Result<String, TokenError>;

    /// Verify `token` against `secret` and the configured issuer/audience.
    ///
    /// # Errors
    /// Returns an error if the token is malformed, uses another algorithm, has a
    /// bad signature, lacks a mandatory claim, targets another issuer/audience,
    /// or has expired.
    fn validate(&self, token: &str, secret: &SecretString) -> Result<Claims, TokenError>;
}
