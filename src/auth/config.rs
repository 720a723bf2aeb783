use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ACCESS_TTL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_ISSUER: &str = "authmesh";
pub const DEFAULT_AUDIENCE: &str = "authmesh";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenConfigError {
    #[error("{0} secret must not be empty")]
    EmptySecret(&'static str),
    #[error("access and refresh secrets must differ")]
    SharedSecret,
    #[error("access token TTL must be non-zero and shorter than the refresh token TTL")]
    TtlOrder,
    #[error("token {0} must not be empty")]
    EmptyIdentity(&'static str),
}

/// Token issuance policy.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub access_secret: SecretString,
    pub refresh_secret: SecretString,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub issuer: String,
    pub audience: String,
}

impl TokenConfig {
    #[must_use]
    pub fn new(access_secret: SecretString, refresh_secret: SecretString) -> Self {
        Self {
            access_secret,
            refresh_secret,
            access_ttl: DEFAULT_ACCESS_TTL,
            refresh_ttl: DEFAULT_REFRESH_TTL,
            issuer: DEFAULT_ISSUER.to_string(),
            audience: DEFAULT_AUDIENCE.to_string(),
        }
    }

    #[must_use]
    pub const fn with_ttls(mut self, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        self.access_ttl = access_ttl;
        self.refresh_ttl = refresh_ttl;
        self
    }

    #[must_use]
    pub fn with_identity(mut self, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self.audience = audience.into();
        self
    }

    /// # Errors
    /// Rejects empty or shared secrets, an empty issuer or audience, and TTLs
    /// that would let the access token outlive the refresh token.
    pub fn validate(&self) -> Result<(), TokenConfigError> {
        let access = self.access_secret.expose_secret();
        let refresh = self.refresh_secret.expose_secret();
        if access.is_empty() {
            return Err(TokenConfigError::EmptySecret("access token"));
        }
        if refresh.is_empty() {
            return Err(TokenConfigError::EmptySecret("refresh token"));
        }
        if access == refresh {
            return Err(TokenConfigError::SharedSecret);
        }
        if self.access_ttl.is_zero() || self.access_ttl >= self.refresh_ttl {
            return Err(TokenConfigError::TtlOrder);
        }
        if self.issuer.is_empty() {
            return Err(TokenConfigError::EmptyIdentity("issuer"));
        }
        if self.audience.is_empty() {
            return Err(TokenConfigError::EmptyIdentity("audience"));
        }
        Ok(())
    }
}
