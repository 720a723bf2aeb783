use super::{Claims, TokenAuthenticator, TokenError};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// The only accepted signing algorithm.
pub const ALGORITHM: &str = "HS256";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

impl Header {
    fn hs256() -> Self {
        Self {
            alg: ALGORITHM.to_string(),
            typ: Some("JWT".to_string()),
        }
    }
}

/// Claims as found on the wire; every field is checked for presence explicitly.
#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: Option<String>,
    iss: Option<String>,
    aud: Option<String>,
    iat: Option<i64>,
    exp: Option<i64>,
    jti: Option<String>,
}

/// HS256 authenticator bound to one issuer and one audience.
#[derive(Debug, Clone)]
pub struct JwtAuthenticator {
    issuer: String,
    audience: String,
}

impl JwtAuthenticator {
    #[must_use]
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Verify `token` as of `now_unix_seconds`.
    ///
    /// # Errors
    /// See [`TokenAuthenticator::validate`].
    pub fn validate_at(
        &self,
        token: &str,
        secret: &SecretString,
        now_unix_seconds: i64,
    ) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let header_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
        let claims_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
        let sig_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
        if parts.next().is_some() {
            return Err(TokenError::TokenFormat);
        }

        let header: Header = b64d_json(header_b64)?;
        if header.alg != ALGORITHM {
            return Err(TokenError::UnsupportedAlg(header.alg));
        }

        let signature = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| TokenError::Base64)?;
        let mut mac = new_mac(secret)?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let raw: RawClaims = b64d_json(claims_b64)?;
        let exp = raw.exp.ok_or(TokenError::MissingClaim("exp"))?;
        let claims = Claims {
            sub: raw.sub.ok_or(TokenError::MissingClaim("sub"))?,
            iss: raw.iss.ok_or(TokenError::MissingClaim("iss"))?,
            aud: raw.aud.ok_or(TokenError::MissingClaim("aud"))?,
            iat: raw.iat.ok_or(TokenError::MissingClaim("iat"))?,
            exp,
            jti: raw.jti,
        };

        if claims.iss != self.issuer {
            return Err(TokenError::InvalidIssuer);
        }
        if claims.aud != self.audience {
            return Err(TokenError::InvalidAudience);
        }
        if claims.exp <= now_unix_seconds {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }
}

impl TokenAuthenticator for JwtAuthenticator {
    fn generate(&self, claims: &Claims, secret: &SecretString) -> Result<String, TokenError> {
        let header_b64 = b64e_json(&Header::hs256())?;
        let claims_b64 = b64e_json(claims)?;
        sign(&header_b64, &claims_b64, secret)
    }

    fn validate(&self, token: &str, secret: &SecretString) -> Result<Claims, TokenError> {
        self.validate_at(token, secret, Utc::now().timestamp())
    }
}

fn new_mac(secret: &SecretString) -> Result<HmacSha256, TokenError> {
    let key = secret.expose_secret().as_bytes();
    if key.is_empty() {
        return Err(TokenError::EmptySecret);
    }
    HmacSha256::new_from_slice(key).map_err(|_| TokenError::EmptySecret)
}

fn sign(header_b64: &str, claims_b64: &str, secret: &SecretString) -> Result<String, TokenError> {
    let signing_input = format!("{header_b64}.{claims_b64}");
    let mut mac = new_mac(secret)?;
    mac.update(signing_input.as_bytes());
    let signature_b64 = Base64UrlUnpadded::encode_string(&mac.finalize().into_bytes());
    Ok(format!("{signing_input}.{signature_b64}"))
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value).map_err(|_| TokenError::Json)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, TokenError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| TokenError::Base64)?;
    serde_json::from_slice(&bytes).map_err(|_| TokenError::Json)
}
