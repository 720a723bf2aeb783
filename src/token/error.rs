use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json,
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("missing claim: {0}")]
    MissingClaim(&'static str),
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid audience")]
    InvalidAudience,
    #[error("token expired")]
    Expired,
    #[error("signing secret is empty")]
    EmptySecret,
}
