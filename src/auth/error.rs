use super::validate::ValidationError;
use crate::{error::ErrorKind, security::HashError, store::StoreError, token::TokenError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("user not found")]
    UserNotFound,
    #[error("user already exists")]
    UserAlreadyExists,
    #[error("session not found")]
    SessionNotFound,
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("password hashing: {0}")]
    Hash(#[from] HashError),
    #[error("token: {0}")]
    Token(#[from] TokenError),
    #[error("internal: {0}")]
    Internal(String),
}

impl AuthError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::InvalidCredentials => ErrorKind::InvalidCredentials,
            Self::UserNotFound | Self::SessionNotFound => ErrorKind::NotFound,
            Self::UserAlreadyExists => ErrorKind::AlreadyExists,
            Self::Store(_) => ErrorKind::Store,
            Self::Hash(_) | Self::Token(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(AuthError::InvalidCredentials.kind(), ErrorKind::InvalidCredentials);
        assert_eq!(AuthError::UserNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(AuthError::SessionNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(AuthError::UserAlreadyExists.kind(), ErrorKind::AlreadyExists);
        assert_eq!(
            AuthError::from(ValidationError::single("email", "email is required")).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            AuthError::from(StoreError::Database(sqlx::Error::PoolClosed)).kind(),
            ErrorKind::Store
        );
        assert_eq!(
            AuthError::from(HashError::Parse("bad".to_string())).kind(),
            ErrorKind::Internal
        );
        assert_eq!(AuthError::from(TokenError::Expired).kind(), ErrorKind::Internal);
    }
}
