//! Sign-up, login, and session revocation over the credential store.
//!
//! The engine owns the token-lifecycle policy: every successful sign-up or
//! login yields a fresh access/refresh pair whose access token expires first.
//! It takes no locks of its own. Concurrent sign-ups for the same email race
//! past the existence check and are settled by the store's uniqueness
//! constraint, which is mapped to [`AuthError::UserAlreadyExists`].

mod config;
mod engine;
mod error;
pub mod validate;

pub use config::{
    TokenConfig, TokenConfigError, DEFAULT_ACCESS_TTL, DEFAULT_AUDIENCE, DEFAULT_ISSUER,
    DEFAULT_REFRESH_TTL,
};
pub use engine::AuthEngine;
pub use error::AuthError;
pub use validate::{FieldError, ValidationError};

use crate::store::TokenPair;
use async_trait::async_trait;
use secrecy::SecretString;

/// Caller metadata recorded on the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub email: String,
    pub password: SecretString,
    pub client: ClientInfo,
}

#[derive(Debug, Clone)]
pub struct SignUpRequest {
    pub email: String,
    pub password: SecretString,
    pub full_name: String,
    pub client: ClientInfo,
}

#[async_trait]
pub trait AuthUsecase: Send + Sync + 'static {
    /// # Errors
    /// `UserNotFound` for an unknown email, `InvalidCredentials` for a wrong
    /// password. Neither touches any session.
    async fn login(&self, request: LoginRequest) -> Result<TokenPair, AuthError>;

    /// # Errors
    /// `UserAlreadyExists` when the email is taken; nothing is persisted then.
    async fn sign_up(&self, request: SignUpRequest) -> Result<TokenPair, AuthError>;

    /// Delete the session holding `refresh_token`.
    ///
    /// # Errors
    /// `InvalidCredentials` when the token does not verify, `SessionNotFound`
    /// when no session holds it.
    async fn revoke_session(&self, refresh_token: &str) -> Result<(), AuthError>;
}
