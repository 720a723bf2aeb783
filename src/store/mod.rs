//! Credential persistence: users, their provider identities, and sessions.
//!
//! The store is the authority on uniqueness. Email, `(provider, provider_id)`,
//! and refresh tokens are unique, and a violation surfaces as
//! [`StoreError::Conflict`] instead of a generic database fault so callers can
//! turn it into a business outcome.

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryStore;
pub use models::{
    FilterUserParams, Identity, NewAccount, NewIdentity, NewSession, NewUser, Session, TokenPair,
    UpdateUserParams, User, UserSortField, DEFAULT_PAGE_SIZE, PROVIDER_LOCAL,
};
pub use postgres::PgCredentialStore;

use crate::error::ErrorKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} violates unique constraint {constraint}")]
    Conflict {
        entity: &'static str,
        constraint: String,
    },
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict { .. } => ErrorKind::AlreadyExists,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidInput(_) => ErrorKind::Validation,
            Self::Database(_) => ErrorKind::Store,
        }
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, user: &NewUser) -> Result<User, StoreError>;

    async fn get_user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// `email` must already be normalized.
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    /// Apply the `Some` fields and bump `updated_at`.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] if the user does not exist, [`StoreError::Conflict`]
    /// if the new email is taken.
    async fn update_user(&self, id: Uuid, params: &UpdateUserParams) -> Result<User, StoreError>;

    /// Delete and return the removed record. Identities and sessions are not
    /// touched; see [`IdentityStore::delete_identities_by_user`].
    async fn delete_user(&self, id: Uuid) -> Result<User, StoreError>;

    async fn list_users(&self, params: &FilterUserParams) -> Result<Vec<User>, StoreError>;
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn create_identity(&self, identity: &NewIdentity) -> Result<Identity, StoreError>;

    async fn get_identities_by_user(&self, user_id: Uuid) -> Result<Vec<Identity>, StoreError>;

    async fn get_identity_by_provider(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> Result<Option<Identity>, StoreError>;

    async fn update_last_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Returns the number of rows removed.
    async fn delete_identities_by_user(&self, user_id: Uuid) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: &NewSession) -> Result<Session, StoreError>;

    /// Most recently updated session of the user.
    async fn get_session_by_user(&self, user_id: Uuid) -> Result<Option<Session>, StoreError>;

    async fn get_session_by_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<Option<Session>, StoreError>;

    /// Replace both tokens and both expiries in one write.
    async fn replace_tokens(&self, id: Uuid, tokens: &TokenPair) -> Result<Session, StoreError>;

    async fn delete_session(&self, id: Uuid) -> Result<Session, StoreError>;

    async fn delete_sessions_by_user(&self, user_id: Uuid) -> Result<u64, StoreError>;
}

/// The full persistence surface used by the auth engine.
#[async_trait]
pub trait CredentialStore: UserStore + IdentityStore + SessionStore + 'static {
    /// Persist a new user with its identity and first session.
    ///
    /// Stores with transactions override this to write all three rows
    /// atomically. The default is a compensating sequence: when the identity
    /// or session insert fails, rows already written are deleted again
    /// (sessions, identities, then the user). A crash between steps can still
    /// leave a partial account behind.
    async fn create_account(
        &self,
        account: &NewAccount,
    ) -> Result<(User, Identity, Session), StoreError> {
        let user = self.create_user(&account.user).await?;

        let identity = match self.create_identity(&account.identity).await {
            Ok(identity) => identity,
            Err(err) => {
                self.compensate(user.id).await;
                return Err(err);
            }
        };

        match self.create_session(&account.session).await {
            Ok(session) => Ok((user, identity, session)),
            Err(err) => {
                self.compensate(user.id).await;
                Err(err)
            }
        }
    }

    /// Best-effort removal of a partially created account.
    async fn compensate(&self, user_id: Uuid) {
        if let Err(err) = self.delete_sessions_by_user(user_id).await {
            warn!(%user_id, "compensation failed to delete sessions: {err}");
        }
        if let Err(err) = self.delete_identities_by_user(user_id).await {
            warn!(%user_id, "compensation failed to delete identities: {err}");
        }
        if let Err(err) = self.delete_user(user_id).await {
            warn!(%user_id, "compensation failed to delete user: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_classify() {
        let conflict = StoreError::Conflict {
            entity: "user",
            constraint: "users_email_key".to_string(),
        };
        assert_eq!(conflict.kind(), ErrorKind::AlreadyExists);
        assert_eq!(StoreError::NotFound("session").kind(), ErrorKind::NotFound);
        assert_eq!(
            StoreError::Database(sqlx::Error::RowNotFound).kind(),
            ErrorKind::Store
        );
        assert_eq!(
            StoreError::InvalidInput("x".to_string()).kind(),
            ErrorKind::Validation
        );
    }
}
