//! In-process credential store.
//!
//! Enforces the same uniqueness and ownership rules as the `PostgreSQL` schema
//! so the engine behaves identically against either store. It has no
//! transactions, so account creation uses the compensating default of
//! [`CredentialStore::create_account`].

use super::{
    CredentialStore, FilterUserParams, Identity, IdentityStore, NewIdentity, NewSession, NewUser,
    Session, SessionStore, StoreError, TokenPair, UpdateUserParams, User, UserSortField, UserStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering as AtomicOrdering},
};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    identities: HashMap<Uuid, Identity>,
    sessions: HashMap<Uuid, Session>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_session_inserts: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `create_session` fail with a database error until
    /// reset. Used to exercise the compensation path.
    pub fn fail_session_inserts(&self, fail: bool) {
        self.fail_session_inserts.store(fail, AtomicOrdering::SeqCst);
    }

    pub async fn user_count(&self) -> usize {
        self.tables.lock().await.users.len()
    }

    pub async fn identity_count(&self) -> usize {
        self.tables.lock().await.identities.len()
    }

    pub async fn session_count(&self) -> usize {
        self.tables.lock().await.sessions.len()
    }
}

fn conflict(entity: &'static str, constraint: &str) -> StoreError {
    StoreError::Conflict {
        entity,
        constraint: constraint.to_string(),
    }
}

fn compare_users(a: &User, b: &User, field: UserSortField) -> Ordering {
    let primary = match field {
        UserSortField::CreatedAt => a.created_at.cmp(&b.created_at),
        UserSortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        UserSortField::Email => a.email.cmp(&b.email),
        UserSortField::FullName => a.full_name.cmp(&b.full_name),
    };
    primary.then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_user(&self, user: &NewUser) -> Result<User, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.users.contains_key(&user.id) {
            return Err(conflict("user", "users_pkey"));
        }
        if tables.users.values().any(|u| u.email == user.email) {
            return Err(conflict("user", "users_email_key"));
        }

        let now = Utc::now();
        let record = User {
            id: user.id,
            full_name: user.full_name.clone(),
            email: user.email.clone(),
            password_hash: user.password_hash.clone(),
            verified: false,
            verification_code: user.verification_code.clone(),
            created_at: now,
            updated_at: now,
        };
        tables.users.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.tables.lock().await.users.get(&id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.users.values().find(|u| u.email == email).cloned())
    }

    async fn update_user(&self, id: Uuid, params: &UpdateUserParams) -> Result<User, StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(email) = &params.email {
            if tables.users.values().any(|u| u.id != id && &u.email == email) {
                return Err(conflict("user", "users_email_key"));
            }
        }

        let user = tables.users.get_mut(&id).ok_or(StoreError::NotFound("user"))?;
        if let Some(full_name) = &params.full_name {
            user.full_name.clone_from(full_name);
        }
        if let Some(email) = &params.email {
            user.email.clone_from(email);
        }
        if let Some(password_hash) = &params.password_hash {
            user.password_hash.clone_from(password_hash);
        }
        if let Some(verified) = params.verified {
            user.verified = verified;
        }
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn delete_user(&self, id: Uuid) -> Result<User, StoreError> {
        let mut tables = self.tables.lock().await;
        let referenced = tables.identities.values().any(|i| i.user_id == id)
            || tables.sessions.values().any(|s| s.user_id == id);
        if referenced {
            return Err(StoreError::InvalidInput(
                "user references a missing or still-referenced row".to_string(),
            ));
        }
        tables.users.remove(&id).ok_or(StoreError::NotFound("user"))
    }

    async fn list_users(&self, params: &FilterUserParams) -> Result<Vec<User>, StoreError> {
        let tables = self.tables.lock().await;
        let mut users: Vec<User> = tables
            .users
            .values()
            .filter(|u| params.email.as_ref().map_or(true, |email| &u.email == email))
            .filter(|u| params.verified.map_or(true, |verified| u.verified == verified))
            .cloned()
            .collect();

        users.sort_by(|a, b| {
            let ordering = compare_users(a, b, params.sort_by);
            if params.sort_desc {
                ordering.reverse()
            } else {
                ordering
            }
        });

        Ok(users
            .into_iter()
            .skip(params.offset as usize)
            .take(params.effective_limit() as usize)
            .collect())
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn create_identity(&self, identity: &NewIdentity) -> Result<Identity, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.users.contains_key(&identity.user_id) {
            return Err(StoreError::InvalidInput(
                "identity references a missing or still-referenced row".to_string(),
            ));
        }
        if tables
            .identities
            .values()
            .any(|i| i.provider == identity.provider && i.provider_id == identity.provider_id)
        {
            return Err(conflict("identity", "identities_provider_key"));
        }

        let now = Utc::now();
        let record = Identity {
            id: identity.id,
            user_id: identity.user_id,
            provider_id: identity.provider_id.clone(),
            provider: identity.provider.clone(),
            email: identity.email.clone(),
            last_login_at: identity.last_login_at,
            created_at: now,
            updated_at: now,
        };
        tables.identities.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_identities_by_user(&self, user_id: Uuid) -> Result<Vec<Identity>, StoreError> {
        let tables = self.tables.lock().await;
        let mut identities: Vec<Identity> = tables
            .identities
            .values()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect();
        identities.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(identities)
    }

    async fn get_identity_by_provider(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> Result<Option<Identity>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .identities
            .values()
            .find(|i| i.provider == provider && i.provider_id == provider_id)
            .cloned())
    }

    async fn update_last_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let identity = tables
            .identities
            .get_mut(&id)
            .ok_or(StoreError::NotFound("identity"))?;
        identity.last_login_at = Some(at);
        identity.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_identities_by_user(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let before = tables.identities.len();
        tables.identities.retain(|_, i| i.user_id != user_id);
        Ok((before - tables.identities.len()) as u64)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, session: &NewSession) -> Result<Session, StoreError> {
        if self.fail_session_inserts.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut tables = self.tables.lock().await;
        if !tables.users.contains_key(&session.user_id) {
            return Err(StoreError::InvalidInput(
                "session references a missing or still-referenced row".to_string(),
            ));
        }
        if tables
            .sessions
            .values()
            .any(|s| s.refresh_token == session.tokens.refresh_token())
        {
            return Err(conflict("session", "sessions_refresh_token_key"));
        }

        let now = Utc::now();
        let record = Session {
            id: session.id,
            user_id: session.user_id,
            access_token: session.tokens.access_token().to_string(),
            refresh_token: session.tokens.refresh_token().to_string(),
            access_token_expires_at: session.tokens.access_token_expires_at(),
            refresh_token_expires_at: session.tokens.refresh_token_expires_at(),
            ip_address: session.ip_address.clone(),
            user_agent: session.user_agent.clone(),
            created_at: now,
            updated_at: now,
        };
        tables.sessions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_session_by_user(&self, user_id: Uuid) -> Result<Option<Session>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .max_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)))
            .cloned())
    }

    async fn get_session_by_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<Option<Session>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .sessions
            .values()
            .find(|s| s.refresh_token == refresh_token)
            .cloned())
    }

    async fn replace_tokens(&self, id: Uuid, tokens: &TokenPair) -> Result<Session, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables
            .sessions
            .values()
            .any(|s| s.id != id && s.refresh_token == tokens.refresh_token())
        {
            return Err(conflict("session", "sessions_refresh_token_key"));
        }

        let session = tables
            .sessions
            .get_mut(&id)
            .ok_or(StoreError::NotFound("session"))?;
        session.access_token = tokens.access_token().to_string();
        session.refresh_token = tokens.refresh_token().to_string();
        session.access_token_expires_at = tokens.access_token_expires_at();
        session.refresh_token_expires_at = tokens.refresh_token_expires_at();
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    async fn delete_session(&self, id: Uuid) -> Result<Session, StoreError> {
        let mut tables = self.tables.lock().await;
        tables
            .sessions
            .remove(&id)
            .ok_or(StoreError::NotFound("session"))
    }

    async fn delete_sessions_by_user(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let before = tables.sessions.len();
        tables.sessions.retain(|_, s| s.user_id != user_id);
        Ok((before - tables.sessions.len()) as u64)
    }
}

impl CredentialStore for MemoryStore {}
