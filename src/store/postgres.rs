//! `PostgreSQL` credential store.

use super::{
    CredentialStore, FilterUserParams, Identity, IdentityStore, NewAccount, NewIdentity,
    NewSession, NewUser, Session, SessionStore, StoreError, TokenPair, UpdateUserParams, User,
    UserStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    FromRow, PgExecutor, PgPool, Postgres, QueryBuilder,
};
use tracing::{info_span, instrument, Instrument, Span};
use uuid::Uuid;

/// Idempotent DDL applied by the auth service at startup.
pub const SCHEMA: &str = include_str!("../../sql/schema.sql");

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const CHECK_VIOLATION: &str = "23514";

#[derive(Clone, Debug)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    /// # Errors
    /// Returns an error if the pool cannot be established.
    pub async fn connect(dsn: &SecretString, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn.expose_secret())
            .await?;
        Ok(Self { pool })
    }

    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist yet.
    ///
    /// # Errors
    /// Returns an error if any statement fails.
    #[instrument(skip(self))]
    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .instrument(db_span("CREATE", "sql/schema.sql"))
            .await?;
        Ok(())
    }
}

fn db_span(operation: &'static str, statement: &str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some(UNIQUE_VIOLATION)
}

/// Classify a failed write on `entity`.
fn write_error(entity: &'static str, err: sqlx::Error) -> StoreError {
    if is_unique_violation(&err) {
        let constraint = match &err {
            sqlx::Error::Database(db_err) => db_err.constraint().unwrap_or("unique").to_string(),
            _ => "unique".to_string(),
        };
        return StoreError::Conflict { entity, constraint };
    }
    match sqlstate(&err).as_deref() {
        Some(FOREIGN_KEY_VIOLATION) => {
            StoreError::InvalidInput(format!("{entity} references a missing or still-referenced row"))
        }
        Some(CHECK_VIOLATION) => StoreError::InvalidInput(format!("{entity} violates a check constraint")),
        _ => StoreError::Database(err),
    }
}

async fn fetch_one_as<'e, E, T>(
    executor: E,
    query: &'static str,
    operation: &'static str,
    entity: &'static str,
    bind: impl FnOnce(
        sqlx::query::Query<'e, Postgres, sqlx::postgres::PgArguments>,
    ) -> sqlx::query::Query<'e, Postgres, sqlx::postgres::PgArguments>,
) -> Result<T, StoreError>
where
    E: PgExecutor<'e>,
    T: for<'r> FromRow<'r, PgRow>,
{
    let row = bind(sqlx::query(query))
        .fetch_one(executor)
        .instrument(db_span(operation, query))
        .await
        .map_err(|err| write_error(entity, err))?;
    Ok(T::from_row(&row)?)
}

async fn insert_user<'e, E: PgExecutor<'e>>(executor: E, user: &'e NewUser) -> Result<User, StoreError> {
    let query = r"
        INSERT INTO users (id, full_name, email, password_hash, verified, verification_code)
        VALUES ($1, $2, $3, $4, FALSE, $5)
        RETURNING *";
    fetch_one_as(executor, query, "INSERT", "user", |q| {
        q.bind(user.id)
            .bind(&user.full_name)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(&user.verification_code)
    })
    .await
}

async fn insert_identity<'e, E: PgExecutor<'e>>(
    executor: E,
    identity: &'e NewIdentity,
) -> Result<Identity, StoreError> {
    let query = r"
        INSERT INTO identities (id, user_id, provider_id, provider, email, last_login_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *";
    fetch_one_as(executor, query, "INSERT", "identity", |q| {
        q.bind(identity.id)
            .bind(identity.user_id)
            .bind(&identity.provider_id)
            .bind(&identity.provider)
            .bind(&identity.email)
            .bind(identity.last_login_at)
    })
    .await
}

async fn insert_session<'e, E: PgExecutor<'e>>(
    executor: E,
    session: &'e NewSession,
) -> Result<Session, StoreError> {
    let query = r"
        INSERT INTO sessions (id, user_id, access_token, refresh_token,
            access_token_expires_at, refresh_token_expires_at, ip_address, user_agent)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING *";
    fetch_one_as(executor, query, "INSERT", "session", |q| {
        q.bind(session.id)
            .bind(session.user_id)
            .bind(session.tokens.access_token())
            .bind(session.tokens.refresh_token())
            .bind(session.tokens.access_token_expires_at())
            .bind(session.tokens.refresh_token_expires_at())
            .bind(session.ip_address.as_deref())
            .bind(session.user_agent.as_deref())
    })
    .await
}

#[async_trait]
impl UserStore for PgCredentialStore {
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    async fn create_user(&self, user: &NewUser) -> Result<User, StoreError> {
        insert_user(&self.pool, user).await
    }

    async fn get_user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let query = "SELECT * FROM users WHERE id = $1";
        let user = sqlx::query_as::<_, User>(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(user)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let query = "SELECT * FROM users WHERE email = $1";
        let user = sqlx::query_as::<_, User>(query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(user)
    }

    #[instrument(skip(self, params))]
    async fn update_user(&self, id: Uuid, params: &UpdateUserParams) -> Result<User, StoreError> {
        let query = r"
            UPDATE users SET
                full_name = COALESCE($2, full_name),
                email = COALESCE($3, email),
                password_hash = COALESCE($4, password_hash),
                verified = COALESCE($5, verified),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *";
        let row = sqlx::query(query)
            .bind(id)
            .bind(params.full_name.as_deref())
            .bind(params.email.as_deref())
            .bind(params.password_hash.as_deref())
            .bind(params.verified)
            .fetch_optional(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .map_err(|err| write_error("user", err))?;
        let row = row.ok_or(StoreError::NotFound("user"))?;
        Ok(User::from_row(&row)?)
    }

    #[instrument(skip(self))]
    async fn delete_user(&self, id: Uuid) -> Result<User, StoreError> {
        let query = "DELETE FROM users WHERE id = $1 RETURNING *";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .map_err(|err| write_error("user", err))?;
        let row = row.ok_or(StoreError::NotFound("user"))?;
        Ok(User::from_row(&row)?)
    }

    async fn list_users(&self, params: &FilterUserParams) -> Result<Vec<User>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT * FROM users WHERE TRUE");
        if let Some(email) = &params.email {
            builder.push(" AND email = ").push_bind(email.clone());
        }
        if let Some(verified) = params.verified {
            builder.push(" AND verified = ").push_bind(verified);
        }
        builder
            .push(" ORDER BY ")
            .push(params.sort_by.column())
            .push(if params.sort_desc { " DESC" } else { " ASC" })
            .push(", id ASC LIMIT ")
            .push_bind(i64::from(params.effective_limit()))
            .push(" OFFSET ")
            .push_bind(i64::from(params.offset));

        let statement = builder.sql().to_string();
        let users = builder
            .build_query_as::<User>()
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", &statement))
            .await?;
        Ok(users)
    }
}

#[async_trait]
impl IdentityStore for PgCredentialStore {
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id, provider = %identity.provider))]
    async fn create_identity(&self, identity: &NewIdentity) -> Result<Identity, StoreError> {
        insert_identity(&self.pool, identity).await
    }

    async fn get_identities_by_user(&self, user_id: Uuid) -> Result<Vec<Identity>, StoreError> {
        let query = "SELECT * FROM identities WHERE user_id = $1 ORDER BY created_at, id";
        let identities = sqlx::query_as::<_, Identity>(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(identities)
    }

    async fn get_identity_by_provider(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> Result<Option<Identity>, StoreError> {
        let query = "SELECT * FROM identities WHERE provider = $1 AND provider_id = $2";
        let identity = sqlx::query_as::<_, Identity>(query)
            .bind(provider)
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(identity)
    }

    async fn update_last_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let query = "UPDATE identities SET last_login_at = $2, updated_at = NOW() WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("identity"));
        }
        Ok(())
    }

    async fn delete_identities_by_user(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let query = "DELETE FROM identities WHERE user_id = $1";
        let result = sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SessionStore for PgCredentialStore {
    #[instrument(skip(self, session), fields(user_id = %session.user_id))]
    async fn create_session(&self, session: &NewSession) -> Result<Session, StoreError> {
        insert_session(&self.pool, session).await
    }

    async fn get_session_by_user(&self, user_id: Uuid) -> Result<Option<Session>, StoreError> {
        let query =
            "SELECT * FROM sessions WHERE user_id = $1 ORDER BY updated_at DESC, id DESC LIMIT 1";
        let session = sqlx::query_as::<_, Session>(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(session)
    }

    async fn get_session_by_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<Option<Session>, StoreError> {
        let query = "SELECT * FROM sessions WHERE refresh_token = $1";
        let session = sqlx::query_as::<_, Session>(query)
            .bind(refresh_token)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(session)
    }

    #[instrument(skip(self, tokens))]
    async fn replace_tokens(&self, id: Uuid, tokens: &TokenPair) -> Result<Session, StoreError> {
        // Single statement: readers never observe one token without the other.
        let query = r"
            UPDATE sessions SET
                access_token = $2,
                refresh_token = $3,
                access_token_expires_at = $4,
                refresh_token_expires_at = $5,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *";
        let row = sqlx::query(query)
            .bind(id)
            .bind(tokens.access_token())
            .bind(tokens.refresh_token())
            .bind(tokens.access_token_expires_at())
            .bind(tokens.refresh_token_expires_at())
            .fetch_optional(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .map_err(|err| write_error("session", err))?;
        let row = row.ok_or(StoreError::NotFound("session"))?;
        Ok(Session::from_row(&row)?)
    }

    #[instrument(skip(self))]
    async fn delete_session(&self, id: Uuid) -> Result<Session, StoreError> {
        let query = "DELETE FROM sessions WHERE id = $1 RETURNING *";
        let session = sqlx::query_as::<_, Session>(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("DELETE", query))
            .await?;
        session.ok_or(StoreError::NotFound("session"))
    }

    async fn delete_sessions_by_user(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let query = "DELETE FROM sessions WHERE user_id = $1";
        let result = sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    /// All three rows in one transaction; nothing is left behind on failure.
    #[instrument(skip(self, account), fields(user_id = %account.user.id))]
    async fn create_account(
        &self,
        account: &NewAccount,
    ) -> Result<(User, Identity, Session), StoreError> {
        let mut tx = self.pool.begin().await?;

        let user = insert_user(&mut *tx, &account.user).await?;
        let identity = insert_identity(&mut *tx, &account.identity).await?;
        let session = insert_session(&mut *tx, &account.session).await?;

        tx.commit().await?;

        Ok((user, identity, session))
    }
}
