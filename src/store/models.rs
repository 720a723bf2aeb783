use super::StoreError;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, Row};
use uuid::Uuid;

/// Provider discriminator for email/password identities.
pub const PROVIDER_LOCAL: &str = "local";

/// Page size used by [`super::UserStore::list_users`] when no limit is given.
pub const DEFAULT_PAGE_SIZE: u32 = 10;

#[derive(Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub full_name: String,
    /// Normalized (trimmed, lowercased) and unique.
    pub email: String,
    pub password_hash: String,
    pub verified: bool,
    pub verification_code: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Hash and verification code stay out of logs.
impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("full_name", &self.full_name)
            .field("email", &self.email)
            .field("verified", &self.verified)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish_non_exhaustive()
    }
}

impl<'r> FromRow<'r, PgRow> for User {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            full_name: row.try_get("full_name")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            verified: row.try_get("verified")?,
            verification_code: row.try_get("verification_code")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub password_hash: String,
    pub verification_code: String,
}

/// Partial update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdateUserParams {
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub verified: Option<bool>,
}

impl UpdateUserParams {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none()
            && self.email.is_none()
            && self.password_hash.is_none()
            && self.verified.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UserSortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    Email,
    FullName,
}

impl UserSortField {
    /// Column name; never derived from caller input.
    #[must_use]
    pub const fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::Email => "email",
            Self::FullName => "full_name",
        }
    }
}

/// Filter, sort, and paginate users. A `limit` of `0` means [`DEFAULT_PAGE_SIZE`].
#[derive(Debug, Clone, Default)]
pub struct FilterUserParams {
    pub email: Option<String>,
    pub verified: Option<bool>,
    pub limit: u32,
    pub offset: u32,
    pub sort_by: UserSortField,
    pub sort_desc: bool,
}

impl FilterUserParams {
    #[must_use]
    pub const fn effective_limit(&self) -> u32 {
        if self.limit == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.limit
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_id: String,
    pub provider: String,
    pub email: String,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for Identity {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            provider_id: row.try_get("provider_id")?,
            provider: row.try_get("provider")?,
            email: row.try_get("email")?,
            last_login_at: row.try_get("last_login_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_id: String,
    pub provider: String,
    pub email: String,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl NewIdentity {
    /// Email/password identity: the provider account id is the email itself.
    #[must_use]
    pub fn local(user_id: Uuid, email: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            provider_id: email.to_string(),
            provider: PROVIDER_LOCAL.to_string(),
            email: email.to_string(),
            last_login_at: Some(now),
        }
    }
}

/// Issued access/refresh pair.
///
/// The access token always expires strictly before the refresh token; the
/// only constructor enforces it.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    access_token: String,
    refresh_token: String,
    access_token_expires_at: DateTime<Utc>,
    refresh_token_expires_at: DateTime<Utc>,
}

impl TokenPair {
    /// # Errors
    /// Returns [`StoreError::InvalidInput`] when the access token does not expire
    /// before the refresh token.
    pub fn new(
        access_token: String,
        refresh_token: String,
        access_token_expires_at: DateTime<Utc>,
        refresh_token_expires_at: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        if access_token_expires_at >= refresh_token_expires_at {
            return Err(StoreError::InvalidInput(
                "access token must expire before refresh token".to_string(),
            ));
        }
        Ok(Self {
            access_token,
            refresh_token,
            access_token_expires_at,
            refresh_token_expires_at,
        })
    }

    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    #[must_use]
    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    #[must_use]
    pub const fn access_token_expires_at(&self) -> DateTime<Utc> {
        self.access_token_expires_at
    }

    #[must_use]
    pub const fn refresh_token_expires_at(&self) -> DateTime<Utc> {
        self.refresh_token_expires_at
    }
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token_expires_at", &self.access_token_expires_at)
            .field("refresh_token_expires_at", &self.refresh_token_expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// True when this session currently holds exactly `tokens`.
    #[must_use]
    pub fn holds(&self, tokens: &TokenPair) -> bool {
        self.access_token == tokens.access_token && self.refresh_token == tokens.refresh_token
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("access_token_expires_at", &self.access_token_expires_at)
            .field("refresh_token_expires_at", &self.refresh_token_expires_at)
            .field("ip_address", &self.ip_address)
            .field("user_agent", &self.user_agent)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish_non_exhaustive()
    }
}

impl<'r> FromRow<'r, PgRow> for Session {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            access_token: row.try_get("access_token")?,
            refresh_token: row.try_get("refresh_token")?,
            access_token_expires_at: row.try_get("access_token_expires_at")?,
            refresh_token_expires_at: row.try_get("refresh_token_expires_at")?,
            ip_address: row.try_get("ip_address")?,
            user_agent: row.try_get("user_agent")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tokens: TokenPair,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Everything SignUp persists in one unit.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub user: NewUser,
    pub identity: NewIdentity,
    pub session: NewSession,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn token_pair_requires_access_to_expire_first() {
        let now = Utc::now();
        let ok = TokenPair::new(
            "a".into(),
            "r".into(),
            now + Duration::minutes(15),
            now + Duration::days(7),
        );
        assert!(ok.is_ok());

        for refresh_at in [now + Duration::minutes(15), now + Duration::minutes(1)] {
            let err = TokenPair::new("a".into(), "r".into(), now + Duration::minutes(15), refresh_at);
            assert!(matches!(err, Err(StoreError::InvalidInput(_))));
        }
    }

    #[test]
    fn debug_output_hides_secrets() {
        let now = Utc::now();
        let pair = TokenPair::new(
            "access-secret-value".into(),
            "refresh-secret-value".into(),
            now,
            now + Duration::seconds(1),
        );
        let rendered = format!("{pair:?}");
        assert!(!rendered.contains("secret-value"));

        let user = User {
            id: Uuid::nil(),
            full_name: "Ann".into(),
            email: "a@x.com".into(),
            password_hash: "$argon2id$hidden".into(),
            verified: false,
            verification_code: "code-hidden".into(),
            created_at: now,
            updated_at: now,
        };
        let rendered = format!("{user:?}");
        assert!(rendered.contains("a@x.com"));
        assert!(!rendered.contains("hidden"));
    }

    #[test]
    fn filter_defaults_to_ten_by_created_at() {
        let params = FilterUserParams::default();
        assert_eq!(params.effective_limit(), DEFAULT_PAGE_SIZE);
        assert_eq!(params.sort_by.column(), "created_at");

        let params = FilterUserParams {
            limit: 25,
            ..FilterUserParams::default()
        };
        assert_eq!(params.effective_limit(), 25);
    }

    #[test]
    fn local_identity_uses_email_as_provider_id() {
        let user_id = Uuid::now_v7();
        let now = Utc::now();
        let identity = NewIdentity::local(user_id, "a@x.com", now);
        assert_eq!(identity.provider, PROVIDER_LOCAL);
        assert_eq!(identity.provider_id, "a@x.com");
        assert_eq!(identity.last_login_at, Some(now));
        assert_eq!(identity.user_id, user_id);
    }

    #[test]
    fn update_params_empty() {
        assert!(UpdateUserParams::default().is_empty());
        assert!(!UpdateUserParams {
            verified: Some(true),
            ..UpdateUserParams::default()
        }
        .is_empty());
    }
}
