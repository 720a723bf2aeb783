use super::{
    validate, AuthError, AuthUsecase, ClientInfo, LoginRequest, SignUpRequest, TokenConfig,
    TokenConfigError,
};
use crate::{
    security::PasswordHasher,
    store::{
        CredentialStore, NewAccount, NewIdentity, NewSession, NewUser, StoreError, TokenPair, User,
        PROVIDER_LOCAL,
    },
    token::{Claims, TokenAuthenticator},
};
use async_trait::async_trait;
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// [`AuthUsecase`] over a store, a password hasher, and a token authenticator.
pub struct AuthEngine<S, H, T> {
    store: Arc<S>,
    hasher: Arc<H>,
    tokens: T,
    config: TokenConfig,
}

impl<S, H, T> AuthEngine<S, H, T>
where
    S: CredentialStore,
    H: PasswordHasher,
    T: TokenAuthenticator,
{
    /// # Errors
    /// Returns an error if the token configuration is inconsistent.
    pub fn new(
        store: Arc<S>,
        hasher: Arc<H>,
        tokens: T,
        config: TokenConfig,
    ) -> Result<Self, TokenConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            hasher,
            tokens,
            config,
        })
    }

    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn hash_password(&self, password: SecretString) -> Result<String, AuthError> {
        let hasher = Arc::clone(&self.hasher);
        let hash = tokio::task::spawn_blocking(move || hasher.hash(password.expose_secret()))
            .await
            .map_err(|err| AuthError::Internal(format!("hashing task failed: {err}")))??;
        Ok(hash)
    }

    async fn verify_password(
        &self,
        password: SecretString,
        encoded: String,
    ) -> Result<bool, AuthError> {
        let hasher = Arc::clone(&self.hasher);
        let matches =
            tokio::task::spawn_blocking(move || hasher.verify(password.expose_secret(), &encoded))
                .await
                .map_err(|err| AuthError::Internal(format!("verification task failed: {err}")))??;
        Ok(matches)
    }

    fn sign(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
        secret: &SecretString,
    ) -> Result<(String, DateTime<Utc>), AuthError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|err| AuthError::Internal(format!("token ttl out of range: {err}")))?;
        let expires_at = now + ttl;
        let claims = Claims {
            sub: user_id.to_string(),
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Some(Uuid::new_v4().to_string()),
        };
        let token = self.tokens.generate(&claims, secret)?;
        Ok((token, expires_at))
    }

    /// Mint an access/refresh pair for `user_id`.
    fn issue_tokens(&self, user_id: Uuid) -> Result<TokenPair, AuthError> {
        let now = Utc::now();
        let (access, access_expires_at) =
            self.sign(user_id, now, self.config.access_ttl, &self.config.access_secret)?;
        let (refresh, refresh_expires_at) =
            self.sign(user_id, now, self.config.refresh_ttl, &self.config.refresh_secret)?;

        TokenPair::new(access, refresh, access_expires_at, refresh_expires_at)
            .map_err(|err| AuthError::Internal(err.to_string()))
    }

    fn new_session(user_id: Uuid, tokens: TokenPair, client: ClientInfo) -> NewSession {
        NewSession {
            id: Uuid::now_v7(),
            user_id,
            tokens,
            ip_address: client.ip_address,
            user_agent: client.user_agent,
        }
    }

    async fn touch_local_identity(&self, user: &User) -> Result<(), AuthError> {
        match self
            .store
            .get_identity_by_provider(PROVIDER_LOCAL, &user.email)
            .await?
        {
            Some(identity) => {
                match self.store.update_last_login(identity.id, Utc::now()).await {
                    Ok(()) => {}
                    Err(StoreError::NotFound(_)) => {
                        warn!(user_id = %user.id, "local identity vanished before last login update");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            None => warn!(user_id = %user.id, "user has no local identity"),
        }
        Ok(())
    }

    /// Put `tokens` on the user's latest session, or open one.
    async fn store_session(
        &self,
        user_id: Uuid,
        tokens: &TokenPair,
        client: ClientInfo,
    ) -> Result<(), AuthError> {
        if let Some(session) = self.store.get_session_by_user(user_id).await? {
            match self.store.replace_tokens(session.id, tokens).await {
                Ok(_) => {
                    debug!(session_id = %session.id, "session tokens replaced");
                    return Ok(());
                }
                // Revoked concurrently; fall through and open a new one.
                Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let session = self
            .store
            .create_session(&Self::new_session(user_id, tokens.clone(), client))
            .await?;
        debug!(session_id = %session.id, "session created");
        Ok(())
    }
}

/// Random URL-safe code for email verification links.
fn generate_verification_code() -> Result<String, AuthError> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| AuthError::Internal(format!("failed to generate verification code: {err}")))?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

#[async_trait]
impl<S, H, T> AuthUsecase for AuthEngine<S, H, T>
where
    S: CredentialStore,
    H: PasswordHasher,
    T: TokenAuthenticator,
{
    #[instrument(skip_all)]
    async fn login(&self, request: LoginRequest) -> Result<TokenPair, AuthError> {
        let email = validate::login(&request.email, &request.password)?;

        let Some(user) = self.store.get_user_by_email(&email).await? else {
            info!("login for unknown email");
            return Err(AuthError::UserNotFound);
        };

        if !self
            .verify_password(request.password, user.password_hash.clone())
            .await?
        {
            info!(user_id = %user.id, "login with invalid credentials");
            return Err(AuthError::InvalidCredentials);
        }

        self.touch_local_identity(&user).await?;

        let tokens = self.issue_tokens(user.id)?;
        self.store_session(user.id, &tokens, request.client).await?;

        info!(user_id = %user.id, "login succeeded");
        Ok(tokens)
    }

    #[instrument(skip_all)]
    async fn sign_up(&self, request: SignUpRequest) -> Result<TokenPair, AuthError> {
        let (email, full_name) =
            validate::sign_up(&request.email, &request.password, &request.full_name)?;

        if self.store.get_user_by_email(&email).await?.is_some() {
            info!("sign-up for existing email");
            return Err(AuthError::UserAlreadyExists);
        }

        let password_hash = self.hash_password(request.password).await?;
        let user_id = Uuid::now_v7();
        let tokens = self.issue_tokens(user_id)?;
        let now = Utc::now();

        let account = NewAccount {
            user: NewUser {
                id: user_id,
                full_name,
                email: email.clone(),
                password_hash,
                verification_code: generate_verification_code()?,
            },
            identity: NewIdentity::local(user_id, &email, now),
            session: Self::new_session(user_id, tokens.clone(), request.client),
        };

        match self.store.create_account(&account).await {
            Ok(_) => {
                info!(%user_id, "user signed up");
                Ok(tokens)
            }
            // Lost the race against a concurrent sign-up.
            Err(StoreError::Conflict { entity, constraint }) => {
                info!(entity, %constraint, "sign-up rejected by uniqueness constraint");
                Err(AuthError::UserAlreadyExists)
            }
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(skip_all)]
    async fn revoke_session(&self, refresh_token: &str) -> Result<(), AuthError> {
        validate::refresh_token(refresh_token)?;

        let claims = self
            .tokens
            .validate(refresh_token, &self.config.refresh_secret)
            .map_err(|err| {
                debug!("refresh token rejected: {err}");
                AuthError::InvalidCredentials
            })?;

        let session = self
            .store
            .get_session_by_refresh_token(refresh_token)
            .await?
            .ok_or(AuthError::SessionNotFound)?;

        if session.user_id.to_string() != claims.sub {
            warn!(session_id = %session.id, "refresh token subject does not own the session");
            return Err(AuthError::InvalidCredentials);
        }

        match self.store.delete_session(session.id).await {
            Ok(_) => {
                info!(session_id = %session.id, user_id = %session.user_id, "session revoked");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Err(AuthError::SessionNotFound),
            Err(err) => Err(err.into()),
        }
    }
}
