use super::pb::{self, auth_service_client::AuthServiceClient};
use crate::{
    auth::{LoginRequest, SignUpRequest},
    discovery::{resolve, PickedEndpoint, ServicePool, ServiceRegistry},
    error::ErrorKind,
    store::TokenPair,
};
use async_trait::async_trait;
use chrono::DateTime;
use secrecy::ExposeSecret;
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::{transport::Channel, Code, Request, Response, Status};
use tracing::{debug, instrument, warn};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("auth service unavailable: {0}")]
    Unavailable(String),
    #[error("{message}")]
    Remote { code: Code, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ConnectorError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Remote { code, .. } => ErrorKind::from_grpc_code(*code),
            Self::InvalidResponse(_) => ErrorKind::Internal,
        }
    }

    fn from_status(status: &Status) -> Self {
        match status.code() {
            Code::Unavailable => Self::Unavailable(status.message().to_string()),
            code => Self::Remote {
                code,
                message: status.message().to_string(),
            },
        }
    }
}

/// Caller-side view of the auth service.
#[async_trait]
pub trait AuthClient: Send + Sync + 'static {
    async fn login(&self, request: LoginRequest) -> Result<TokenPair, ConnectorError>;
    async fn sign_up(&self, request: SignUpRequest) -> Result<TokenPair, ConnectorError>;
    async fn revoke_session(&self, refresh_token: &str) -> Result<(), ConnectorError>;
}

/// Registry-backed client for one logical service name.
///
/// The pool is resolved on first use; a failed resolution is retried on the
/// next call. Unavailable failures are retried on the next instance with
/// exponential backoff; sign-up and revocation are only retried when no
/// instance could be picked. Deadline and remote errors are returned as-is.
pub struct AuthServiceConnector<R: ?Sized> {
    registry: Arc<R>,
    service_name: String,
    timeout: Duration,
    cancel: CancellationToken,
    pool: OnceCell<ServicePool>,
}

impl<R> AuthServiceConnector<R>
where
    R: ServiceRegistry + ?Sized,
{
    #[must_use]
    pub fn new(registry: Arc<R>, service_name: impl Into<String>) -> Self {
        Self {
            registry,
            service_name: service_name.into(),
            timeout: DEFAULT_CALL_TIMEOUT,
            cancel: CancellationToken::new(),
            pool: OnceCell::new(),
        }
    }

    /// Deadline for one call, retries and backoff included.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.pool.initialized()
    }

    /// Stop the pool's watcher. Safe to call when nothing was ever resolved.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
    }

    async fn pool(&self) -> Result<&ServicePool, ConnectorError> {
        if self.cancel.is_cancelled() {
            return Err(ConnectorError::Unavailable("connector closed".to_string()));
        }
        self.pool
            .get_or_try_init(|| resolve(Arc::clone(&self.registry), &self.service_name, &self.cancel))
            .await
            .map_err(|e| ConnectorError::Unavailable(e.to_string()))
    }

    async fn pick(&self) -> Result<PickedEndpoint, ConnectorError> {
        self.pool()
            .await?
            .pick()
            .map_err(|e| ConnectorError::Unavailable(e.to_string()))
    }

    async fn send<Req, Resp, F, Fut>(
        &self,
        picked: PickedEndpoint,
        request: &Req,
        invoke: &F,
        remaining: Duration,
    ) -> Result<Resp, ConnectorError>
    where
        Req: Clone,
        F: Fn(AuthServiceClient<Channel>, Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Resp>, Status>>,
    {
        debug!(instance = %picked.instance_id, "calling instance");

        let mut request = Request::new(request.clone());
        request.set_timeout(remaining);
        let client = AuthServiceClient::new(picked.channel);

        match tokio::time::timeout(remaining, invoke(client, request)).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(ConnectorError::from_status(&status)),
            Err(_) => Err(self.deadline_exceeded()),
        }
    }

    fn deadline_exceeded(&self) -> ConnectorError {
        ConnectorError::Remote {
            code: Code::DeadlineExceeded,
            message: format!("no response within {:?}", self.timeout),
        }
    }

    /// All attempts share one deadline of `self.timeout`. A request that
    /// reached an instance is only re-sent under [`Retry::Unavailable`].
    async fn call<Req, Resp, F, Fut>(
        &self,
        request: Req,
        retry: Retry,
        invoke: F,
    ) -> Result<Resp, ConnectorError>
    where
        Req: Clone,
        F: Fn(AuthServiceClient<Channel>, Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Resp>, Status>>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempt = 1;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.deadline_exceeded());
            }

            let (result, sent) = match self.pick().await {
                Ok(picked) => (self.send(picked, &request, &invoke, remaining).await, true),
                Err(e) => (Err(e), false),
            };

            match result {
                Err(ConnectorError::Unavailable(message))
                    if attempt < MAX_ATTEMPTS && (!sent || retry == Retry::Unavailable) =>
                {
                    let delay = RETRY_BASE * 2_u32.pow(attempt - 1);
                    if Instant::now() + delay >= deadline {
                        return Err(ConnectorError::Unavailable(message));
                    }
                    warn!(attempt, "auth service unavailable, retrying in {delay:?}: {message}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// Which failures may be re-sent to another instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    /// Any `Unavailable`. Only for calls that are safe to repeat.
    Unavailable,
    /// Only failures before an instance was picked. The server may already
    /// have committed a request whose response was lost.
    BeforeSend,
}

fn token_pair(
    access_token: String,
    refresh_token: String,
    access_expires_at: i64,
    refresh_expires_at: i64,
) -> Result<TokenPair, ConnectorError> {
    let timestamp = |secs: i64| {
        DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| ConnectorError::InvalidResponse(format!("expiry out of range: {secs}")))
    };
    TokenPair::new(
        access_token,
        refresh_token,
        timestamp(access_expires_at)?,
        timestamp(refresh_expires_at)?,
    )
    .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl<R> AuthClient for AuthServiceConnector<R>
where
    R: ServiceRegistry + ?Sized,
{
    #[instrument(skip_all, fields(service = %self.service_name))]
    async fn login(&self, request: LoginRequest) -> Result<TokenPair, ConnectorError> {
        let request = pb::LoginRequest {
            email: request.email,
            password: request.password.expose_secret().to_string(),
            client_ip: request.client.ip_address,
            user_agent: request.client.user_agent,
        };
        let response = self
            .call(request, Retry::Unavailable, |mut client, req| async move {
                client.login(req).await
            })
            .await?;
        token_pair(
            response.access_token,
            response.refresh_token,
            response.access_token_expires_at,
            response.refresh_token_expires_at,
        )
    }

    #[instrument(skip_all, fields(service = %self.service_name))]
    async fn sign_up(&self, request: SignUpRequest) -> Result<TokenPair, ConnectorError> {
        let request = pb::SignUpRequest {
            email: request.email,
            password: request.password.expose_secret().to_string(),
            full_name: request.full_name,
            client_ip: request.client.ip_address,
            user_agent: request.client.user_agent,
        };
        let response = self
            .call(request, Retry::BeforeSend, |mut client, req| async move {
                client.sign_up(req).await
            })
            .await?;
        token_pair(
            response.access_token,
            response.refresh_token,
            response.access_token_expires_at,
            response.refresh_token_expires_at,
        )
    }

    #[instrument(skip_all, fields(service = %self.service_name))]
    async fn revoke_session(&self, refresh_token: &str) -> Result<(), ConnectorError> {
        let request = pb::RevokeSessionRequest {
            refresh_token: refresh_token.to_string(),
        };
        self.call(request, Retry::BeforeSend, |mut client, req| async move {
            client.revoke_session(req).await
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ClientInfo;
    use crate::discovery::{CheckStatus, HealthCheckSpec, HealthProbe, LocalRegistry, ServiceInstance};
    use crate::rpc::pb::auth_service_server::{AuthService, AuthServiceServer};
    use secrecy::SecretString;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::transport::Server;

    struct AlwaysUp;

    #[async_trait]
    impl HealthProbe for AlwaysUp {
        async fn check(&self, _instance: &ServiceInstance) -> bool {
            true
        }
    }

    fn login() -> LoginRequest {
        LoginRequest {
            email: "a@b.co".to_string(),
            password: SecretString::from("secret123".to_string()),
            client: ClientInfo::default(),
        }
    }

    fn sign_up() -> SignUpRequest {
        SignUpRequest {
            email: "a@b.co".to_string(),
            password: SecretString::from("secret123".to_string()),
            full_name: "Ann".to_string(),
            client: ClientInfo::default(),
        }
    }

    /// Answers like a server whose responses get lost on the way back.
    #[derive(Default)]
    struct LossyAuth {
        sign_ups: AtomicUsize,
        revokes: AtomicUsize,
        logins: AtomicUsize,
        failing_logins: usize,
        login_delay: Duration,
    }

    #[async_trait]
    impl AuthService for LossyAuth {
        async fn login(
            &self,
            _request: Request<pb::LoginRequest>,
        ) -> Result<Response<pb::LoginResponse>, Status> {
            let seen = self.logins.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.login_delay).await;
            if seen < self.failing_logins {
                return Err(Status::unavailable("connection reset"));
            }
            Ok(Response::new(pb::LoginResponse {
                access_token: "access".to_string(),
                refresh_token: "refresh".to_string(),
                access_token_expires_at: 1_700_000_000,
                refresh_token_expires_at: 1_700_000_900,
            }))
        }

        async fn sign_up(
            &self,
            _request: Request<pb::SignUpRequest>,
        ) -> Result<Response<pb::SignUpResponse>, Status> {
            // The first sign-up commits, then its response is lost.
            if self.sign_ups.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Status::unavailable("connection reset"));
            }
            Err(Status::already_exists("user already exists"))
        }

        async fn revoke_session(
            &self,
            _request: Request<pb::RevokeSessionRequest>,
        ) -> Result<Response<pb::RevokeSessionResponse>, Status> {
            if self.revokes.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Status::unavailable("connection reset"));
            }
            Err(Status::not_found("session not found"))
        }
    }

    async fn lossy_connector(
        service: Arc<LossyAuth>,
    ) -> (Arc<LocalRegistry>, AuthServiceConnector<LocalRegistry>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(
            Server::builder()
                .add_service(AuthServiceServer::from_arc(service))
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );

        let registry = Arc::new(LocalRegistry::new(Arc::new(AlwaysUp)));
        let check = HealthCheckSpec {
            initial_status: CheckStatus::Passing,
            ..HealthCheckSpec::default()
        };
        registry
            .register("auth-1", "auth-service", &addr, &check)
            .await
            .unwrap();
        let connector = AuthServiceConnector::new(registry.clone(), "auth-service");
        (registry, connector)
    }

    async fn closed_port() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[test]
    fn error_kinds_follow_transport_codes() {
        assert_eq!(
            ConnectorError::Unavailable("down".to_string()).kind(),
            ErrorKind::Unavailable
        );
        let remote = |code| ConnectorError::Remote {
            code,
            message: String::new(),
        };
        assert_eq!(remote(Code::NotFound).kind(), ErrorKind::NotFound);
        assert_eq!(remote(Code::Unauthenticated).kind(), ErrorKind::InvalidCredentials);
        assert_eq!(remote(Code::AlreadyExists).kind(), ErrorKind::AlreadyExists);
        assert_eq!(remote(Code::DeadlineExceeded).kind(), ErrorKind::Unavailable);
        assert_eq!(remote(Code::Internal).kind(), ErrorKind::Internal);

        let status = Status::unavailable("connection refused");
        assert!(matches!(
            ConnectorError::from_status(&status),
            ConnectorError::Unavailable(_)
        ));
    }

    #[test]
    fn converts_unix_seconds_into_token_pair() {
        let pair = token_pair("a".to_string(), "r".to_string(), 1_700_000_000, 1_700_000_900).unwrap();
        assert_eq!(pair.access_token_expires_at().timestamp(), 1_700_000_000);
        assert_eq!(pair.refresh_token_expires_at().timestamp(), 1_700_000_900);

        assert!(matches!(
            token_pair("a".to_string(), "r".to_string(), 10, 5),
            Err(ConnectorError::InvalidResponse(_))
        ));
        assert!(matches!(
            token_pair("a".to_string(), "r".to_string(), 0, i64::MAX),
            Err(ConnectorError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn failed_resolution_is_retried_on_next_call() {
        let registry = Arc::new(LocalRegistry::new(Arc::new(AlwaysUp)));
        let connector = AuthServiceConnector::new(registry.clone(), "auth-service");

        let err = connector.login(login()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(!connector.is_resolved());

        let check = HealthCheckSpec {
            initial_status: CheckStatus::Passing,
            ..HealthCheckSpec::default()
        };
        registry
            .register("auth-1", "auth-service", &closed_port().await, &check)
            .await
            .unwrap();

        // Resolves now, then every attempt hits a refused connection.
        let err = connector.login(login()).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Unavailable(_)), "{err:?}");
        assert!(connector.is_resolved());
        connector.close().await;
    }

    #[tokio::test]
    async fn close_without_resolution_and_calls_after_close() {
        let registry = Arc::new(LocalRegistry::new(Arc::new(AlwaysUp)));
        let connector = AuthServiceConnector::new(registry, "auth-service");
        connector.close().await;
        connector.close().await;

        let err = connector.revoke_session("r").await.unwrap_err();
        assert!(matches!(err, ConnectorError::Unavailable(message) if message == "connector closed"));
    }

    #[tokio::test]
    async fn sign_up_is_not_resent_once_delivered() {
        let service = Arc::new(LossyAuth::default());
        let (registry, connector) = lossy_connector(service.clone()).await;

        let err = connector.sign_up(sign_up()).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Unavailable(_)), "{err:?}");
        assert_eq!(service.sign_ups.load(Ordering::SeqCst), 1);

        connector.close().await;
        registry.shutdown();
    }

    #[tokio::test]
    async fn revocation_is_not_resent_once_delivered() {
        let service = Arc::new(LossyAuth::default());
        let (registry, connector) = lossy_connector(service.clone()).await;

        let err = connector.revoke_session("refresh").await.unwrap_err();
        assert!(matches!(err, ConnectorError::Unavailable(_)), "{err:?}");
        assert_eq!(service.revokes.load(Ordering::SeqCst), 1);

        connector.close().await;
        registry.shutdown();
    }

    #[tokio::test]
    async fn login_is_resent_after_unavailable() {
        let service = Arc::new(LossyAuth {
            failing_logins: 1,
            ..LossyAuth::default()
        });
        let (registry, connector) = lossy_connector(service.clone()).await;

        let pair = connector.login(login()).await.unwrap();
        assert_eq!(pair.access_token(), "access");
        assert_eq!(service.logins.load(Ordering::SeqCst), 2);

        connector.close().await;
        registry.shutdown();
    }

    #[tokio::test]
    async fn retries_share_one_deadline() {
        let service = Arc::new(LossyAuth {
            failing_logins: usize::MAX,
            login_delay: Duration::from_millis(100),
            ..LossyAuth::default()
        });
        let (registry, connector) = lossy_connector(service.clone()).await;
        let connector = connector.with_timeout(Duration::from_millis(250));

        let started = Instant::now();
        let err = connector.login(login()).await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.kind(), ErrorKind::Unavailable);
        // Three attempts with fresh deadlines would take at least 600ms.
        assert!(elapsed < Duration::from_millis(450), "took {elapsed:?}");
        assert!(service.logins.load(Ordering::SeqCst) <= 2);

        connector.close().await;
        registry.shutdown();
    }
}
