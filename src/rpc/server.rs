use super::{pb, AUTH_SERVICE_NAME};
use crate::{
    auth::{AuthError, AuthUsecase, ClientInfo, LoginRequest, SignUpRequest},
    error::ErrorKind,
    store::TokenPair,
};
use secrecy::SecretString;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{transport::Server, Request, Response, Status};
use tonic_health::{
    pb::health_server::{Health, HealthServer},
    server::HealthReporter,
    ServingStatus,
};
use tracing::{debug, error, info, instrument, warn};

/// gRPC adapter: decodes requests, calls the use case, maps errors once.
pub struct AuthGrpcService<U> {
    usecase: Arc<U>,
}

impl<U: AuthUsecase> AuthGrpcService<U> {
    #[must_use]
    pub fn new(usecase: Arc<U>) -> Self {
        Self { usecase }
    }

    #[must_use]
    pub fn into_server(self) -> pb::auth_service_server::AuthServiceServer<Self> {
        pb::auth_service_server::AuthServiceServer::new(self)
    }
}

fn to_status(err: &AuthError) -> Status {
    let kind = err.kind();
    if kind.is_business_outcome() {
        debug!(kind = ?kind, "request rejected: {err}");
    } else {
        error!(kind = ?kind, "request failed: {err}");
    }

    let message = match kind {
        ErrorKind::Store | ErrorKind::Internal => "internal error".to_string(),
        _ => err.to_string(),
    };
    Status::new(kind.grpc_code(), message)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn client_info(
    client_ip: Option<String>,
    user_agent: Option<String>,
    remote: Option<SocketAddr>,
) -> ClientInfo {
    ClientInfo {
        ip_address: non_empty(client_ip).or_else(|| remote.map(|addr| addr.ip().to_string())),
        user_agent: non_empty(user_agent),
    }
}

struct Issued {
    access_token: String,
    refresh_token: String,
    access_token_expires_at: i64,
    refresh_token_expires_at: i64,
}

impl From<TokenPair> for Issued {
    fn from(tokens: TokenPair) -> Self {
        Self {
            access_token_expires_at: tokens.access_token_expires_at().timestamp(),
            refresh_token_expires_at: tokens.refresh_token_expires_at().timestamp(),
            access_token: tokens.access_token().to_string(),
            refresh_token: tokens.refresh_token().to_string(),
        }
    }
}

#[tonic::async_trait]
impl<U: AuthUsecase> pb::auth_service_server::AuthService for AuthGrpcService<U> {
    #[instrument(skip_all, fields(rpc.method = "Login"))]
    async fn login(
        &self,
        request: Request<pb::LoginRequest>,
    ) -> Result<Response<pb::LoginResponse>, Status> {
        let remote = request.remote_addr();
        let req = request.into_inner();
        let login = LoginRequest {
            email: req.email,
            password: SecretString::from(req.password),
            client: client_info(req.client_ip, req.user_agent, remote),
        };

        let issued = Issued::from(self.usecase.login(login).await.map_err(|e| to_status(&e))?);
        Ok(Response::new(pb::LoginResponse {
            access_token: issued.access_token,
            refresh_token: issued.refresh_token,
            access_token_expires_at: issued.access_token_expires_at,
            refresh_token_expires_at: issued.refresh_token_expires_at,
        }))
    }

    #[instrument(skip_all, fields(rpc.method = "SignUp"))]
    async fn sign_up(
        &self,
        request: Request<pb::SignUpRequest>,
    ) -> Result<Response<pb::SignUpResponse>, Status> {
        let remote = request.remote_addr();
        let req = request.into_inner();
        let sign_up = SignUpRequest {
            email: req.email,
            password: SecretString::from(req.password),
            full_name: req.full_name,
            client: client_info(req.client_ip, req.user_agent, remote),
        };

        let issued = Issued::from(self.usecase.sign_up(sign_up).await.map_err(|e| to_status(&e))?);
        Ok(Response::new(pb::SignUpResponse {
            access_token: issued.access_token,
            refresh_token: issued.refresh_token,
            access_token_expires_at: issued.access_token_expires_at,
            refresh_token_expires_at: issued.refresh_token_expires_at,
        }))
    }

    #[instrument(skip_all, fields(rpc.method = "RevokeSession"))]
    async fn revoke_session(
        &self,
        request: Request<pb::RevokeSessionRequest>,
    ) -> Result<Response<pb::RevokeSessionResponse>, Status> {
        let req = request.into_inner();
        self.usecase
            .revoke_session(&req.refresh_token)
            .await
            .map_err(|e| to_status(&e))?;
        Ok(Response::new(pb::RevokeSessionResponse {}))
    }
}

/// Report the server and the auth service as serving.
pub async fn mark_serving(reporter: &HealthReporter) {
    // Clones share the same status map; `set_service_status` needs `&mut`.
    let mut reporter = reporter.clone();
    reporter.set_service_status("", ServingStatus::Serving).await;
    reporter
        .set_service_status(AUTH_SERVICE_NAME, ServingStatus::Serving)
        .await;
}

/// Fail health checks so the registry stops routing here before shutdown.
pub async fn mark_not_serving(reporter: &HealthReporter) {
    let mut reporter = reporter.clone();
    reporter
        .set_service_status(AUTH_SERVICE_NAME, ServingStatus::NotServing)
        .await;
    reporter.set_service_status("", ServingStatus::NotServing).await;
}

/// Serve the auth and health services on `listener` until `shutdown` fires.
///
/// After cancellation no new connections are accepted; in-flight calls get
/// `grace` to finish before the server future is dropped.
///
/// # Errors
/// Returns an error if the transport fails.
pub async fn serve<U, H>(
    listener: TcpListener,
    usecase: Arc<U>,
    health: HealthServer<H>,
    shutdown: CancellationToken,
    grace: Duration,
) -> Result<(), tonic::transport::Error>
where
    U: AuthUsecase,
    H: Health,
{
    if let Ok(addr) = listener.local_addr() {
        info!("gRPC listening on {addr}");
    }

    let signal = shutdown.clone();
    let server = Server::builder()
        .add_service(health)
        .add_service(AuthGrpcService::new(usecase).into_server())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            signal.cancelled().await;
        });
    tokio::pin!(server);

    let deadline = async {
        shutdown.cancelled().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = &mut server => result?,
        () = deadline => warn!("shutdown grace of {grace:?} elapsed, dropping in-flight calls"),
    }

    info!("gRPC server stopped");
    Ok(())
}
