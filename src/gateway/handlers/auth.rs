use super::{client_info, SharedAuthClient};
use crate::{
    auth::{validate, LoginRequest, SignUpRequest},
    gateway::envelope::{malformed_body, ApiError, ErrorResponse, LogoutResponse, TokenResponse},
};
use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::{HeaderMap, StatusCode},
    Json,
};
use secrecy::SecretString;
use serde::Deserialize;
use tracing::{info, instrument};
use utoipa::ToSchema;

#[derive(ToSchema, Deserialize)]
pub struct SignUpBody {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    full_name: String,
}

#[derive(ToSchema, Deserialize)]
pub struct LoginBody {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

#[derive(ToSchema, Deserialize)]
pub struct LogoutBody {
    #[serde(default)]
    refresh_token: String,
}

#[utoipa::path(
    post,
    path = "/auth/signup",
    request_body = SignUpBody,
    responses(
        (status = 201, description = "Account created, tokens issued", body = TokenResponse),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 409, description = "Email already registered", body = ErrorResponse),
        (status = 503, description = "Auth service unavailable", body = ErrorResponse)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn signup(
    client: Extension<SharedAuthClient>,
    headers: HeaderMap,
    payload: Result<Json<SignUpBody>, JsonRejection>,
) -> Result<(StatusCode, Json<TokenResponse>), ApiError> {
    let Json(body) = payload.map_err(|e| malformed_body(&e.body_text()))?;
    let password = SecretString::from(body.password);
    let (email, full_name) = validate::sign_up(&body.email, &password, &body.full_name)?;

    let tokens = client
        .sign_up(SignUpRequest {
            email,
            password,
            full_name,
            client: client_info(&headers),
        })
        .await?;

    info!("account created");
    Ok((StatusCode::CREATED, Json(TokenResponse::new(tokens))))
}

#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginBody,
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 401, description = "Wrong password", body = ErrorResponse),
        (status = 404, description = "Unknown email", body = ErrorResponse),
        (status = 503, description = "Auth service unavailable", body = ErrorResponse)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn login(
    client: Extension<SharedAuthClient>,
    headers: HeaderMap,
    payload: Result<Json<LoginBody>, JsonRejection>,
) -> Result<Json<TokenResponse>, ApiError> {
    let Json(body) = payload.map_err(|e| malformed_body(&e.body_text()))?;
    let password = SecretString::from(body.password);
    let email = validate::login(&body.email, &password)?;

    let tokens = client
        .login(LoginRequest {
            email,
            password,
            client: client_info(&headers),
        })
        .await?;

    Ok(Json(TokenResponse::new(tokens)))
}

#[utoipa::path(
    post,
    path = "/auth/logout",
    request_body = LogoutBody,
    responses(
        (status = 200, description = "Session revoked", body = LogoutResponse),
        (status = 400, description = "Missing refresh token", body = ErrorResponse),
        (status = 401, description = "Refresh token does not verify", body = ErrorResponse),
        (status = 404, description = "No session holds this token", body = ErrorResponse),
        (status = 503, description = "Auth service unavailable", body = ErrorResponse)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn logout(
    client: Extension<SharedAuthClient>,
    payload: Result<Json<LogoutBody>, JsonRejection>,
) -> Result<Json<LogoutResponse>, ApiError> {
    let Json(body) = payload.map_err(|e| malformed_body(&e.body_text()))?;
    let refresh_token = body.refresh_token.trim();
    validate::refresh_token(refresh_token)?;

    client.revoke_session(refresh_token).await?;

    info!("session revoked");
    Ok(Json(LogoutResponse::revoked()))
}
