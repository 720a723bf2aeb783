//! JSON envelope: `{data?, error?: {code, message, details?}, timestamp}`.

use crate::{
    auth::ValidationError,
    error::ErrorKind,
    rpc::ConnectorError,
    store::TokenPair,
};
use axum::{
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use utoipa::ToSchema;

fn now() -> String {
    rfc3339(Utc::now())
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: String,
    /// RFC 3339.
    pub access_token_expires_at: String,
    pub refresh_token_expires_at: String,
}

impl From<TokenPair> for TokenData {
    fn from(tokens: TokenPair) -> Self {
        Self {
            access_token_expires_at: rfc3339(tokens.access_token_expires_at()),
            refresh_token_expires_at: rfc3339(tokens.refresh_token_expires_at()),
            access_token: tokens.access_token().to_string(),
            refresh_token: tokens.refresh_token().to_string(),
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TokenResponse {
    pub data: TokenData,
    pub timestamp: String,
}

impl TokenResponse {
    #[must_use]
    pub fn new(tokens: TokenPair) -> Self {
        Self {
            data: tokens.into(),
            timestamp: now(),
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LogoutData {
    pub revoked: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LogoutResponse {
    pub data: LogoutData,
    pub timestamp: String,
}

impl LogoutResponse {
    #[must_use]
    pub fn revoked() -> Self {
        Self {
            data: LogoutData { revoked: true },
            timestamp: now(),
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FieldDetail {
    pub field: String,
    pub message: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldDetail>>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: ErrorBody,
    pub timestamp: String,
}

/// Error leaving a handler, already classified.
#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
    details: Option<Vec<FieldDetail>>,
}

impl ApiError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        let details = err
            .fields()
            .iter()
            .map(|f| FieldDetail {
                field: f.field.to_string(),
                message: f.message.to_string(),
            })
            .collect();
        Self {
            kind: ErrorKind::Validation,
            message: "request validation failed".to_string(),
            details: Some(details),
        }
    }
}

impl From<ConnectorError> for ApiError {
    fn from(err: ConnectorError) -> Self {
        let kind = err.kind();
        let message = match kind {
            ErrorKind::Store | ErrorKind::Internal => {
                error!("auth service call failed: {err}");
                "internal error".to_string()
            }
            ErrorKind::Unavailable => {
                warn!("auth service unavailable: {err}");
                "auth service unavailable".to_string()
            }
            _ => {
                debug!("auth service rejected request: {err}");
                err.to_string()
            }
        };
        Self::new(kind, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, status) = self.kind.presentation();
        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: self.message,
                details: self.details,
            },
            timestamp: now(),
        };
        (status, Json(body)).into_response()
    }
}

/// 400 for a body that is not the expected JSON.
#[must_use]
pub fn malformed_body(reason: &str) -> ApiError {
    debug!("malformed request body: {reason}");
    ApiError::new(ErrorKind::Validation, "malformed JSON body")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tonic::Code;

    async fn body_json(response: Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn validation_errors_carry_field_details() {
        let err = ValidationError::single("email", "invalid email address");
        let (status, body) = body_json(ApiError::from(err).into_response()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], codes::VALIDATION);
        assert_eq!(body["error"]["details"][0]["field"], "email");
        assert!(body["timestamp"].is_string());
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn remote_errors_map_by_kind_only() {
        let cases = [
            (Code::Unauthenticated, StatusCode::UNAUTHORIZED, codes::UNAUTHORIZED),
            (Code::NotFound, StatusCode::NOT_FOUND, codes::NOT_FOUND),
            (Code::AlreadyExists, StatusCode::CONFLICT, codes::CONFLICT),
            (Code::InvalidArgument, StatusCode::BAD_REQUEST, codes::VALIDATION),
            (Code::Internal, StatusCode::INTERNAL_SERVER_ERROR, codes::INTERNAL),
        ];
        for (code, status, presentation) in cases {
            let err = ConnectorError::Remote {
                code,
                message: "remote says no".to_string(),
            };
            let (got, body) = body_json(ApiError::from(err).into_response()).await;
            assert_eq!(got, status, "{code:?}");
            assert_eq!(body["error"]["code"], presentation);
            assert!(body["error"].get("details").is_none());
        }
    }

    #[tokio::test]
    async fn internal_and_unavailable_messages_are_generic() {
        let err = ConnectorError::Remote {
            code: Code::Internal,
            message: "duplicate key value violates unique constraint".to_string(),
        };
        let (_, body) = body_json(ApiError::from(err).into_response()).await;
        assert_eq!(body["error"]["message"], "internal error");

        let err = ConnectorError::Unavailable("tcp connect error 10.0.0.5:50051".to_string());
        let (status, body) = body_json(ApiError::from(err).into_response()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], codes::UNAVAILABLE);
        assert_eq!(body["error"]["message"], "auth service unavailable");
    }
}
