//! Error taxonomy shared by every boundary.
//!
//! Each layer owns a closed error enum (`HashError`, `TokenError`, `StoreError`,
//! `AuthError`, `RegistryError`, `ConnectorError`) and classifies itself with
//! [`ErrorKind`]. The translation table below is the only place where a kind is
//! turned into a transport status or a presentation code, so the RPC boundary
//! maps exactly once and the gateway only formats.

use axum::http::StatusCode;
use tonic::Code;

/// Presentation codes used in the gateway JSON envelope.
pub mod codes {
    pub const VALIDATION: &str = "VALIDATION_ERROR";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const CONFLICT: &str = "CONFLICT";
    pub const INTERNAL: &str = "INTERNAL_ERROR";
    pub const UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input; the caller can fix it and retry.
    Validation,
    InvalidCredentials,
    NotFound,
    AlreadyExists,
    /// Persistence fault.
    Store,
    /// Registry or connection fault; eligible for retry with backoff.
    Unavailable,
    Internal,
}

impl ErrorKind {
    /// Domain -> transport.
    #[must_use]
    pub const fn grpc_code(self) -> Code {
        match self {
            Self::Validation => Code::InvalidArgument,
            Self::InvalidCredentials => Code::Unauthenticated,
            Self::NotFound => Code::NotFound,
            Self::AlreadyExists => Code::AlreadyExists,
            Self::Unavailable => Code::Unavailable,
            Self::Store | Self::Internal => Code::Internal,
        }
    }

    /// Transport -> domain, used on the client side of the RPC boundary.
    #[must_use]
    pub const fn from_grpc_code(code: Code) -> Self {
        match code {
            Code::InvalidArgument => Self::Validation,
            Code::Unauthenticated => Self::InvalidCredentials,
            Code::NotFound => Self::NotFound,
            Code::AlreadyExists => Self::AlreadyExists,
            Code::Unavailable | Code::DeadlineExceeded => Self::Unavailable,
            _ => Self::Internal,
        }
    }

    /// Presentation code and HTTP status.
    #[must_use]
    pub const fn presentation(self) -> (&'static str, StatusCode) {
        match self {
            Self::Validation => (codes::VALIDATION, StatusCode::BAD_REQUEST),
            Self::InvalidCredentials => (codes::UNAUTHORIZED, StatusCode::UNAUTHORIZED),
            Self::NotFound => (codes::NOT_FOUND, StatusCode::NOT_FOUND),
            Self::AlreadyExists => (codes::CONFLICT, StatusCode::CONFLICT),
            Self::Unavailable => (codes::UNAVAILABLE, StatusCode::SERVICE_UNAVAILABLE),
            Self::Store | Self::Internal => (codes::INTERNAL, StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// Expected business outcomes are not failures and are not logged as such.
    #[must_use]
    pub const fn is_business_outcome(self) -> bool {
        matches!(
            self,
            Self::Validation | Self::InvalidCredentials | Self::NotFound | Self::AlreadyExists
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_transport_and_presentation() {
        let rows = [
            (ErrorKind::InvalidCredentials, Code::Unauthenticated, StatusCode::UNAUTHORIZED),
            (ErrorKind::NotFound, Code::NotFound, StatusCode::NOT_FOUND),
            (ErrorKind::AlreadyExists, Code::AlreadyExists, StatusCode::CONFLICT),
            (ErrorKind::Validation, Code::InvalidArgument, StatusCode::BAD_REQUEST),
            (ErrorKind::Store, Code::Internal, StatusCode::INTERNAL_SERVER_ERROR),
            (ErrorKind::Internal, Code::Internal, StatusCode::INTERNAL_SERVER_ERROR),
            (ErrorKind::Unavailable, Code::Unavailable, StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (kind, code, status) in rows {
            assert_eq!(kind.grpc_code(), code, "{kind:?}");
            assert_eq!(kind.presentation().1, status, "{kind:?}");
        }
    }

    #[test]
    fn client_side_mapping_inverts_transport_codes() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::InvalidCredentials,
            ErrorKind::NotFound,
            ErrorKind::AlreadyExists,
            ErrorKind::Unavailable,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::from_grpc_code(kind.grpc_code()), kind);
        }
        // Store faults are indistinguishable from internal ones once they leave the service.
        assert_eq!(
            ErrorKind::from_grpc_code(ErrorKind::Store.grpc_code()),
            ErrorKind::Internal
        );
        assert_eq!(ErrorKind::from_grpc_code(Code::DeadlineExceeded), ErrorKind::Unavailable);
        assert_eq!(ErrorKind::from_grpc_code(Code::Unknown), ErrorKind::Internal);
    }

    #[test]
    fn business_outcomes_are_not_failures() {
        assert!(ErrorKind::AlreadyExists.is_business_outcome());
        assert!(ErrorKind::InvalidCredentials.is_business_outcome());
        assert!(!ErrorKind::Store.is_business_outcome());
        assert!(!ErrorKind::Unavailable.is_business_outcome());
    }
}
