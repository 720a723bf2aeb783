//! `auth.v1.AuthService` over gRPC: the server adapter around an
//! [`AuthUsecase`](crate::auth::AuthUsecase) and the registry-aware client used
//! by the gateway.

pub mod client;
pub mod server;

pub use client::{AuthClient, AuthServiceConnector, ConnectorError};
pub use server::{mark_not_serving, mark_serving, serve, AuthGrpcService};

pub mod pb {
    #![allow(clippy::all, clippy::pedantic)]
    tonic::include_proto!("auth.v1");
}

/// Service name the health reporter publishes for the auth server.
pub const AUTH_SERVICE_NAME: &str = "auth.v1.AuthService";
