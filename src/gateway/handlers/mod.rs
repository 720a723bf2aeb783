pub mod auth;
pub mod health;

use crate::{auth::ClientInfo, rpc::AuthClient};
use axum::http::{header::USER_AGENT, HeaderMap};
use std::sync::Arc;

/// Auth service client shared by every handler.
pub type SharedAuthClient = Arc<dyn AuthClient>;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// First `x-forwarded-for` hop, then `x-real-ip`.
pub(crate) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    forwarded
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(str::to_string)
}

pub(crate) fn client_info(headers: &HeaderMap) -> ClientInfo {
    ClientInfo {
        ip_address: extract_client_ip(headers),
        user_agent: header_str(headers, USER_AGENT.as_str()).map(str::to_string),
    }
}
