//! Credential issuance behind a discovery-routed gRPC service.
//!
//! Two processes ship from this crate: the `auth` service, which owns the
//! credential store and registers itself in the service registry, and the
//! stateless `gateway`, which resolves the auth service by name and exposes
//! it over HTTP.

pub mod auth;
pub mod cli;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod rpc;
pub mod security;
pub mod store;
pub mod token;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
