//! Service registration, health checking, and name resolution.
//!
//! An auth-service instance registers itself together with an active gRPC
//! health probe. Instances that stay critical longer than the deregistration
//! grace period are pruned by the registry itself. Callers resolve a logical
//! service name into a [`ServicePool`] that round-robins across the passing
//! instances and follows changes through blocking queries.

pub mod consul;
pub mod local;
pub mod pool;
pub mod probe;

pub use consul::ConsulRegistry;
pub use local::LocalRegistry;
pub use pool::{resolve, PickedEndpoint, ServicePool};
pub use probe::{GrpcHealthProbe, HealthProbe};

use crate::error::ErrorKind;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Tag carried by every RPC-serving registration; resolution filters on it.
pub const SERVICE_TAG: &str = "rpc";

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_DEREGISTER_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid host:port format: {0}")]
    InvalidAddress(String),
    #[error("invalid registry url: {0}")]
    InvalidUrl(String),
    #[error("no healthy instances of {0}")]
    NoHealthyInstances(String),
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("invalid endpoint for instance {instance}: {message}")]
    Endpoint { instance: String, message: String },
}

impl RegistryError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAddress(_) | Self::InvalidUrl(_) => ErrorKind::Validation,
            Self::NoHealthyInstances(_) | Self::Http(_) | Self::Api { .. } | Self::Endpoint { .. } => {
                ErrorKind::Unavailable
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Passing,
    Warning,
    Critical,
}

impl CheckStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passing => "passing",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Active health check attached to a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSpec {
    pub interval: Duration,
    pub timeout: Duration,
    /// How long an instance may stay critical before it is pruned.
    pub deregister_after: Duration,
    /// Status before the first probe completes.
    pub initial_status: CheckStatus,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CHECK_INTERVAL,
            timeout: DEFAULT_CHECK_TIMEOUT,
            deregister_after: DEFAULT_DEREGISTER_AFTER,
            initial_status: CheckStatus::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceInstance {
    pub id: String,
    pub service: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
}

impl ServiceInstance {
    /// `host:port`, bracketing IPv6 literals.
    #[must_use]
    pub fn host_port(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    #[must_use]
    pub fn uri(&self) -> String {
        format!("http://{}", self.host_port())
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Passing instances of one service as of `index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Monotonic change counter; pass it back to block until the next change.
    pub index: u64,
    pub instances: Vec<ServiceInstance>,
}

/// Split `host:port` or `[v6]:port`.
///
/// # Errors
/// Returns [`RegistryError::InvalidAddress`] for a missing host, a missing or
/// non-numeric port, port `0`, or an unbracketed IPv6 literal.
pub fn parse_host_port(host_port: &str) -> Result<(String, u16), RegistryError> {
    let invalid = || RegistryError::InvalidAddress(host_port.to_string());

    let (host, port) = if let Some(rest) = host_port.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
        (host, port)
    } else {
        let (host, port) = host_port.rsplit_once(':').ok_or_else(invalid)?;
        if host.contains(':') {
            return Err(invalid());
        }
        (host, port)
    };

    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

#[async_trait]
pub trait ServiceRegistry: Send + Sync + 'static {
    /// Announce an instance with an attached active health check.
    ///
    /// # Errors
    /// [`RegistryError::InvalidAddress`] if `host_port` does not parse.
    async fn register(
        &self,
        instance_id: &str,
        service_name: &str,
        host_port: &str,
        check: &HealthCheckSpec,
    ) -> Result<ServiceInstance, RegistryError>;

    /// Remove an instance. Removing an unknown instance succeeds.
    async fn deregister(&self, instance_id: &str, service_name: &str) -> Result<(), RegistryError>;

    /// Passing, `rpc`-tagged instances of `service_name`.
    ///
    /// With `after_index`, blocks until the set has changed past that index or
    /// the registry's wait time elapses, whichever comes first.
    async fn healthy_instances(
        &self,
        service_name: &str,
        after_index: Option<u64>,
    ) -> Result<Snapshot, RegistryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        assert_eq!(
            parse_host_port("10.0.0.5:50051").unwrap(),
            ("10.0.0.5".to_string(), 50051)
        );
        assert_eq!(
            parse_host_port("auth.internal:443").unwrap(),
            ("auth.internal".to_string(), 443)
        );
        assert_eq!(parse_host_port("[::1]:50051").unwrap(), ("::1".to_string(), 50051));
    }

    #[test]
    fn rejects_bad_host_port() {
        for input in [
            "",
            "localhost",
            ":50051",
            "host:",
            "host:port",
            "host:70000",
            "host:0",
            "::1:50051",
            "[::1]50051",
            "a b:1",
        ] {
            assert!(
                matches!(parse_host_port(input), Err(RegistryError::InvalidAddress(_))),
                "{input:?}"
            );
        }
    }

    #[test]
    fn instance_addresses() {
        let mut instance = ServiceInstance {
            id: "auth-1".to_string(),
            service: "auth-service".to_string(),
            address: "10.0.0.5".to_string(),
            port: 50051,
            tags: vec![SERVICE_TAG.to_string()],
        };
        assert_eq!(instance.uri(), "http://10.0.0.5:50051");
        assert!(instance.has_tag("rpc"));

        instance.address = "::1".to_string();
        assert_eq!(instance.host_port(), "[::1]:50051");
    }

    #[test]
    fn check_defaults() {
        let spec = HealthCheckSpec::default();
        assert_eq!(spec.interval, Duration::from_secs(10));
        assert_eq!(spec.timeout, Duration::from_secs(5));
        assert_eq!(spec.deregister_after, Duration::from_secs(60));
        assert_eq!(spec.initial_status, CheckStatus::Critical);
    }

    #[test]
    fn registry_errors_classify() {
        assert_eq!(
            RegistryError::InvalidAddress("x".to_string()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            RegistryError::NoHealthyInstances("auth-service".to_string()).kind(),
            ErrorKind::Unavailable
        );
    }
}
