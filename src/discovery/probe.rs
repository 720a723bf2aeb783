use super::ServiceInstance;
use async_trait::async_trait;
use std::time::Duration;
use tonic::transport::Endpoint;
use tonic_health::pb::{
    health_check_response::ServingStatus, health_client::HealthClient, HealthCheckRequest,
};
use tracing::debug;

/// Liveness check run against one instance.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    /// `true` when the instance is serving. The caller bounds the duration.
    async fn check(&self, instance: &ServiceInstance) -> bool;
}

/// `grpc.health.v1.Health/Check`, the same protocol Consul's GRPC check speaks.
#[derive(Debug, Clone, Default)]
pub struct GrpcHealthProbe {
    /// Empty means the server as a whole.
    service: String,
}

impl GrpcHealthProbe {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn for_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

#[async_trait]
impl HealthProbe for GrpcHealthProbe {
    async fn check(&self, instance: &ServiceInstance) -> bool {
        let endpoint = match Endpoint::from_shared(instance.uri()) {
            Ok(endpoint) => endpoint.connect_timeout(Duration::from_secs(2)),
            Err(err) => {
                debug!(instance = %instance.id, "invalid probe endpoint: {err}");
                return false;
            }
        };

        let channel = match endpoint.connect().await {
            Ok(channel) => channel,
            Err(err) => {
                debug!(instance = %instance.id, "probe connect failed: {err}");
                return false;
            }
        };

        let request = HealthCheckRequest {
            service: self.service.clone(),
        };
        match HealthClient::new(channel).check(request).await {
            Ok(response) => response.into_inner().status == ServingStatus::Serving as i32,
            Err(status) => {
                debug!(instance = %instance.id, "probe failed: {status}");
                false
            }
        }
    }
}
