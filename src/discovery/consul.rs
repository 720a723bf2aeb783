use super::{
    parse_host_port, HealthCheckSpec, RegistryError, ServiceInstance, ServiceRegistry, Snapshot,
    SERVICE_TAG,
};
use crate::APP_USER_AGENT;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument};
use url::Url;

const INDEX_HEADER: &str = "X-Consul-Index";
const DEFAULT_WAIT: Duration = Duration::from_secs(30);

/// Consul agent HTTP API.
#[derive(Debug, Clone)]
pub struct ConsulRegistry {
    client: Client,
    base: Url,
    wait: Duration,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Registration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    tags: [&'a str; 1],
    check: Check,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Check {
    #[serde(rename = "GRPC")]
    grpc: String,
    interval: String,
    timeout: String,
    deregister_critical_service_after: String,
    status: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: NodeEntry,
    service: ServiceEntry,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeEntry {
    #[serde(default)]
    address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

fn go_duration(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}

impl ConsulRegistry {
    /// # Errors
    /// Returns an error if `address` is not an http(s) URL or the HTTP client
    /// cannot be built.
    pub fn new(address: &str) -> Result<Self, RegistryError> {
        let base = Url::parse(address)
            .map_err(|e| RegistryError::InvalidUrl(format!("{address}: {e}")))?;
        match base.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(RegistryError::InvalidUrl(format!(
                    "{address}: unsupported scheme {scheme}"
                )))
            }
        }
        if base.host().is_none() {
            return Err(RegistryError::InvalidUrl(format!("{address}: no host specified")));
        }

        let client = Client::builder().user_agent(APP_USER_AGENT).build()?;
        Ok(Self {
            client,
            base,
            wait: DEFAULT_WAIT,
        })
    }

    /// Upper bound for blocking health queries.
    #[must_use]
    pub const fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Appends `segments` to the base path, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, RegistryError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| RegistryError::InvalidUrl(format!("{}: cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn api_error(response: Response) -> RegistryError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        RegistryError::Api {
            status,
            message: message.trim().to_string(),
        }
    }
}

#[async_trait]
impl ServiceRegistry for ConsulRegistry {
    #[instrument(skip(self, check), fields(registry = "consul"))]
    async fn register(
        &self,
        instance_id: &str,
        service_name: &str,
        host_port: &str,
        check: &HealthCheckSpec,
    ) -> Result<ServiceInstance, RegistryError> {
        let (address, port) = parse_host_port(host_port)?;
        let instance = ServiceInstance {
            id: instance_id.to_string(),
            service: service_name.to_string(),
            address,
            port,
            tags: vec![SERVICE_TAG.to_string()],
        };

        let body = Registration {
            id: &instance.id,
            name: &instance.service,
            address: &instance.address,
            port,
            tags: [SERVICE_TAG],
            check: Check {
                grpc: instance.host_port(),
                interval: go_duration(check.interval),
                timeout: go_duration(check.timeout),
                deregister_critical_service_after: go_duration(check.deregister_after),
                status: check.initial_status.as_str(),
            },
        };

        let url = self.endpoint(&["v1", "agent", "service", "register"])?;
        let response = self.client.put(url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        info!(address = %instance.host_port(), "registered service instance");
        Ok(instance)
    }

    #[instrument(skip(self), fields(registry = "consul"))]
    async fn deregister(&self, instance_id: &str, service_name: &str) -> Result<(), RegistryError> {
        let url = self.endpoint(&["v1", "agent", "service", "deregister", instance_id])?;
        let response = self.client.put(url).send().await?;
        match response.status() {
            status if status.is_success() => {
                info!("deregistered service instance");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                debug!("instance was not registered");
                Ok(())
            }
            _ => Err(Self::api_error(response).await),
        }
    }

    #[instrument(skip(self), fields(registry = "consul"))]
    async fn healthy_instances(
        &self,
        service_name: &str,
        after_index: Option<u64>,
    ) -> Result<Snapshot, RegistryError> {
        let mut url = self.endpoint(&["v1", "health", "service", service_name])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("passing", "true");
            query.append_pair("tag", SERVICE_TAG);
            if let Some(index) = after_index {
                query.append_pair("index", &index.to_string());
                query.append_pair("wait", &go_duration(self.wait));
            }
        }

        let response = self
            .client
            .get(url)
            .timeout(self.wait + Duration::from_secs(10))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let entries: Vec<HealthEntry> = response.json().await?;
        let instances = entries
            .into_iter()
            .map(|entry| {
                let address = if entry.service.address.is_empty() {
                    entry.node.address
                } else {
                    entry.service.address
                };
                ServiceInstance {
                    id: entry.service.id,
                    service: entry.service.service,
                    address,
                    port: entry.service.port,
                    tags: entry.service.tags.unwrap_or_default(),
                }
            })
            .filter(|instance| instance.has_tag(SERVICE_TAG))
            .collect::<Vec<_>>();

        debug!(index, count = instances.len(), "healthy instances");
        Ok(Snapshot { index, instances })
    }
}
