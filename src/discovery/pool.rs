use super::{RegistryError, ServiceInstance, ServiceRegistry};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const WATCH_BACKOFF_MIN: Duration = Duration::from_millis(100);
const WATCH_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Channel to the instance chosen for one call.
#[derive(Debug, Clone)]
pub struct PickedEndpoint {
    pub instance_id: String,
    pub channel: Channel,
}

struct Slot {
    instance: ServiceInstance,
    channel: Channel,
}

#[derive(Default)]
struct Balancer {
    slots: Vec<Slot>,
    next: usize,
    last: Option<String>,
}

impl Balancer {
    /// Replace the instance set, keeping channels of unchanged instances.
    fn update(&mut self, mut instances: Vec<ServiceInstance>) {
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        let mut previous = std::mem::take(&mut self.slots);

        for instance in instances {
            let reused = previous
                .iter()
                .position(|slot| slot.instance == instance)
                .map(|i| previous.swap_remove(i));
            let slot = match reused {
                Some(slot) => slot,
                None => match lazy_channel(&instance) {
                    Ok(channel) => Slot { instance, channel },
                    Err(err) => {
                        warn!("skipping instance: {err}");
                        continue;
                    }
                },
            };
            self.slots.push(slot);
        }
    }

    fn pick(&mut self) -> Option<PickedEndpoint> {
        let count = self.slots.len();
        if count == 0 {
            return None;
        }

        let mut index = self.next % count;
        if count >= 2 && self.last.as_deref() == Some(self.slots[index].instance.id.as_str()) {
            index = (index + 1) % count;
        }
        self.next = index + 1;

        let slot = &self.slots[index];
        self.last = Some(slot.instance.id.clone());
        Some(PickedEndpoint {
            instance_id: slot.instance.id.clone(),
            channel: slot.channel.clone(),
        })
    }
}

fn lazy_channel(instance: &ServiceInstance) -> Result<Channel, RegistryError> {
    let endpoint = Endpoint::from_shared(instance.uri()).map_err(|e| RegistryError::Endpoint {
        instance: instance.id.clone(),
        message: e.to_string(),
    })?;
    Ok(endpoint.connect_timeout(CONNECT_TIMEOUT).connect_lazy())
}

/// Round-robin pool over the healthy instances of one service.
///
/// A background task follows the registry with blocking queries and swaps
/// the instance set in place. Dropping the pool cancels that task; `close`
/// also waits for it.
pub struct ServicePool {
    service: String,
    balancer: Arc<StdMutex<Balancer>>,
    cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ServicePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePool")
            .field("service", &self.service)
            .field("instances", &self.instance_ids())
            .finish_non_exhaustive()
    }
}

/// Resolve `service_name` into a pool.
///
/// # Errors
/// [`RegistryError::NoHealthyInstances`] when nothing is passing right now,
/// or the registry's own error when the first query fails.
pub async fn resolve<R>(
    registry: Arc<R>,
    service_name: &str,
    parent: &CancellationToken,
) -> Result<ServicePool, RegistryError>
where
    R: ServiceRegistry + ?Sized,
{
    let snapshot = registry.healthy_instances(service_name, None).await?;
    if snapshot.instances.is_empty() {
        return Err(RegistryError::NoHealthyInstances(service_name.to_string()));
    }

    let mut balancer = Balancer::default();
    balancer.update(snapshot.instances);
    if balancer.slots.is_empty() {
        return Err(RegistryError::NoHealthyInstances(service_name.to_string()));
    }
    info!(service = service_name, instances = balancer.slots.len(), "resolved service");

    let balancer = Arc::new(StdMutex::new(balancer));
    let cancel = parent.child_token();
    let watcher = tokio::spawn(watch(
        registry,
        service_name.to_string(),
        snapshot.index,
        balancer.clone(),
        cancel.clone(),
    ));

    Ok(ServicePool {
        service: service_name.to_string(),
        balancer,
        cancel,
        watcher: Mutex::new(Some(watcher)),
    })
}

fn backoff(failures: u32) -> Duration {
    let factor = 2_u32.saturating_pow(failures.saturating_sub(1));
    WATCH_BACKOFF_MIN.saturating_mul(factor).min(WATCH_BACKOFF_MAX)
}

fn lock(balancer: &StdMutex<Balancer>) -> MutexGuard<'_, Balancer> {
    // The balancer holds no invariants a panicking holder could break halfway.
    balancer.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

async fn watch<R>(
    registry: Arc<R>,
    service: String,
    mut index: u64,
    balancer: Arc<StdMutex<Balancer>>,
    cancel: CancellationToken,
) where
    R: ServiceRegistry + ?Sized,
{
    let mut failures = 0_u32;
    loop {
        let result = tokio::select! {
            () = cancel.cancelled() => break,
            result = registry.healthy_instances(&service, Some(index)) => result,
        };

        match result {
            Ok(snapshot) => {
                failures = 0;
                if snapshot.index == index {
                    continue;
                }
                // A lower index means the registry restarted; start over.
                index = if snapshot.index < index { 0 } else { snapshot.index };
                debug!(service = %service, index, instances = snapshot.instances.len(), "instance set changed");
                lock(&balancer).update(snapshot.instances);
            }
            Err(err) => {
                failures += 1;
                let delay = backoff(failures);
                warn!(service = %service, failures, "watch failed, retrying in {delay:?}: {err}");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    debug!(service = %service, "watch stopped");
}

impl ServicePool {
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Next instance in rotation.
    ///
    /// # Errors
    /// [`RegistryError::NoHealthyInstances`] when the set is currently empty.
    pub fn pick(&self) -> Result<PickedEndpoint, RegistryError> {
        lock(&self.balancer)
            .pick()
            .ok_or_else(|| RegistryError::NoHealthyInstances(self.service.clone()))
    }

    /// Instance ids currently in rotation, sorted.
    #[must_use]
    pub fn instance_ids(&self) -> Vec<String> {
        lock(&self.balancer)
            .slots
            .iter()
            .map(|slot| slot.instance.id.clone())
            .collect()
    }

    /// Stop the watcher and wait for it to exit.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.watcher.lock().await.take() {
            if let Err(err) = handle.await {
                warn!(service = %self.service, "watch task ended abnormally: {err}");
            }
        }
    }
}

impl Drop for ServicePool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
