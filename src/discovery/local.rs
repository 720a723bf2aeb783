use super::{
    parse_host_port, CheckStatus, HealthCheckSpec, HealthProbe, RegistryError, ServiceInstance,
    ServiceRegistry, Snapshot, SERVICE_TAG,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const DEFAULT_WAIT: Duration = Duration::from_secs(30);

/// In-process registry that runs its own health probes.
///
/// Used where no Consul agent is available and by the loopback tests. Every
/// registered instance gets a probe task that lives until the instance is
/// deregistered, pruned, or the registry is shut down.
pub struct LocalRegistry {
    inner: Arc<Inner>,
    wait: Duration,
}

struct Inner {
    entries: Mutex<Entries>,
    index: watch::Sender<u64>,
    probe: Arc<dyn HealthProbe>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct Entries {
    by_id: HashMap<String, Entry>,
    generation: u64,
}

struct Entry {
    instance: ServiceInstance,
    status: CheckStatus,
    generation: u64,
    cancel: CancellationToken,
}

impl Inner {
    /// Must be called with `entries` locked so index and contents move together.
    fn bump(&self) {
        self.index.send_modify(|index| *index += 1);
    }

    async fn record(&self, id: &str, generation: u64, status: CheckStatus, prune: bool) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.by_id.get_mut(id) else {
            return;
        };
        if entry.generation != generation {
            return;
        }

        if prune {
            entries.by_id.remove(id);
            self.bump();
        } else if entry.status != status {
            debug!(instance = id, from = entry.status.as_str(), to = status.as_str(), "check status changed");
            entry.status = status;
            self.bump();
        }
    }
}

async fn run_checks(
    inner: Arc<Inner>,
    instance: ServiceInstance,
    generation: u64,
    check: HealthCheckSpec,
    cancel: CancellationToken,
) {
    let mut ticker = interval(check.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut critical_since = (check.initial_status == CheckStatus::Critical).then(Instant::now);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let passing = tokio::select! {
            () = cancel.cancelled() => break,
            result = timeout(check.timeout, inner.probe.check(&instance)) => result.unwrap_or(false),
        };

        let status = if passing {
            critical_since = None;
            CheckStatus::Passing
        } else {
            critical_since.get_or_insert_with(Instant::now);
            CheckStatus::Critical
        };
        let prune = critical_since.is_some_and(|since| since.elapsed() >= check.deregister_after);

        inner.record(&instance.id, generation, status, prune).await;
        if prune {
            warn!(instance = %instance.id, "critical past deregistration grace, pruned");
            break;
        }
    }
}

impl LocalRegistry {
    #[must_use]
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        let (index, _) = watch::channel(1);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Entries::default()),
                index,
                probe,
                shutdown: CancellationToken::new(),
            }),
            wait: DEFAULT_WAIT,
        }
    }

    /// Upper bound for blocking health queries.
    #[must_use]
    pub const fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Current check status, `None` once the instance is gone.
    pub async fn status(&self, instance_id: &str) -> Option<CheckStatus> {
        let entries = self.inner.entries.lock().await;
        entries.by_id.get(instance_id).map(|entry| entry.status)
    }

    /// Stop every probe task. Registrations stay readable.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Drop for LocalRegistry {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

#[async_trait]
impl ServiceRegistry for LocalRegistry {
    #[instrument(skip(self, check), fields(registry = "local"))]
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

        let cancel = self.inner.shutdown.child_token();
        let generation = {
            let mut entries = self.inner.entries.lock().await;
            entries.generation += 1;
            let generation = entries.generation;
            let previous = entries.by_id.insert(
                instance.id.clone(),
                Entry {
                    instance: instance.clone(),
                    status: check.initial_status,
                    generation,
                    cancel: cancel.clone(),
                },
            );
            if let Some(previous) = previous {
                previous.cancel.cancel();
            }
            self.inner.bump();
            generation
        };

        tokio::spawn(run_checks(
            self.inner.clone(),
            instance.clone(),
            generation,
            check.clone(),
            cancel,
        ));

        info!(address = %instance.host_port(), "registered service instance");
        Ok(instance)
    }

    #[instrument(skip(self), fields(registry = "local"))]
    async fn deregister(&self, instance_id: &str, service_name: &str) -> Result<(), RegistryError> {
        let mut entries = self.inner.entries.lock().await;
        if let Some(entry) = entries.by_id.remove(instance_id) {
            entry.cancel.cancel();
            self.inner.bump();
            info!("deregistered service instance");
        }
        Ok(())
    }

    async fn healthy_instances(
        &self,
        service_name: &str,
        after_index: Option<u64>,
    ) -> Result<Snapshot, RegistryError> {
        if let Some(after) = after_index {
            let mut rx = self.inner.index.subscribe();
            let changed = async {
                while *rx.borrow_and_update() == after {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            };
            // Elapsed wait returns the unchanged set, like a Consul blocking query.
            let _ = timeout(self.wait, changed).await;
        }

        let entries = self.inner.entries.lock().await;
        let index = *self.inner.index.borrow();
        let mut instances: Vec<ServiceInstance> = entries
            .by_id
            .values()
            .filter(|entry| {
                entry.status == CheckStatus::Passing
                    && entry.instance.service == service_name
                    && entry.instance.has_tag(SERVICE_TAG)
            })
            .map(|entry| entry.instance.clone())
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(Snapshot { index, instances })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Instances pass unless explicitly marked down.
    #[derive(Default)]
    struct SwitchProbe {
        down: StdMutex<Vec<String>>,
    }

    impl SwitchProbe {
        fn set_down(&self, id: &str, down: bool) {
            let mut ids = self.down.lock().unwrap();
            ids.retain(|d| d != id);
            if down {
                ids.push(id.to_string());
            }
        }
    }

    #[async_trait]
    impl HealthProbe for SwitchProbe {
        async fn check(&self, instance: &ServiceInstance) -> bool {
            !self.down.lock().unwrap().contains(&instance.id)
        }
    }

    fn fast_check(initial_status: CheckStatus) -> HealthCheckSpec {
        HealthCheckSpec {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(20),
            deregister_after: Duration::from_millis(150),
            initial_status,
        }
    }

    fn registry() -> (LocalRegistry, Arc<SwitchProbe>) {
        let probe = Arc::new(SwitchProbe::default());
        let registry = LocalRegistry::new(probe.clone()).with_wait(Duration::from_secs(2));
        (registry, probe)
    }

    async fn wait_until<F>(registry: &LocalRegistry, mut done: F) -> Snapshot
    where
        F: FnMut(&Snapshot) -> bool,
    {
        let mut snapshot = registry.healthy_instances("auth-service", None).await.unwrap();
        for _ in 0..50 {
            if done(&snapshot) {
                return snapshot;
            }
            snapshot = registry
                .healthy_instances("auth-service", Some(snapshot.index))
                .await
                .unwrap();
        }
        panic!("condition not reached, last snapshot: {snapshot:?}");
    }

    #[tokio::test]
    async fn initially_critical_instance_appears_after_first_probe() {
        let (registry, _probe) = registry();
        registry
            .register("auth-1", "auth-service", "127.0.0.1:50051", &fast_check(CheckStatus::Critical))
            .await
            .unwrap();

        let snapshot = wait_until(&registry, |s| s.instances.len() == 1).await;
        assert_eq!(snapshot.instances[0].uri(), "http://127.0.0.1:50051");
        assert_eq!(registry.status("auth-1").await, Some(CheckStatus::Passing));
    }

    #[tokio::test]
    async fn failing_instance_leaves_then_is_pruned() {
        let (registry, probe) = registry();
        for (id, addr) in [("auth-1", "127.0.0.1:50051"), ("auth-2", "127.0.0.1:50052")] {
            registry
                .register(id, "auth-service", addr, &fast_check(CheckStatus::Passing))
                .await
                .unwrap();
        }
        wait_until(&registry, |s| s.instances.len() == 2).await;

        probe.set_down("auth-2", true);
        let snapshot = wait_until(&registry, |s| s.instances.len() == 1).await;
        assert_eq!(snapshot.instances[0].id, "auth-1");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(registry.status("auth-2").await, None);
        assert_eq!(registry.status("auth-1").await, Some(CheckStatus::Passing));
    }

    #[tokio::test]
    async fn recovered_instance_returns() {
        let (registry, probe) = registry();
        probe.set_down("auth-1", true);
        registry
            .register("auth-1", "auth-service", "127.0.0.1:50051", &fast_check(CheckStatus::Passing))
            .await
            .unwrap();
        wait_until(&registry, |s| s.instances.is_empty()).await;

        probe.set_down("auth-1", false);
        wait_until(&registry, |s| s.instances.len() == 1).await;
    }

    #[tokio::test]
    async fn blocking_query_times_out_without_change() {
        let probe = Arc::new(SwitchProbe::default());
        let registry = LocalRegistry::new(probe).with_wait(Duration::from_millis(50));
        let first = registry.healthy_instances("auth-service", None).await.unwrap();

        let started = Instant::now();
        let second = registry
            .healthy_instances("auth-service", Some(first.index))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn deregister_removes_and_tolerates_unknown() {
        let (registry, _probe) = registry();
        registry
            .register("auth-1", "auth-service", "127.0.0.1:50051", &fast_check(CheckStatus::Passing))
            .await
            .unwrap();
        registry.deregister("auth-1", "auth-service").await.unwrap();
        registry.deregister("auth-1", "auth-service").await.unwrap();
        registry.deregister("never", "auth-service").await.unwrap();

        let snapshot = registry.healthy_instances("auth-service", None).await.unwrap();
        assert!(snapshot.instances.is_empty());
        assert_eq!(registry.status("auth-1").await, None);
    }

    #[tokio::test]
    async fn filters_by_service_name() {
        let (registry, _probe) = registry();
        registry
            .register("auth-1", "auth-service", "127.0.0.1:50051", &fast_check(CheckStatus::Passing))
            .await
            .unwrap();
        registry
            .register("mail-1", "mail-service", "127.0.0.1:50061", &fast_check(CheckStatus::Passing))
            .await
            .unwrap();

        let snapshot = registry.healthy_instances("auth-service", None).await.unwrap();
        assert_eq!(snapshot.instances.len(), 1);
        assert_eq!(snapshot.instances[0].id, "auth-1");
    }

    #[tokio::test]
    async fn register_rejects_bad_address() {
        let (registry, _probe) = registry();
        let err = registry
            .register("auth-1", "auth-service", "localhost", &HealthCheckSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidAddress(_)));
    }
}
