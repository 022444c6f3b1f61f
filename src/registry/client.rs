//! Registry client: per-service instance snapshots.
//!
//! # Responsibilities
//! - Resolve a service name to its latest [`InstanceSet`]
//! - Refresh snapshots in the background, keeping stale data on failure
//! - Accept pushed updates (config reload)

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time;

use crate::observability::metrics;
use crate::registry::{Instance, InstanceSet, RegistryBackend, RegistryError};

/// Snapshot slot for one service.
#[derive(Default)]
struct ServiceSlot {
    instances: ArcSwapOption<Vec<Instance>>,
    /// Held while a refresh is in flight.
    refresh: Mutex<()>,
}

/// Caching front of a [`RegistryBackend`].
pub struct RegistryClient {
    backend: Arc<dyn RegistryBackend>,
    services: DashMap<String, Arc<ServiceSlot>>,
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("backend", &self.backend.name())
            .field("services", &self.services.len())
            .finish()
    }
}

impl RegistryClient {
    pub fn new(backend: Arc<dyn RegistryBackend>) -> Self {
        Self {
            backend,
            services: DashMap::new(),
        }
    }

    fn slot(&self, service: &str) -> Arc<ServiceSlot> {
        if let Some(slot) = self.services.get(service) {
            return slot.value().clone();
        }
        self.services
            .entry(service.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Resolve `service` to its latest snapshot.
    ///
    /// Returns a stale snapshot rather than waiting on the backend. Only the
    /// very first resolution of a service performs a round-trip; concurrent
    /// first resolutions share it.
    pub async fn resolve(&self, service: &str) -> Result<InstanceSet, RegistryError> {
        let slot = self.slot(service);
        if let Some(set) = slot.instances.load_full() {
            return Ok(set);
        }

        let _refresh = slot.refresh.lock().await;
        if let Some(set) = slot.instances.load_full() {
            return Ok(set);
        }

        self.fetch(service, &slot).await.map_err(|e| {
            tracing::warn!(service = %service, error = %e, "Initial service resolution failed");
            metrics::record_registry_refresh_failure(service);
            RegistryError::Unresolved(service.to_string())
        })
    }

    /// Refresh one service from the backend.
    ///
    /// Returns `Ok(false)` without contacting the backend when a refresh for
    /// the same service is already in flight. On failure the previous
    /// snapshot is kept.
    pub async fn refresh(&self, service: &str) -> Result<bool, RegistryError> {
        let slot = self.slot(service);
        let Ok(_refresh) = slot.refresh.try_lock() else {
            tracing::trace!(service = %service, "Refresh already in flight");
            return Ok(false);
        };

        match self.fetch(service, &slot).await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(
                    service = %service,
                    backend = self.backend.name(),
                    error = %e,
                    stale = slot.instances.load().is_some(),
                    "Registry refresh failed, keeping previous snapshot"
                );
                metrics::record_registry_refresh_failure(service);
                Err(e)
            }
        }
    }

    async fn fetch(&self, service: &str, slot: &ServiceSlot) -> Result<InstanceSet, RegistryError> {
        let instances = self.backend.list_instances(service).await?;
        Ok(self.store(service, slot, instances))
    }

    fn store(&self, service: &str, slot: &ServiceSlot, instances: Vec<Instance>) -> InstanceSet {
        let healthy = instances.iter().filter(|i| i.healthy).count();
        tracing::debug!(service = %service, total = instances.len(), healthy, "Service snapshot updated");
        metrics::record_instances(service, instances.len());

        let set: InstanceSet = Arc::new(instances);
        slot.instances.store(Some(set.clone()));
        set
    }

    /// Replace a service's snapshot with pushed data.
    pub fn apply(&self, service: &str, instances: Vec<Instance>) {
        let slot = self.slot(service);
        self.store(service, &slot, instances);
    }

    /// Current snapshot without contacting the backend.
    pub fn snapshot(&self, service: &str) -> Option<InstanceSet> {
        self.services
            .get(service)
            .and_then(|slot| slot.instances.load_full())
    }

    /// Services resolved or applied so far.
    pub fn known_services(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Refresh every known service.
    pub async fn refresh_all(&self) {
        for service in self.known_services() {
            let _ = self.refresh(&service).await;
        }
    }

    /// Start the periodic refresher. It stops on the shutdown signal.
    pub fn spawn_refresher(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), backend = self.backend.name(), "Registry refresher starting");
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.refresh_all().await,
                    _ = shutdown.recv() => {
                        tracing::info!("Registry refresher received shutdown signal, exiting loop");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FlakyBackend {
        calls: AtomicUsize,
        failing: AtomicBool,
        delay_ms: u64,
    }

    #[async_trait]
    impl RegistryBackend for FlakyBackend {
        async fn list_instances(&self, service: &str) -> Result<Vec<Instance>, RegistryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(RegistryError::Backend("down".into()));
            }
            Ok(vec![Instance::healthy(format!("http://{service}:{call}"))])
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn unresolved_when_never_fetched() {
        let backend = Arc::new(FlakyBackend::default());
        backend.failing.store(true, Ordering::SeqCst);
        let client = RegistryClient::new(backend);

        assert_eq!(
            client.resolve("orders").await.unwrap_err(),
            RegistryError::Unresolved("orders".into())
        );
    }

    #[tokio::test]
    async fn failed_refresh_keeps_stale_snapshot() {
        let backend = Arc::new(FlakyBackend::default());
        let client = RegistryClient::new(backend.clone());

        let first = client.resolve("orders").await.unwrap();
        backend.failing.store(true, Ordering::SeqCst);

        assert!(client.refresh("orders").await.is_err());
        let after = client.resolve("orders").await.unwrap();
        assert_eq!(first, after);
    }

    #[tokio::test]
    async fn resolve_serves_snapshot_without_backend() {
        let backend = Arc::new(FlakyBackend::default());
        let client = RegistryClient::new(backend.clone());

        client.resolve("orders").await.unwrap();
        client.resolve("orders").await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        assert!(client.refresh("orders").await.unwrap());
        let refreshed = client.resolve("orders").await.unwrap();
        assert_eq!(refreshed[0].address, "http://orders:1");
    }

    #[tokio::test(start_paused = true)]
    async fn one_refresh_in_flight_per_service() {
        let backend = Arc::new(FlakyBackend { delay_ms: 50, ..Default::default() });
        let client = Arc::new(RegistryClient::new(backend.clone()));
        client.apply("orders", vec![Instance::healthy("http://seed")]);

        let c1 = client.clone();
        let first = tokio::spawn(async move { c1.refresh("orders").await });
        tokio::task::yield_now().await;

        assert_eq!(client.refresh("orders").await, Ok(false));
        // Readers are not blocked by the in-flight refresh
        assert_eq!(client.resolve("orders").await.unwrap()[0].address, "http://seed");

        assert_eq!(first.await.unwrap(), Ok(true));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_first_resolves_share_one_fetch() {
        let backend = Arc::new(FlakyBackend { delay_ms: 20, ..Default::default() });
        let client = Arc::new(RegistryClient::new(backend.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.resolve("orders").await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresher_ticks_until_shutdown() {
        let backend = Arc::new(FlakyBackend::default());
        let client = Arc::new(RegistryClient::new(backend.clone()));
        client.apply("orders", vec![Instance::healthy("http://seed")]);

        let (tx, rx) = broadcast::channel(1);
        let refresher = client.clone().spawn_refresher(Duration::from_secs(10), rx);

        // The first tick fires immediately
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(client.snapshot("orders").unwrap()[0].address, "http://orders:0");

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(client.snapshot("orders").unwrap()[0].address, "http://orders:1");

        tx.send(()).unwrap();
        refresher.await.unwrap();

        let calls = backend.calls.load(Ordering::SeqCst);
        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn applied_snapshot_replaces_wholesale() {
        let client = RegistryClient::new(Arc::new(FlakyBackend::default()));
        client.apply("cart", vec![Instance::healthy("http://a"), Instance::healthy("http://b")]);
        let held = client.resolve("cart").await.unwrap();

        client.apply("cart", vec![Instance::unhealthy("http://c")]);
        assert_eq!(held.len(), 2);
        assert_eq!(client.snapshot("cart").unwrap().len(), 1);
        assert_eq!(client.known_services(), vec!["cart".to_string()]);
    }
}
