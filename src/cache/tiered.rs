//! Tiered lookup: local, then distributed, then the loader.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use crate::cache::{DistributedCache, LocalCache};
use crate::config::CacheConfig;
use crate::observability::metrics;

/// Local tier backed by an optional distributed tier.
pub struct TieredCache {
    local: LocalCache,
    distributed: Option<Arc<dyn DistributedCache>>,
    distributed_ttl: Duration,
    distributed_timeout: Duration,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("local", &self.local)
            .field("distributed", &self.distributed.as_ref().map(|d| d.name()))
            .field("distributed_ttl", &self.distributed_ttl)
            .finish()
    }
}

impl TieredCache {
    pub fn new(config: &CacheConfig, distributed: Option<Arc<dyn DistributedCache>>) -> Self {
        Self {
            local: LocalCache::new(
                Duration::from_secs(config.local_ttl_secs),
                config.local_max_entries,
            ),
            distributed,
            distributed_ttl: Duration::from_secs(config.distributed_ttl_secs),
            distributed_timeout: Duration::from_millis(config.distributed_timeout_ms),
        }
    }

    /// Local tier only.
    pub fn local_only(config: &CacheConfig) -> Self {
        Self::new(config, None)
    }

    pub fn has_distributed(&self) -> bool {
        self.distributed.is_some()
    }

    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    /// Look `key` up in both tiers. A distributed hit is promoted into the
    /// local tier.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        if let Some(value) = self.local.get(key) {
            metrics::record_cache_lookup("local", true);
            return Some(value);
        }
        metrics::record_cache_lookup("local", false);

        let value = self.distributed_get(key).await?;
        self.local.insert(key, value.clone());
        Some(value)
    }

    /// Serve `key` from cache, or run `loader` and populate both tiers with
    /// its value. Loader errors are returned as-is and never cached.
    pub async fn get_or_load<E, F, Fut>(&self, key: &str, loader: F) -> Result<Bytes, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let value = loader().await?;
        self.local.insert(key, value.clone());
        self.distributed_set(key, value.clone()).await;
        Ok(value)
    }

    async fn distributed_get(&self, key: &str) -> Option<Bytes> {
        let store = self.distributed.as_ref()?;
        let found = match timeout(self.distributed_timeout, store.get(key)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                tracing::warn!(key = %key, store = store.name(), error = %e, "Distributed cache read failed, treating as miss");
                metrics::record_cache_degraded("distributed", "get");
                None
            }
            Err(_) => {
                tracing::warn!(
                    key = %key,
                    store = store.name(),
                    timeout_ms = self.distributed_timeout.as_millis() as u64,
                    "Distributed cache read timed out, treating as miss"
                );
                metrics::record_cache_degraded("distributed", "get");
                None
            }
        };
        metrics::record_cache_lookup("distributed", found.is_some());
        found
    }

    async fn distributed_set(&self, key: &str, value: Bytes) {
        let Some(store) = self.distributed.as_ref() else {
            return;
        };
        match timeout(self.distributed_timeout, store.set(key, value, self.distributed_ttl)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(key = %key, store = store.name(), error = %e, "Distributed cache write failed");
                metrics::record_cache_degraded("distributed", "set");
            }
            Err(_) => {
                tracing::warn!(key = %key, store = store.name(), "Distributed cache write timed out");
                metrics::record_cache_degraded("distributed", "set");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheError;
    use async_trait::async_trait;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeStore {
        entries: DashMap<String, Bytes>,
        gets: AtomicUsize,
        sets: AtomicUsize,
        failing: AtomicBool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl DistributedCache for FakeStore {
        async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(CacheError::Backend("unreachable".into()));
            }
            Ok(self.entries.get(key).map(|v| v.clone()))
        }

        async fn set(&self, key: &str, value: Bytes, _ttl: Duration) -> Result<(), CacheError> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(CacheError::Backend("unreachable".into()));
            }
            self.entries.insert(key.to_string(), value);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    fn config() -> CacheConfig {
        CacheConfig {
            local_ttl_secs: 30,
            distributed_ttl_secs: 3600,
            local_max_entries: 100,
            redis_url: None,
            distributed_timeout_ms: 100,
        }
    }

    #[tokio::test]
    async fn loader_runs_once_then_local_hits() {
        let store = Arc::new(FakeStore::default());
        let cache = TieredCache::new(&config(), Some(store.clone()));
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_load("k", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(Bytes::from_static(b"fresh"))
                })
                .await
                .unwrap();
            assert_eq!(value, Bytes::from_static(b"fresh"));
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(store.sets.load(Ordering::SeqCst), 1);
        // Only the first lookup reached the distributed tier
        assert_eq!(store.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distributed_hit_is_promoted_without_rewrite() {
        let store = Arc::new(FakeStore::default());
        store.entries.insert("k".into(), Bytes::from_static(b"shared"));
        let cache = TieredCache::new(&config(), Some(store.clone()));

        let value = cache
            .get_or_load("k", || async { Err::<Bytes, _>("loader must not run") })
            .await
            .unwrap();

        assert_eq!(value, Bytes::from_static(b"shared"));
        assert_eq!(cache.local().get("k"), Some(Bytes::from_static(b"shared")));
        assert_eq!(store.sets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn loader_errors_are_not_cached() {
        let store = Arc::new(FakeStore::default());
        let cache = TieredCache::new(&config(), Some(store.clone()));

        let err = cache
            .get_or_load("k", || async { Err::<Bytes, _>("backend down") })
            .await
            .unwrap_err();
        assert_eq!(err, "backend down");
        assert!(cache.local().is_empty());
        assert!(store.entries.is_empty());

        let value = cache
            .get_or_load("k", || async { Ok::<_, &str>(Bytes::from_static(b"ok")) })
            .await
            .unwrap();
        assert_eq!(value, Bytes::from_static(b"ok"));
    }

    #[tokio::test]
    async fn failing_distributed_tier_degrades_to_loader() {
        let store = Arc::new(FakeStore::default());
        store.failing.store(true, Ordering::SeqCst);
        let cache = TieredCache::new(&config(), Some(store.clone()));

        let value = cache
            .get_or_load("k", || async { Ok::<_, ()>(Bytes::from_static(b"v")) })
            .await
            .unwrap();
        assert_eq!(value, Bytes::from_static(b"v"));
        assert_eq!(cache.local().get("k"), Some(Bytes::from_static(b"v")));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_distributed_tier_is_a_miss() {
        let store = Arc::new(FakeStore {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        store.entries.insert("k".into(), Bytes::from_static(b"too late"));
        let cache = TieredCache::new(&config(), Some(store.clone()));

        let value = cache
            .get_or_load("k", || async { Ok::<_, ()>(Bytes::from_static(b"loaded")) })
            .await
            .unwrap();
        assert_eq!(value, Bytes::from_static(b"loaded"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_local_entry_falls_through() {
        let cache = TieredCache::local_only(&config());
        cache
            .get_or_load("k", || async { Ok::<_, ()>(Bytes::from_static(b"old")) })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.get("k").await, None);

        let value = cache
            .get_or_load("k", || async { Ok::<_, ()>(Bytes::from_static(b"new")) })
            .await
            .unwrap();
        assert_eq!(value, Bytes::from_static(b"new"));
    }
}
