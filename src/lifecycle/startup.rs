//! Startup orchestration.
//!
//! # Responsibilities
//! - Build every pipeline component in dependency order
//! - Connect the distributed cache tier, falling back to local-only
//! - Prefetch known services so the first requests do not pay for resolution
//! - Start the registry refresher

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::cache::{DistributedCache, RedisStore, TieredCache};
use crate::config::{GatewayConfig, RegistryBackendKind};
use crate::dispatch::{Dispatcher, ForwardError, HttpForwarder};
use crate::inventory::Inventory;
use crate::lifecycle::Shutdown;
use crate::load_balancer::Balancer;
use crate::registry::{Instance, NacosRegistry, RegistryBackend, RegistryClient, RegistryError, StaticRegistry};
use crate::resilience::circuit_breaker::BreakerSettings;
use crate::resilience::CircuitBreakers;
use crate::security::TokenBucket;

/// Bound on the initial Redis connection attempt.
const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("registry setup failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("inventory client setup failed: {0}")]
    Inventory(#[from] ForwardError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid route {route}: {reason}")]
    Route { route: String, reason: String },
}

/// Every long-lived component of a running gateway.
#[derive(Debug)]
pub struct Gateway {
    pub config: GatewayConfig,
    /// Present when the registry is fed from configuration.
    pub static_registry: Option<Arc<StaticRegistry>>,
    pub registry: Arc<RegistryClient>,
    pub dispatcher: Arc<Dispatcher>,
    pub inventory: Arc<Inventory>,
    pub forwarder: HttpForwarder,
    /// Process-wide admission bucket, absent when rate limiting is disabled.
    pub limiter: Option<Arc<TokenBucket>>,
}

impl Gateway {
    pub async fn bootstrap(config: GatewayConfig) -> Result<Self, StartupError> {
        let (backend, static_registry) = match config.registry.backend {
            RegistryBackendKind::Static => {
                let registry = Arc::new(StaticRegistry::from_config(&config.services));
                (registry.clone() as Arc<dyn RegistryBackend>, Some(registry))
            }
            RegistryBackendKind::Nacos => {
                let nacos = NacosRegistry::new(&config.registry)?;
                (Arc::new(nacos) as Arc<dyn RegistryBackend>, None)
            }
        };
        tracing::info!(backend = backend.name(), "Registry backend selected");
        let registry = Arc::new(RegistryClient::new(backend));

        let balancer = Arc::new(Balancer::new(config.load_balancer.policy));
        let breakers = Arc::new(CircuitBreakers::new(BreakerSettings::from(&config.circuit_breaker)));

        let distributed = connect_distributed(&config).await;
        let cache = Arc::new(TieredCache::new(&config.cache, distributed));
        tracing::info!(distributed = cache.has_distributed(), "Cache initialized");

        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), balancer, breakers).with_cache(cache));
        let inventory = Arc::new(Inventory::new(&config.inventory, dispatcher.clone())?);

        let limiter = config.rate_limit.enabled.then(|| {
            Arc::new(TokenBucket::from_config("global", &config.rate_limit))
        });

        let gateway = Self {
            config,
            static_registry,
            registry,
            dispatcher,
            inventory,
            forwarder: HttpForwarder::new(),
            limiter,
        };
        gateway.prefetch().await;
        Ok(gateway)
    }

    /// Every service referenced by configuration.
    pub fn referenced_services(&self) -> Vec<String> {
        let mut services: Vec<String> = self
            .config
            .services
            .iter()
            .map(|s| s.name.clone())
            .chain(self.config.routes.iter().map(|r| r.upstream.clone()))
            .chain(std::iter::once(self.config.inventory.service.clone()))
            .collect();
        services.sort();
        services.dedup();
        services
    }

    async fn prefetch(&self) {
        for service in self.referenced_services() {
            match self.registry.resolve(&service).await {
                Ok(instances) => {
                    tracing::info!(service = %service, instances = instances.len(), "Service resolved");
                }
                Err(e) => {
                    tracing::warn!(service = %service, error = %e, "Service not resolved at startup, will retry on demand");
                }
            }
        }
    }

    /// Start background tasks that stop on `shutdown`.
    pub fn spawn_background(&self, shutdown: &Shutdown) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.registry.refresh_interval_secs);
        self.registry.clone().spawn_refresher(interval, shutdown.subscribe())
    }

    /// Apply a reloaded configuration. Only service seeds take effect live.
    pub fn apply_reload(&self, new_config: &GatewayConfig) {
        if new_config.routes != self.config.routes {
            tracing::warn!("Route table changed on disk; restart to apply");
        }
        let Some(static_registry) = &self.static_registry else {
            return;
        };

        static_registry.replace_all(&new_config.services);
        for service in &new_config.services {
            let instances = service
                .instances
                .iter()
                .map(|addr| Instance::healthy(addr.clone()))
                .collect();
            self.registry.apply(&service.name, instances);
        }
        for known in self.registry.known_services() {
            if !new_config.services.iter().any(|s| s.name == known) {
                self.registry.apply(&known, Vec::new());
            }
        }
        tracing::info!(services = new_config.services.len(), "Service seeds reloaded");
    }
}

async fn connect_distributed(config: &GatewayConfig) -> Option<Arc<dyn DistributedCache>> {
    let url = config.cache.redis_url.as_deref()?;
    match tokio::time::timeout(REDIS_CONNECT_TIMEOUT, RedisStore::connect(url)).await {
        Ok(Ok(store)) => Some(Arc::new(store) as Arc<dyn DistributedCache>),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Distributed cache unavailable, continuing with local tier only");
            None
        }
        Err(_) => {
            tracing::warn!("Distributed cache connection timed out, continuing with local tier only");
            None
        }
    }
}
