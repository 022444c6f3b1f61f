//! Registry backends.
//!
//! A backend answers `list_instances(service)` with a live list. The static
//! backend serves addresses from configuration and accepts replacements pushed
//! by the config watcher.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::ServiceConfig;
use crate::registry::{Instance, RegistryError};

/// Source of `{service -> [instance]}`.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// List the current instances of `service`.
    async fn list_instances(&self, service: &str) -> Result<Vec<Instance>, RegistryError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// In-memory registry seeded from configuration.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    services: DashMap<String, Vec<Instance>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `[[services]]` entries. Static instances are assumed healthy.
    pub fn from_config(services: &[ServiceConfig]) -> Self {
        let registry = Self::new();
        registry.replace_all(services);
        registry
    }

    /// Set the instances of one service.
    pub fn set(&self, service: impl Into<String>, instances: Vec<Instance>) {
        self.services.insert(service.into(), instances);
    }

    /// Replace the whole table, dropping services that disappeared.
    pub fn replace_all(&self, services: &[ServiceConfig]) {
        self.services
            .retain(|name, _| services.iter().any(|s| &s.name == name));
        for service in services {
            let instances = service
                .instances
                .iter()
                .map(|addr| Instance::healthy(addr.clone()))
                .collect();
            self.services.insert(service.name.clone(), instances);
        }
    }
}

#[async_trait]
impl RegistryBackend for StaticRegistry {
    async fn list_instances(&self, service: &str) -> Result<Vec<Instance>, RegistryError> {
        self.services
            .get(service)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::Backend(format!("unknown service {service}")))
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replace_all_drops_removed_services() {
        let registry = StaticRegistry::from_config(&[
            ServiceConfig { name: "a".into(), instances: vec!["http://a:1".into()] },
            ServiceConfig { name: "b".into(), instances: vec!["http://b:1".into()] },
        ]);
        assert_eq!(registry.list_instances("a").await.unwrap().len(), 1);

        registry.replace_all(&[ServiceConfig {
            name: "a".into(),
            instances: vec!["http://a:1".into(), "http://a:2".into()],
        }]);
        assert_eq!(registry.list_instances("a").await.unwrap().len(), 2);
        assert!(registry.list_instances("b").await.is_err());
    }
}
