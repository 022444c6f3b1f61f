//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference configured services)
//! - Validate value ranges (timeouts > 0, capacities > 0, addresses parse)
//! - Detect conflicting routes
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use axum::http::Method;
use thiserror::Error;

use crate::config::schema::{
    BreakerConfig, GatewayConfig, RateLimitConfig, RegistryBackendKind, TripPolicyKind,
};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid address for {field}: {value}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("route {index}: path must start with '/' (got {path:?})")]
    InvalidPath { index: usize, path: String },

    #[error("route {index}: unknown method {method:?}")]
    InvalidMethod { index: usize, method: String },

    #[error("route {index}: duplicate route {method} {path}")]
    DuplicateRoute { index: usize, method: String, path: String },

    #[error("route {index}: upstream {upstream:?} is not a configured service")]
    UnknownUpstream { index: usize, upstream: String },

    #[error("{field} must be greater than zero")]
    Zero { field: String },

    #[error("{field} is out of range: {reason}")]
    OutOfRange { field: String, reason: String },
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: config.listener.bind_address.clone(),
        });
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    if config.timeouts.forward_ms == 0 {
        errors.push(zero("timeouts.forward_ms"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(zero("timeouts.request_secs"));
    }
    if config.registry.refresh_interval_secs == 0 {
        errors.push(zero("registry.refresh_interval_secs"));
    }
    if config.cache.local_max_entries == 0 {
        errors.push(zero("cache.local_max_entries"));
    }

    if config.rate_limit.enabled {
        check_bucket("rate_limit", &config.rate_limit, &mut errors);
    }
    check_breaker(&config.circuit_breaker, &mut errors);

    let known_services: HashSet<&str> = config.services.iter().map(|s| s.name.as_str()).collect();
    let mut seen = HashSet::new();

    for (index, route) in config.routes.iter().enumerate() {
        if !route.path.starts_with('/') {
            errors.push(ValidationError::InvalidPath { index, path: route.path.clone() });
        }

        let method = route.method.to_ascii_uppercase();
        if Method::from_bytes(method.as_bytes()).is_err() || method.is_empty() {
            errors.push(ValidationError::InvalidMethod { index, method: route.method.clone() });
        }

        if !seen.insert((method.clone(), route.path.clone())) {
            errors.push(ValidationError::DuplicateRoute {
                index,
                method,
                path: route.path.clone(),
            });
        }

        // Dynamic registries learn services at runtime
        if config.registry.backend == RegistryBackendKind::Static
            && !known_services.contains(route.upstream.as_str())
        {
            errors.push(ValidationError::UnknownUpstream {
                index,
                upstream: route.upstream.clone(),
            });
        }

        if route.timeout_ms == Some(0) {
            errors.push(zero(format!("routes[{index}].timeout_ms")));
        }
        if let Some(limit) = &route.rate_limit {
            check_bucket(&format!("routes[{index}].rate_limit"), limit, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn zero(field: impl Into<String>) -> ValidationError {
    ValidationError::Zero { field: field.into() }
}

fn check_bucket(prefix: &str, limit: &RateLimitConfig, errors: &mut Vec<ValidationError>) {
    if limit.capacity == 0 {
        errors.push(zero(format!("{prefix}.capacity")));
    }
    if !limit.refill_rate.is_finite() || limit.refill_rate < 0.0 {
        errors.push(ValidationError::OutOfRange {
            field: format!("{prefix}.refill_rate"),
            reason: "must be a finite, non-negative number".into(),
        });
    }
}

fn check_breaker(breaker: &BreakerConfig, errors: &mut Vec<ValidationError>) {
    if breaker.error_threshold == 0 {
        errors.push(zero("circuit_breaker.error_threshold"));
    }
    if breaker.policy == TripPolicyKind::Rate {
        if breaker.error_threshold > 100 {
            errors.push(ValidationError::OutOfRange {
                field: "circuit_breaker.error_threshold".into(),
                reason: "rate policy expects a percentage (1-100)".into(),
            });
        }
        if breaker.window_secs == 0 {
            errors.push(zero("circuit_breaker.window_secs"));
        }
    }
    if breaker.half_open_trials == 0 {
        errors.push(zero("circuit_breaker.half_open_trials"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{RouteConfig, ServiceConfig};

    fn route(method: &str, path: &str, upstream: &str) -> RouteConfig {
        RouteConfig {
            method: method.into(),
            path: path.into(),
            upstream: upstream.into(),
            cacheable: false,
            timeout_ms: None,
            rate_limit: None,
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&GatewayConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = GatewayConfig::default();
        config.services.push(ServiceConfig { name: "svc".into(), instances: vec![] });
        config.routes.push(route("GET", "/a", "svc"));
        config.routes.push(route("get", "/a", "svc"));
        config.routes.push(route("GET", "missing-slash", "nope"));
        config.circuit_breaker.half_open_trials = 0;
        config.rate_limit.capacity = 0;

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ValidationError::DuplicateRoute { index: 1, .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidPath { index: 2, .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownUpstream { index: 2, .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::Zero { field } if field == "rate_limit.capacity")));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::Zero { field } if field == "circuit_breaker.half_open_trials")));
    }

    #[test]
    fn nacos_registry_allows_unknown_upstreams() {
        let mut config = GatewayConfig::default();
        config.registry.backend = RegistryBackendKind::Nacos;
        config.routes.push(route("POST", "/service2", "service2"));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn rate_policy_threshold_is_a_percentage() {
        let mut config = GatewayConfig::default();
        config.circuit_breaker.error_threshold = 150;
        assert!(validate_config(&config).is_err());

        config.circuit_breaker.policy = TripPolicyKind::Consecutive;
        assert!(validate_config(&config).is_ok());
    }
}
