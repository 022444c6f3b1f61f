//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the edge gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Dynamic routes proxied through the dispatcher.
    pub routes: Vec<RouteConfig>,

    /// Static service seeds for the registry.
    pub services: Vec<ServiceConfig>,

    /// Registry backend selection and refresh cadence.
    pub registry: RegistryConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Global rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Circuit breaker policy shared by all services.
    pub circuit_breaker: BreakerConfig,

    /// Multi-tier cache settings.
    pub cache: CacheConfig,

    /// Instance selection policy.
    pub load_balancer: LoadBalancerConfig,

    /// Typed stock lookup backend.
    pub inventory: InventoryConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// A dynamic route `{method, path, upstream}`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RouteConfig {
    /// HTTP method to match (e.g., "GET").
    pub method: String,

    /// Axum path pattern (e.g., "/service1" or "/users/{id}").
    pub path: String,

    /// Service name the route dispatches to.
    pub upstream: String,

    /// Serve repeatable responses from the multi-tier cache.
    #[serde(default)]
    pub cacheable: bool,

    /// Per-route forward deadline, overrides `timeouts.forward_ms`.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Per-route token bucket, applied in addition to the global one.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

/// Static instances of one service.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    /// Instance addresses, e.g. "http://127.0.0.1:8081".
    #[serde(default)]
    pub instances: Vec<String>,
}

/// Which registry backend answers `list_instances`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackendKind {
    Static,
    Nacos,
}

/// Registry configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    pub backend: RegistryBackendKind,

    /// Base URL of the Nacos server (e.g., "http://127.0.0.1:8848").
    pub nacos_address: String,

    /// Nacos namespace id.
    pub namespace: String,

    /// Background refresh interval in seconds.
    pub refresh_interval_secs: u64,

    /// Timeout for one registry round-trip in milliseconds.
    pub timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackendKind::Static,
            nacos_address: "http://127.0.0.1:8848".to_string(),
            namespace: "public".to_string(),
            refresh_interval_secs: 10,
            timeout_ms: 5000,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Inbound request timeout (total time for request/response) in seconds.
    pub request_secs: u64,

    /// Default deadline for one downstream forward in milliseconds.
    pub forward_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 30,
            forward_ms: 5000,
        }
    }
}

/// Token bucket configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting (ignored for per-route buckets).
    pub enabled: bool,

    /// Bucket capacity (burst size).
    pub capacity: u32,

    /// Tokens added per second.
    pub refill_rate: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 200,
            refill_rate: 1000.0,
        }
    }
}

/// How the breaker decides to trip while Closed.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TripPolicyKind {
    /// `error_threshold` consecutive failures.
    Consecutive,
    /// Failure rate >= `error_threshold` percent over at least `min_samples` calls in a window.
    Rate,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    pub policy: TripPolicyKind,

    /// Failure count (consecutive) or failure percent (rate).
    pub error_threshold: u32,

    /// Minimum calls in the window before the rate policy may trip.
    pub min_samples: u32,

    /// Length of the counting window for the rate policy, in seconds.
    pub window_secs: u64,

    /// Time spent Open before a trial is admitted, in milliseconds.
    pub cooldown_ms: u64,

    /// Number of trial calls admitted in HalfOpen.
    pub half_open_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            policy: TripPolicyKind::Rate,
            error_threshold: 50,
            min_samples: 20,
            window_secs: 10,
            cooldown_ms: 5000,
            half_open_trials: 1,
        }
    }
}

/// Multi-tier cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Expiry of entries in the in-process tier, in seconds.
    pub local_ttl_secs: u64,

    /// Expiry of entries in the distributed tier, in seconds.
    pub distributed_ttl_secs: u64,

    /// Upper bound on in-process entries.
    pub local_max_entries: usize,

    /// Redis URL for the distributed tier; the tier is disabled when absent.
    pub redis_url: Option<String>,

    /// Bound on one distributed-tier call; exceeding it counts as a miss.
    pub distributed_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_ttl_secs: 30,
            distributed_ttl_secs: 3600,
            local_max_entries: 10_000,
            redis_url: None,
            distributed_timeout_ms: 100,
        }
    }
}

/// Load balancing policy.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BalancePolicy {
    #[default]
    Random,
    RoundRobin,
    LeastConnections,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub policy: BalancePolicy,
}

/// Stock lookup backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct InventoryConfig {
    /// Service name of the inventory backend.
    pub service: String,

    /// Deadline of one stock query in milliseconds.
    pub timeout_ms: u64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            service: "inventory".to_string(),
            timeout_ms: 5000,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
