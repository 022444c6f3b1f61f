//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → handed to lifecycle::startup to build components
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → new service seeds swapped into the static registry
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; only registry seeds hot-reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    BalancePolicy, BreakerConfig, CacheConfig, GatewayConfig, InventoryConfig, ListenerConfig,
    LogFormat, ObservabilityConfig, RateLimitConfig, RegistryBackendKind, RegistryConfig,
    RouteConfig, ServiceConfig, TimeoutConfig, TripPolicyKind,
};
