//! Edge gateway library.
//!
//! Sits between HTTP clients and dynamically discovered backend services.
//! Each request is admitted by a token bucket, resolved through the service
//! registry, balanced over healthy instances, guarded by a per-service
//! circuit breaker and optionally answered from a two-tier cache.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod http;
pub mod inventory;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod registry;
pub mod resilience;
pub mod security;

pub use config::schema::GatewayConfig;
pub use dispatch::{DispatchError, Dispatcher};
pub use http::GatewayServer;
pub use lifecycle::{Gateway, Shutdown};
