//! Request dispatch pipeline.
//!
//! # Data Flow
//! ```text
//! Handler (after rate limiting)
//!     → [cacheable] TieredCache::get_or_load, the rest runs as the loader
//!     → CircuitBreakers::try_acquire (fail fast when open)
//!     → RegistryClient::resolve
//!     → Balancer::select + in-flight guard
//!     → forward (HTTP proxy or typed call) under a deadline
//!     → permit.record(outcome)
//! ```
//!
//! # Design Decisions
//! - Exactly one forward attempt per request, no retries
//! - Timeouts, transport errors and 5xx answers are breaker failures
//! - Admission failures (breaker open, unresolved, no healthy instance)
//!   record nothing
//! - Dropping the call future (client went away) releases the permit
//! - A streamed response keeps its instance counted as in flight until the
//!   body is finished

pub mod forward;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use futures_util::StreamExt;
use thiserror::Error;

use crate::cache::TieredCache;
use crate::load_balancer::{Balancer, InFlightGuard, SelectionError};
use crate::registry::{Instance, RegistryClient, RegistryError};
use crate::resilience::timeouts::with_deadline;
use crate::resilience::{BreakerError, CircuitBreakers};
use crate::security::RateLimitError;

pub use forward::{CachedResponse, HttpForwarder};

/// Errors from one backend call attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ForwardError {
    #[error("upstream timed out after {0}ms")]
    Timeout(u64),

    #[error("connection to {0} failed")]
    ConnectionRefused(String),

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("invalid upstream target: {0}")]
    InvalidTarget(String),

    /// Non-success answer on a path that only accepts 2xx bodies.
    #[error("upstream answered {status}")]
    Upstream { status: u16, body: Bytes },
}

impl ForwardError {
    /// Whether this outcome counts against the service's breaker.
    pub fn is_failure(&self) -> bool {
        match self {
            ForwardError::Upstream { status, .. } => *status >= 500,
            _ => true,
        }
    }
}

/// Any failure surfaced by the pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Breaker(#[from] BreakerError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    #[error(transparent)]
    Forward(#[from] ForwardError),
}

impl DispatchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::Registry(_) | DispatchError::Selection(_) => StatusCode::BAD_GATEWAY,
            DispatchError::Breaker(_) => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            DispatchError::Forward(ForwardError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Forward(ForwardError::Upstream { status, .. }) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            DispatchError::Forward(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        match self {
            DispatchError::Forward(ForwardError::Upstream { body, .. }) => (status, body).into_response(),
            other => (status, Json(serde_json::json!({ "error": other.to_string() }))).into_response(),
        }
    }
}

/// Classifies a successful call result for the breaker.
pub trait CallOutcome {
    /// The call completed but the backend reported a failure.
    fn is_failure(&self) -> bool {
        false
    }

    /// Keep the instance counted as in flight while `self` still uses it.
    fn hold_in_flight(self, guard: InFlightGuard) -> Self
    where
        Self: Sized,
    {
        drop(guard);
        self
    }
}

impl CallOutcome for Response<Body> {
    fn is_failure(&self) -> bool {
        self.status().is_server_error()
    }

    fn hold_in_flight(self, guard: InFlightGuard) -> Self {
        let (parts, body) = self.into_parts();
        let stream = body.into_data_stream().map(move |chunk| {
            let _held = &guard;
            chunk
        });
        Response::from_parts(parts, Body::from_stream(stream))
    }
}

impl CallOutcome for Bytes {}

impl CallOutcome for CachedResponse {}

/// Cache key of a cacheable route.
pub fn cache_key(service: &str, method: &str, path_and_query: &str) -> String {
    format!("{service}:{method}:{path_and_query}")
}

/// Composes registry, balancer, breaker and cache into one call path.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<RegistryClient>,
    balancer: Arc<Balancer>,
    breakers: Arc<CircuitBreakers>,
    cache: Option<Arc<TieredCache>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<RegistryClient>, balancer: Arc<Balancer>, breakers: Arc<CircuitBreakers>) -> Self {
        Self {
            registry,
            balancer,
            breakers,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<TieredCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn registry(&self) -> &Arc<RegistryClient> {
        &self.registry
    }

    pub fn balancer(&self) -> &Arc<Balancer> {
        &self.balancer
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    pub fn cache(&self) -> Option<&Arc<TieredCache>> {
        self.cache.as_ref()
    }

    /// Make one call to `service` through `forward`, bounded by `deadline`.
    pub async fn call<T, F, Fut>(&self, service: &str, deadline: Duration, forward: F) -> Result<T, DispatchError>
    where
        T: CallOutcome,
        F: FnOnce(Instance) -> Fut,
        Fut: Future<Output = Result<T, ForwardError>>,
    {
        let permit = self.breakers.try_acquire(service).inspect_err(|_| {
            tracing::debug!(service = %service, "Circuit open, failing fast");
        })?;

        // Early returns below drop the permit without an outcome
        let instances = self.registry.resolve(service).await?;
        let instance = self.balancer.select(service, &instances)?;

        let in_flight = self.balancer.track(&instance);
        let address = instance.address.clone();
        tracing::debug!(service = %service, instance = %address, trial = permit.is_trial(), "Forwarding call");

        let result = with_deadline(deadline, forward(instance)).await;
        match &result {
            Ok(value) => permit.record(&self.breakers, !value.is_failure()),
            // A bad registry entry says nothing about the service's health
            Err(ForwardError::InvalidTarget(_)) => permit.release(),
            Err(e) => permit.record(&self.breakers, !e.is_failure()),
        }

        match result {
            Ok(value) => Ok(value.hold_in_flight(in_flight)),
            Err(e) => {
                tracing::warn!(service = %service, instance = %address, error = %e, "Backend call failed");
                Err(DispatchError::from(e))
            }
        }
    }

    /// Like [`Dispatcher::call`] for buffered answers, served from the cache
    /// when possible. Without a cache this is a plain call.
    pub async fn call_cached<F, Fut>(
        &self,
        service: &str,
        key: &str,
        deadline: Duration,
        forward: F,
    ) -> Result<CachedResponse, DispatchError>
    where
        F: FnOnce(Instance) -> Fut,
        Fut: Future<Output = Result<CachedResponse, ForwardError>>,
    {
        let Some(cache) = &self.cache else {
            return self.call(service, deadline, forward).await;
        };

        let raw = cache
            .get_or_load(key, || async move {
                self.call(service, deadline, forward)
                    .await
                    .map(|response| response.encode())
            })
            .await?;
        Ok(CachedResponse::decode(raw))
    }
}
