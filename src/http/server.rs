//! HTTP server setup.
//!
//! # Responsibilities
//! - Build the Axum router: built-in endpoints plus one handler per
//!   configured route
//! - Wire up middleware (request id, tracing, timeout, rate limit, metrics)
//! - Hand each proxied request to the dispatch pipeline
//! - Serve until the shutdown broadcast fires

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, on, MethodFilter},
    Extension, Json, Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::RouteConfig;
use crate::dispatch::{cache_key, Dispatcher, HttpForwarder};
use crate::inventory::Inventory;
use crate::lifecycle::{shutdown, Gateway, StartupError};
use crate::observability::metrics;
use crate::resilience::timeouts::{effective_deadline, InboundBudget};
use crate::security::{rate_limit::rate_limit_middleware, TokenBucket};

const BUILTIN_PATHS: [&str; 2] = ["/health", "/inventory/{product_id}"];

/// Slack given to the outer request timeout so the dispatch deadline, which
/// is capped to the remaining inbound budget, always expires first.
const TIMEOUT_GRACE: Duration = Duration::from_millis(250);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub inventory: Arc<Inventory>,
    pub forwarder: HttpForwarder,
}

/// One configured route, resolved at startup.
#[derive(Debug)]
struct RouteTarget {
    method: Method,
    service: String,
    cacheable: bool,
    /// Upper bound of the forward deadline, shortened per request to the
    /// remaining inbound budget.
    timeout: Duration,
    limiter: Option<Arc<TokenBucket>>,
}

impl RouteTarget {
    fn from_config(route: &RouteConfig, forward_default: Duration) -> Result<Self, StartupError> {
        let invalid = |reason: String| StartupError::Route {
            route: format!("{} {}", route.method, route.path),
            reason,
        };

        let method = Method::from_bytes(route.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| invalid(e.to_string()))?;
        if BUILTIN_PATHS.contains(&route.path.as_str()) {
            return Err(invalid("path is reserved".to_string()));
        }

        // Bodies are part of the response but not of the key, so only GET is cached
        let cacheable = route.cacheable && method == Method::GET;
        if route.cacheable && !cacheable {
            tracing::warn!(method = %method, path = %route.path, "Only GET routes are cached; serving uncached");
        }

        Ok(Self {
            method,
            service: route.upstream.clone(),
            cacheable,
            timeout: route
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(forward_default),
            limiter: route
                .rate_limit
                .as_ref()
                .filter(|rl| rl.enabled)
                .map(|rl| Arc::new(TokenBucket::from_config(format!("route:{}", route.path), rl))),
        })
    }

    fn deadline(&self, request: &Request<Body>) -> Duration {
        let remaining = request.extensions().get::<InboundBudget>().map(InboundBudget::remaining);
        effective_deadline(self.timeout, remaining)
    }
}

/// HTTP server of the gateway.
pub struct GatewayServer {
    router: Router,
}

impl GatewayServer {
    pub fn new(gateway: &Gateway) -> Result<Self, StartupError> {
        let state = AppState {
            dispatcher: gateway.dispatcher.clone(),
            inventory: gateway.inventory.clone(),
            forwarder: gateway.forwarder.clone(),
        };
        let router = Self::build_router(gateway, state)?;
        Ok(Self { router })
    }

    fn build_router(gateway: &Gateway, state: AppState) -> Result<Router, StartupError> {
        let config = &gateway.config;
        let forward_default = Duration::from_millis(config.timeouts.forward_ms);
        let request_budget = Duration::from_secs(config.timeouts.request_secs);

        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/inventory/{product_id}", get(inventory_handler));

        for route in &config.routes {
            let target = Arc::new(RouteTarget::from_config(route, forward_default)?);
            let filter = MethodFilter::try_from(target.method.clone()).map_err(|e| StartupError::Route {
                route: format!("{} {}", route.method, route.path),
                reason: e.to_string(),
            })?;

            tracing::info!(
                method = %target.method,
                path = %route.path,
                upstream = %target.service,
                cacheable = target.cacheable,
                timeout_ms = target.timeout.as_millis() as u64,
                "Route registered"
            );

            let handler = move |State(state): State<AppState>, request: Request<Body>| {
                let target = target.clone();
                async move { proxy_handler(state, target, request).await }
            };
            router = router.route(&route.path, on(filter, handler));
        }

        let router = router
            .with_state(state)
            .route_layer(middleware::from_fn(metrics::track_metrics));

        let router = match &gateway.limiter {
            Some(limiter) => router.layer(middleware::from_fn_with_state(limiter.clone(), rate_limit_middleware)),
            None => router,
        };

        let router = router.layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    request_budget + TIMEOUT_GRACE,
                )),
        );

        // Outermost, so the budget starts before any other layer runs
        Ok(router.layer(middleware::from_fn_with_state(request_budget, stamp_inbound_budget)))
    }

    /// The fully layered router, for serving or in-process testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve on `listener` until `shutdown` fires, then drain in-flight requests.
    pub async fn run(self, listener: TcpListener, shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown::wait(shutdown))
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn stamp_inbound_budget(State(budget): State<Duration>, mut request: Request<Body>, next: Next) -> Response {
    request.extensions_mut().insert(InboundBudget::start(budget));
    next.run(request).await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "OK" }))
}

async fn inventory_handler(
    State(state): State<AppState>,
    Path(product_id): Path<String>,
    budget: Option<Extension<InboundBudget>>,
) -> Response {
    let remaining = budget.map(|Extension(budget)| budget.remaining());
    match state.inventory.stock(&product_id, remaining).await {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => {
            tracing::warn!(product_id = %product_id, service = state.inventory.service(), error = %e, "Stock lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Dispatch one request for a configured route.
async fn proxy_handler(state: AppState, target: Arc<RouteTarget>, request: Request<Body>) -> Response {
    if let Some(limiter) = &target.limiter {
        if let Err(e) = limiter.check() {
            return e.into_response();
        }
    }

    let client_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let forwarder = &state.forwarder;
    let deadline = target.deadline(&request);

    if target.cacheable {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let key = cache_key(&target.service, target.method.as_str(), path_and_query);

        let result = state
            .dispatcher
            .call_cached(&target.service, &key, deadline, |instance| async move {
                let prepared = HttpForwarder::prepare(request, &instance, client_addr)?;
                forwarder.fetch_cacheable(prepared).await
            })
            .await;
        return match result {
            Ok(cached) => cached.into_response(),
            Err(e) => e.into_response(),
        };
    }

    let result = state
        .dispatcher
        .call(&target.service, deadline, |instance| async move {
            let prepared = HttpForwarder::prepare(request, &instance, client_addr)?;
            forwarder.forward(prepared).await
        })
        .await;
    match result {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}
