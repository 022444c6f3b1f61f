//! Token bucket rate limiting.
//!
//! `capacity` tokens, refilled continuously at `refill_rate` tokens per
//! second and capped at `capacity`. Each admitted request takes one token.

use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::observability::metrics;

/// Rejection raised when a bucket is empty.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("rate limit exceeded for {scope}")]
    Exceeded { scope: String },
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A shared token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    scope: String,
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(scope: impl Into<String>, capacity: u32, refill_rate: f64) -> Self {
        let capacity = f64::from(capacity);
        Self {
            scope: scope.into(),
            capacity,
            refill_rate: refill_rate.max(0.0),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(scope: impl Into<String>, config: &RateLimitConfig) -> Self {
        Self::new(scope, config.capacity, config.refill_rate)
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Take one token if available. Never blocks on anything but the bucket's own lock.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();

        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// [`TokenBucket::try_acquire`] as a typed result.
    pub fn check(&self) -> Result<(), RateLimitError> {
        if self.try_acquire() {
            Ok(())
        } else {
            tracing::warn!(scope = %self.scope, "Rate limit exceeded");
            metrics::record_rate_limited(&self.scope);
            Err(RateLimitError::Exceeded {
                scope: self.scope.clone(),
            })
        }
    }

    /// Tokens currently available, after refill.
    pub fn available(&self) -> f64 {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let elapsed = Instant::now().duration_since(state.last_refill).as_secs_f64();
        (state.tokens + elapsed * self.refill_rate).min(self.capacity)
    }
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Middleware enforcing the process-wide bucket.
pub async fn rate_limit_middleware(
    State(bucket): State<Arc<TokenBucket>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match bucket.check() {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn eleventh_acquire_fails_without_refill() {
        let bucket = TokenBucket::new("global", 10, 0.0);
        for _ in 0..10 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn refills_continuously_up_to_capacity() {
        let bucket = TokenBucket::new("global", 4, 2.0);
        for _ in 0..4 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(bucket.available(), 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn check_reports_scope() {
        let bucket = TokenBucket::new("route:/service1", 1, 0.0);
        assert!(bucket.check().is_ok());
        assert_eq!(
            bucket.check(),
            Err(RateLimitError::Exceeded { scope: "route:/service1".into() })
        );
    }

    #[test]
    fn concurrent_acquires_never_overdraw() {
        let bucket = TokenBucket::new("global", 50, 0.0);
        let admitted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| (0..20).filter(|_| bucket.try_acquire()).count()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(admitted, 50);
        assert!(bucket.available() < 1.0);
    }
}
