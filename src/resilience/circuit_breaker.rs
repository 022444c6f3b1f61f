//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: service assumed down, requests fail fast
//! - Half-Open: a bounded number of trial requests test for recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: trip policy crossed (consecutive failures or failure rate)
//! Open → Half-Open: first admission after the cooldown
//! Half-Open → Closed: every trial succeeded
//! Half-Open → Open: any trial failed
//! ```
//!
//! # Design Decisions
//! - Per-service breaker (not global)
//! - Transitions serialized by a per-service mutex; Closed admission reads an atomic
//! - Each transition bumps an epoch; outcomes from older epochs are ignored

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{BreakerConfig, TripPolicyKind};
use crate::observability::metrics;

/// Breaker state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl From<u8> for BreakerState {
    fn from(val: u8) -> Self {
        match val {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

/// Rejection raised while the breaker is open.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BreakerError {
    #[error("circuit open for service {service}")]
    Open { service: String },
}

/// When a Closed breaker trips.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TripPolicy {
    /// Trip after `threshold` failures in a row.
    Consecutive { threshold: u32 },
    /// Trip when failures reach `percent` of at least `min_samples` calls in the current window.
    FailureRate {
        percent: u32,
        min_samples: u32,
        window: Duration,
    },
}

/// Breaker settings shared by every service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerSettings {
    pub policy: TripPolicy,
    pub cooldown: Duration,
    pub half_open_trials: u32,
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(config: &BreakerConfig) -> Self {
        let policy = match config.policy {
            TripPolicyKind::Consecutive => TripPolicy::Consecutive {
                threshold: config.error_threshold,
            },
            TripPolicyKind::Rate => TripPolicy::FailureRate {
                percent: config.error_threshold,
                min_samples: config.min_samples.max(1),
                window: Duration::from_secs(config.window_secs),
            },
        };
        Self {
            policy,
            cooldown: Duration::from_millis(config.cooldown_ms),
            half_open_trials: config.half_open_trials.max(1),
        }
    }
}

/// Point-in-time view of one service's breaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub window_requests: u32,
    pub window_failures: u32,
    pub last_transition: Instant,
    /// Number of transitions so far.
    pub transitions: u64,
}

#[derive(Debug)]
struct Counters {
    state: BreakerState,
    consecutive_failures: u32,
    window_start: Instant,
    window_requests: u32,
    window_failures: u32,
    opened_at: Instant,
    last_transition: Instant,
    trials_admitted: u32,
    trials_succeeded: u32,
}

impl Counters {
    fn new(now: Instant) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            window_start: now,
            window_requests: 0,
            window_failures: 0,
            opened_at: now,
            last_transition: now,
            trials_admitted: 0,
            trials_succeeded: 0,
        }
    }

    fn reset_window(&mut self, now: Instant) {
        self.window_start = now;
        self.window_requests = 0;
        self.window_failures = 0;
    }
}

/// Breaker of a single service.
#[derive(Debug)]
struct ServiceBreaker {
    service: String,
    /// Lock-free copy of the state for Closed admission.
    state: AtomicU8,
    epoch: AtomicU64,
    counters: Mutex<Counters>,
}

impl ServiceBreaker {
    fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            state: AtomicU8::new(BreakerState::Closed as u8),
            epoch: AtomicU64::new(0),
            counters: Mutex::new(Counters::new(Instant::now())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        // Counters stay consistent even if a holder panicked mid-update
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return an unused Half-Open trial slot.
    fn release_trial(&self, epoch: u64) {
        let mut counters = self.lock();
        if counters.state == BreakerState::HalfOpen
            && epoch == self.epoch.load(Ordering::Acquire)
            && counters.trials_admitted > 0
        {
            counters.trials_admitted -= 1;
        }
    }

    /// Move to `to`. Caller holds the counters lock.
    fn transition(&self, counters: &mut Counters, to: BreakerState, now: Instant) {
        let from = counters.state;
        counters.state = to;
        counters.last_transition = now;
        counters.trials_admitted = 0;
        counters.trials_succeeded = 0;
        match to {
            BreakerState::Open => counters.opened_at = now,
            BreakerState::Closed => {
                counters.consecutive_failures = 0;
                counters.reset_window(now);
            }
            BreakerState::HalfOpen => {}
        }

        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.state.store(to as u8, Ordering::Release);

        tracing::info!(
            service = %self.service,
            from = from.as_str(),
            to = to.as_str(),
            "Circuit breaker transition"
        );
        metrics::record_breaker_transition(&self.service, to.as_str());
    }
}

/// Per-service circuit breakers.
#[derive(Debug)]
pub struct CircuitBreakers {
    settings: BreakerSettings,
    services: DashMap<String, Arc<ServiceBreaker>>,
}

impl CircuitBreakers {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            services: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    fn breaker(&self, service: &str) -> Arc<ServiceBreaker> {
        if let Some(b) = self.services.get(service) {
            return b.value().clone();
        }
        self.services
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(ServiceBreaker::new(service)))
            .value()
            .clone()
    }

    /// Admit one call to `service` or fail fast.
    ///
    /// The permit must be resolved with [`BreakerPermit::record`]; dropping it
    /// unresolved releases a Half-Open trial slot without recording anything.
    pub fn try_acquire(&self, service: &str) -> Result<BreakerPermit, BreakerError> {
        let breaker = self.breaker(service);

        let epoch = breaker.epoch.load(Ordering::Acquire);
        if BreakerState::from(breaker.state.load(Ordering::Acquire)) == BreakerState::Closed {
            return Ok(BreakerPermit::new(breaker, epoch, false));
        }

        let now = Instant::now();
        let mut counters = breaker.lock();
        match counters.state {
            BreakerState::Closed => {
                let epoch = breaker.epoch.load(Ordering::Acquire);
                drop(counters);
                Ok(BreakerPermit::new(breaker, epoch, false))
            }
            BreakerState::Open => {
                if now.duration_since(counters.opened_at) < self.settings.cooldown {
                    return Err(BreakerError::Open { service: service.to_string() });
                }
                breaker.transition(&mut counters, BreakerState::HalfOpen, now);
                counters.trials_admitted = 1;
                let epoch = breaker.epoch.load(Ordering::Acquire);
                drop(counters);
                Ok(BreakerPermit::new(breaker, epoch, true))
            }
            BreakerState::HalfOpen => {
                if counters.trials_admitted >= self.settings.half_open_trials {
                    return Err(BreakerError::Open { service: service.to_string() });
                }
                counters.trials_admitted += 1;
                let epoch = breaker.epoch.load(Ordering::Acquire);
                drop(counters);
                Ok(BreakerPermit::new(breaker, epoch, true))
            }
        }
    }

    /// Whether a call to `service` may proceed now.
    ///
    /// Consumes a trial slot in Half-Open; pair every `true` with
    /// [`CircuitBreakers::record_result`].
    pub fn allow(&self, service: &str) -> bool {
        match self.try_acquire(service) {
            Ok(permit) => {
                permit.detach();
                true
            }
            Err(_) => false,
        }
    }

    /// Record the outcome of a call admitted by [`CircuitBreakers::allow`].
    pub fn record_result(&self, service: &str, success: bool) {
        let breaker = self.breaker(service);
        self.apply(&breaker, None, success);
    }

    /// Current state of `service`, read without locking.
    pub fn state(&self, service: &str) -> BreakerState {
        self.services
            .get(service)
            .map(|b| BreakerState::from(b.state.load(Ordering::Acquire)))
            .unwrap_or(BreakerState::Closed)
    }

    pub fn snapshot(&self, service: &str) -> BreakerSnapshot {
        let breaker = self.breaker(service);
        let counters = breaker.lock();
        BreakerSnapshot {
            state: counters.state,
            consecutive_failures: counters.consecutive_failures,
            window_requests: counters.window_requests,
            window_failures: counters.window_failures,
            last_transition: counters.last_transition,
            transitions: breaker.epoch.load(Ordering::Acquire),
        }
    }

    fn apply(&self, breaker: &ServiceBreaker, epoch: Option<u64>, success: bool) {
        let now = Instant::now();
        let mut counters = breaker.lock();

        if let Some(epoch) = epoch {
            if epoch != breaker.epoch.load(Ordering::Acquire) {
                tracing::trace!(service = %breaker.service, success, "Ignoring outcome from an earlier breaker state");
                return;
            }
        }

        match counters.state {
            BreakerState::Closed => {
                if let TripPolicy::FailureRate { window, .. } = self.settings.policy {
                    if now.duration_since(counters.window_start) >= window {
                        counters.reset_window(now);
                    }
                }
                counters.window_requests += 1;
                if success {
                    counters.consecutive_failures = 0;
                    return;
                }
                counters.window_failures += 1;
                counters.consecutive_failures += 1;

                if self.should_trip(&counters) {
                    tracing::warn!(
                        service = %breaker.service,
                        consecutive_failures = counters.consecutive_failures,
                        window_requests = counters.window_requests,
                        window_failures = counters.window_failures,
                        "Failure threshold crossed, opening circuit"
                    );
                    breaker.transition(&mut counters, BreakerState::Open, now);
                }
            }
            // Calls admitted before the circuit opened do not move it
            BreakerState::Open => {}
            BreakerState::HalfOpen => {
                if success {
                    counters.trials_succeeded += 1;
                    if counters.trials_succeeded >= self.settings.half_open_trials {
                        breaker.transition(&mut counters, BreakerState::Closed, now);
                    }
                } else {
                    breaker.transition(&mut counters, BreakerState::Open, now);
                }
            }
        }
    }

    fn should_trip(&self, counters: &Counters) -> bool {
        match self.settings.policy {
            TripPolicy::Consecutive { threshold } => counters.consecutive_failures >= threshold,
            TripPolicy::FailureRate { percent, min_samples, .. } => {
                counters.window_requests >= min_samples
                    && u64::from(counters.window_failures) * 100
                        >= u64::from(percent) * u64::from(counters.window_requests)
            }
        }
    }
}

/// Admission for one downstream call.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<ServiceBreaker>,
    epoch: u64,
    trial: bool,
    resolved: bool,
}

impl BreakerPermit {
    fn new(breaker: Arc<ServiceBreaker>, epoch: u64, trial: bool) -> Self {
        Self {
            breaker,
            epoch,
            trial,
            resolved: false,
        }
    }

    /// Whether this call is a Half-Open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record the call's outcome against `breakers`.
    pub fn record(mut self, breakers: &CircuitBreakers, success: bool) {
        self.resolved = true;
        breakers.apply(&self.breaker, Some(self.epoch), success);
    }

    /// Give up on the call without recording an outcome.
    pub fn release(self) {
        // Drop frees the trial slot
    }

    fn detach(mut self) {
        self.resolved = true;
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial(self.epoch);
        }
    }
}
