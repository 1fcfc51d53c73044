// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Circuit Breaker
//!
//! Per-service state machine gating calls to a dependency.
//!
//! ```text
//! Closed ──failures >= failure_threshold──▶ Open
//! Open ──recovery_timeout elapsed, next admission──▶ HalfOpen
//! HalfOpen ──success_threshold successes──▶ Closed
//! HalfOpen ──any failure──▶ Open (recovery_timeout doubles, capped)
//! ```
//!
//! ## Invariants
//!
//! - All state lives behind one mutex per breaker; transitions are totally
//!   ordered per service and never share a lock with another breaker.
//! - At most `half_open_max_probes` calls are admitted while `HalfOpen`; extra
//!   callers are rejected, never queued.
//! - Every admitted call holds a [`CallPermit`]. A permit dropped without an
//!   outcome (the caller was cancelled) counts as a failure.
//! - Each transition bumps a generation counter. Outcomes of calls admitted in
//!   an earlier generation are ignored, so a slow call admitted while `Closed`
//!   cannot close a breaker that has since opened.
//! - Transitions are logged, counted and pushed to the optional
//!   [`BreakerObserver`]; that is the only signal other components observe.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::errors::{BackendError, CallError, CircuitOpenError};
use crate::domain::events::{BreakerTransition, TransitionReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("CLOSED"),
            CircuitState::Open => f.write_str("OPEN"),
            CircuitState::HalfOpen => f.write_str("HALF_OPEN"),
        }
    }
}

/// Immutable per-instance breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cooldown before the first half-open probe.
    #[serde(default = "default_recovery_timeout", with = "humantime_serde")]
    pub recovery_timeout: Duration,

    /// Upper bound for the cooldown after repeated trips.
    #[serde(default = "default_max_recovery_timeout", with = "humantime_serde")]
    pub max_recovery_timeout: Duration,

    /// Concurrent calls admitted while half-open.
    #[serde(default = "default_one")]
    pub half_open_max_probes: u32,

    /// Consecutive half-open successes needed to close.
    #[serde(default = "default_one")]
    pub success_threshold: u32,

    /// Hard ceiling on a single wrapped call.
    #[serde(default = "default_timeout_per_call", with = "humantime_serde")]
    pub timeout_per_call: Duration,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_recovery_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_one() -> u32 {
    1
}

fn default_timeout_per_call() -> Duration {
    Duration::from_secs(10)
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
            max_recovery_timeout: default_max_recovery_timeout(),
            half_open_max_probes: default_one(),
            success_threshold: default_one(),
            timeout_per_call: default_timeout_per_call(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.failure_threshold < 1 {
            anyhow::bail!("failure_threshold must be at least 1");
        }
        if self.half_open_max_probes < 1 {
            anyhow::bail!("half_open_max_probes must be at least 1");
        }
        if self.success_threshold < 1 {
            anyhow::bail!("success_threshold must be at least 1");
        }
        if self.timeout_per_call.is_zero() {
            anyhow::bail!("timeout_per_call must be greater than zero");
        }
        if self.max_recovery_timeout < self.recovery_timeout {
            anyhow::bail!(
                "max_recovery_timeout ({:?}) must not be shorter than recovery_timeout ({:?})",
                self.max_recovery_timeout,
                self.recovery_timeout
            );
        }
        Ok(())
    }

    /// Cooldown after the `trips`-th consecutive trip: doubles per trip, capped.
    pub fn recovery_timeout_for(&self, trips: u32) -> Duration {
        let factor = 1u32.checked_shl(trips.saturating_sub(1)).unwrap_or(u32::MAX);
        self.recovery_timeout
            .saturating_mul(factor)
            .min(self.max_recovery_timeout)
    }
}

/// Receives every state transition of the breakers it is attached to.
pub trait BreakerObserver: Send + Sync {
    fn on_transition(&self, transition: &BreakerTransition);
}

/// Health/status surface for a single breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub service_name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_transition_at: DateTime<Utc>,
    pub trips: u32,
    #[serde(with = "humantime_serde")]
    pub current_recovery_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Abandoned,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    in_flight_probes: u32,
    generation: u64,
    /// Consecutive trips since the last close; drives the cooldown backoff.
    trips: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    last_transition_at: DateTime<Utc>,
    current_recovery_timeout: Duration,
}

pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    observer: Option<Arc<dyn BreakerObserver>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let current_recovery_timeout = config.recovery_timeout;
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                in_flight_probes: 0,
                generation: 0,
                trips: 0,
                opened_at: None,
                opened_at_wall: None,
                last_transition_at: Utc::now(),
                current_recovery_timeout,
            }),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn BreakerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call issued now would be admitted.
    pub fn is_admitting(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => Self::remaining_cooldown(&inner).is_zero(),
            CircuitState::HalfOpen => inner.in_flight_probes < self.config.half_open_max_probes,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            service_name: self.service.clone(),
            state: inner.state,
            failure_count: inner.consecutive_failures,
            opened_at: inner.opened_at_wall,
            last_transition_at: inner.last_transition_at,
            trips: inner.trips,
            current_recovery_timeout: inner.current_recovery_timeout,
        }
    }

    /// Admit a call, or reject it without touching the dependency.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpenError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(self, inner.generation, false)),
            CircuitState::Open => {
                let remaining = Self::remaining_cooldown(&inner);
                if !remaining.is_zero() {
                    return Err(CircuitOpenError {
                        service: self.service.clone(),
                        state: CircuitState::Open,
                        retry_after: remaining,
                    });
                }
                self.transition(&mut inner, CircuitState::HalfOpen, TransitionReason::RecoveryTimeoutElapsed);
                inner.in_flight_probes = 1;
                Ok(CallPermit::new(self, inner.generation, true))
            }
            CircuitState::HalfOpen => {
                if inner.in_flight_probes >= self.config.half_open_max_probes {
                    debug!(service = %self.service, "half-open probe window saturated, rejecting");
                    return Err(CircuitOpenError {
                        service: self.service.clone(),
                        state: CircuitState::HalfOpen,
                        retry_after: Duration::ZERO,
                    });
                }
                inner.in_flight_probes += 1;
                Ok(CallPermit::new(self, inner.generation, true))
            }
        }
    }

    /// Admit a call regardless of state. Used only for a fallback chain's last resort.
    ///
    /// Outcomes of a forced call made while `Open` do not move the breaker.
    pub fn force_acquire(&self) -> CallPermit<'_> {
        let inner = self.inner.lock();
        CallPermit::new(self, inner.generation, false)
    }

    /// Run `call` under this breaker: admission, `timeout_per_call`, accounting.
    ///
    /// `deadline` is the caller's own budget; the effective timeout is the
    /// shorter of the two, and its expiry counts as a failure.
    pub async fn attempt_call<T, F, Fut>(&self, deadline: Option<Duration>, call: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let permit = self.try_acquire()?;
        self.run(permit, deadline, call).await
    }

    /// [`Self::attempt_call`] without admission control.
    pub async fn force_call<T, F, Fut>(&self, deadline: Option<Duration>, call: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let permit = self.force_acquire();
        self.run(permit, deadline, call).await
    }

    async fn run<T, F, Fut>(&self, permit: CallPermit<'_>, deadline: Option<Duration>, call: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let budget = match deadline {
            Some(deadline) => deadline.min(self.config.timeout_per_call),
            None => self.config.timeout_per_call,
        };

        match tokio::time::timeout(budget, call()).await {
            Ok(Ok(value)) => {
                permit.success();
                Ok(value)
            }
            Ok(Err(err)) if err.is_failure_signal() => {
                permit.failure();
                Err(CallError::Failed { service: self.service.clone(), source: err })
            }
            Ok(Err(err)) => {
                // The dependency answered; a caller mistake says nothing about its health.
                permit.success();
                Err(CallError::Failed { service: self.service.clone(), source: err })
            }
            Err(_) => {
                permit.failure();
                Err(CallError::Failed {
                    service: self.service.clone(),
                    source: BackendError::Timeout(budget),
                })
            }
        }
    }

    /// Record a success observed outside of an admitted call (e.g. an external signal).
    pub fn record_success(&self) {
        let generation = self.inner.lock().generation;
        self.settle(generation, false, Outcome::Success);
    }

    /// Record a failure observed outside of an admitted call.
    pub fn record_failure(&self) {
        let generation = self.inner.lock().generation;
        self.settle(generation, false, Outcome::Failure);
    }

    /// Force the breaker closed and clear all counters. Ops/testing only.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed, TransitionReason::ManualReset);
        } else {
            inner.consecutive_failures = 0;
            inner.consecutive_successes = 0;
            inner.trips = 0;
            inner.current_recovery_timeout = self.config.recovery_timeout;
        }
    }

    fn remaining_cooldown(inner: &BreakerState) -> Duration {
        match inner.opened_at {
            Some(opened_at) => inner
                .current_recovery_timeout
                .saturating_sub(Instant::now().saturating_duration_since(opened_at)),
            None => Duration::ZERO,
        }
    }

    fn settle(&self, generation: u64, probe: bool, outcome: Outcome) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            debug!(
                service = %self.service,
                ?outcome,
                "ignoring outcome of a call admitted before the last transition"
            );
            return;
        }

        match (inner.state, outcome) {
            (CircuitState::Closed, Outcome::Success) => {
                inner.consecutive_failures = 0;
            }
            (CircuitState::Closed, Outcome::Failure | Outcome::Abandoned) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    let failures = inner.consecutive_failures;
                    self.transition(&mut inner, CircuitState::Open, TransitionReason::FailureThreshold { failures });
                }
            }
            (CircuitState::HalfOpen, Outcome::Success) => {
                if probe {
                    inner.in_flight_probes = inner.in_flight_probes.saturating_sub(1);
                }
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    let successes = inner.consecutive_successes;
                    self.transition(&mut inner, CircuitState::Closed, TransitionReason::ProbeSucceeded { successes });
                }
            }
            (CircuitState::HalfOpen, Outcome::Failure | Outcome::Abandoned) => {
                self.transition(&mut inner, CircuitState::Open, TransitionReason::ProbeFailed);
            }
            (CircuitState::Open, _) => {
                debug!(service = %self.service, ?outcome, "outcome recorded while open; state unchanged");
            }
        }
    }

    /// Apply a transition. Caller holds the lock.
    fn transition(&self, inner: &mut BreakerState, to: CircuitState, reason: TransitionReason) {
        let from = inner.state;
        let now = Utc::now();

        inner.state = to;
        inner.generation += 1;
        inner.last_transition_at = now;
        inner.consecutive_successes = 0;
        inner.in_flight_probes = 0;

        match to {
            CircuitState::Open => {
                inner.trips = inner.trips.saturating_add(1);
                inner.current_recovery_timeout = self.config.recovery_timeout_for(inner.trips);
                inner.opened_at = Some(Instant::now());
                inner.opened_at_wall = Some(now);
                warn!(
                    service = %self.service,
                    from = %from,
                    to = %to,
                    reason = %reason,
                    recovery_timeout = ?inner.current_recovery_timeout,
                    "circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(service = %self.service, from = %from, to = %to, reason = %reason, "circuit breaker probing");
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.trips = 0;
                inner.opened_at = None;
                inner.opened_at_wall = None;
                inner.current_recovery_timeout = self.config.recovery_timeout;
                info!(service = %self.service, from = %from, to = %to, reason = %reason, "circuit breaker closed");
            }
        }

        crate::metrics::record_breaker_transition(&self.service, to);

        if let Some(observer) = &self.observer {
            observer.on_transition(&BreakerTransition {
                service: self.service.clone(),
                from,
                to,
                reason,
                at: now,
            });
        }
    }
}

/// Admission token for one call through a [`CircuitBreaker`].
#[derive(Debug)]
#[must_use = "a dropped permit is recorded as a failed call"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, generation: u64, probe: bool) -> Self {
        Self { breaker, generation, probe, settled: false }
    }

    /// Whether this call occupies a half-open probe slot.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, self.probe, Outcome::Success);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, self.probe, Outcome::Failure);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.generation, self.probe, Outcome::Abandoned);
        }
    }
}
