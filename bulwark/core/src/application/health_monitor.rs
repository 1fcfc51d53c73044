// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Health Monitor - Background probes for every facade backend
//!
//! Runs one independent periodic check per registered backend and feeds the
//! result into that backend's breaker and provider health, without waiting for
//! application traffic.
//!
//! # Probe policy
//!
//! A check goes through the breaker's normal admission:
//!
//! - `Closed`: the check runs; a failure counts toward `failure_threshold`, so
//!   a breaker can open before any user call hits the dependency.
//! - `Open` inside the cooldown: the check is skipped and records nothing.
//! - `Open` with the cooldown elapsed, or `HalfOpen` with a free slot: the
//!   check *is* the half-open probe, and its success closes the breaker with no
//!   user traffic at all.
//!
//! A check that errors for any reason, including a caller-class error from a
//! misbehaving health endpoint, is a failure signal.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Proactive breaker transitions and provider availability

use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::circuit_breaker::CircuitBreaker;
use crate::domain::errors::{BackendError, CallError};
use crate::domain::health::ProviderHealth;
use crate::domain::node_config::HealthMonitorConfig;

type ProbeFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), BackendError>> + Send + Sync>;

/// One backend the monitor probes.
#[derive(Clone)]
pub struct HealthTarget {
    breaker: Arc<CircuitBreaker>,
    health: Arc<Mutex<ProviderHealth>>,
    probe: ProbeFn,
}

impl HealthTarget {
    pub fn new<F>(breaker: Arc<CircuitBreaker>, health: Arc<Mutex<ProviderHealth>>, probe: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<(), BackendError>> + Send + Sync + 'static,
    {
        Self {
            breaker,
            health,
            probe: Arc::new(probe),
        }
    }

    pub fn service(&self) -> &str {
        self.breaker.service_name()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn health(&self) -> ProviderHealth {
        self.health.lock().clone()
    }
}

/// Result of one check.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Healthy,
    Unhealthy(BackendError),
    /// The breaker is cooling down; nothing was probed or recorded.
    Skipped { retry_after: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckReport {
    pub service: String,
    pub outcome: CheckOutcome,
}

pub struct HealthMonitor {
    targets: Vec<HealthTarget>,
    config: HealthMonitorConfig,
    shutdown_token: CancellationToken,
}

impl HealthMonitor {
    pub fn new(targets: Vec<HealthTarget>, config: HealthMonitorConfig) -> Self {
        Self {
            targets,
            config,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn targets(&self) -> &[HealthTarget] {
        &self.targets
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Probe one target under its breaker.
    pub async fn check(target: &HealthTarget) -> CheckOutcome {
        let started = Instant::now();
        let probe = Arc::clone(&target.probe);
        let result = target
            .breaker
            .attempt_call(None, move || async move {
                probe().await.map_err(|err| {
                    if err.is_failure_signal() {
                        err
                    } else {
                        BackendError::Unavailable(format!("health check failed: {}", err))
                    }
                })
            })
            .await;

        match result {
            Ok(()) => {
                let mut health = target.health.lock();
                health.record_success(started.elapsed());
                health.set_available(true);
                debug!(service = %target.service(), "health check passed");
                CheckOutcome::Healthy
            }
            Err(CallError::Rejected(open)) => {
                debug!(
                    service = %target.service(),
                    retry_after = ?open.retry_after,
                    "health check skipped, breaker not admitting"
                );
                CheckOutcome::Skipped {
                    retry_after: open.retry_after,
                }
            }
            Err(CallError::Failed { source, .. }) => {
                let mut health = target.health.lock();
                health.record_failure(started.elapsed());
                health.set_available(false);
                warn!(service = %target.service(), error = %source, "health check failed");
                CheckOutcome::Unhealthy(source)
            }
        }
    }

    /// Check every target concurrently, once.
    pub async fn check_all(&self) -> Vec<CheckReport> {
        join_all(self.targets.iter().map(|target| async move {
            CheckReport {
                service: target.service().to_string(),
                outcome: Self::check(target).await,
            }
        }))
        .await
    }

    /// Start the per-target check loops in the background.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        if !self.config.enabled {
            info!("Health monitor is disabled");
            return;
        }

        info!(
            targets = self.targets.len(),
            interval = ?self.config.interval,
            "Starting health monitor background task"
        );

        join_all(self.targets.iter().map(|target| self.run_target(target))).await;

        info!("Health monitor background task stopped");
    }

    async fn run_target(&self, target: &HealthTarget) {
        let mut tick = interval(self.config.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    Self::check(target).await;
                }
                _ = self.shutdown_token.cancelled() => {
                    debug!(service = %target.service(), "Shutdown signal received, stopping health checks");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Probe {
        healthy: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
    }

    fn target(threshold: u32, recovery: Duration) -> (HealthTarget, Probe) {
        let healthy = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicUsize::new(0));
        let breaker = Arc::new(CircuitBreaker::new(
            "llm:hosted",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
                ..Default::default()
            },
        ));
        let (h, c) = (healthy.clone(), calls.clone());
        let target = HealthTarget::new(breaker, Arc::new(Mutex::new(ProviderHealth::default())), move || {
            let (h, c) = (h.clone(), c.clone());
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                if h.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err(BackendError::Unavailable("connection refused".into()))
                }
            }
            .boxed()
        });
        (target, Probe { healthy, calls })
    }

    #[tokio::test(start_paused = true)]
    async fn failing_checks_open_the_breaker_without_traffic() {
        let (target, probe) = target(2, Duration::from_secs(30));
        probe.healthy.store(false, Ordering::SeqCst);

        assert!(matches!(HealthMonitor::check(&target).await, CheckOutcome::Unhealthy(_)));
        assert_eq!(target.breaker().state(), CircuitState::Closed);
        assert!(matches!(HealthMonitor::check(&target).await, CheckOutcome::Unhealthy(_)));
        assert_eq!(target.breaker().state(), CircuitState::Open);
        assert!(!target.health().available);
    }

    #[tokio::test(start_paused = true)]
    async fn check_is_the_half_open_probe() {
        let (target, probe) = target(1, Duration::from_secs(10));
        probe.healthy.store(false, Ordering::SeqCst);
        HealthMonitor::check(&target).await;
        assert_eq!(target.breaker().state(), CircuitState::Open);

        probe.healthy.store(true, Ordering::SeqCst);
        let skipped = HealthMonitor::check(&target).await;
        assert!(matches!(skipped, CheckOutcome::Skipped { .. }));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(HealthMonitor::check(&target).await, CheckOutcome::Healthy);
        assert_eq!(target.breaker().state(), CircuitState::Closed);
        assert!(target.health().available);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_class_errors_count_as_failures() {
        let breaker = Arc::new(CircuitBreaker::new(
            "search:remote",
            CircuitBreakerConfig { failure_threshold: 1, ..Default::default() },
        ));
        let target = HealthTarget::new(breaker, Arc::new(Mutex::new(ProviderHealth::default())), || {
            async { Err(BackendError::InvalidRequest("bad health path".into())) }.boxed()
        });
        assert!(matches!(
            HealthMonitor::check(&target).await,
            CheckOutcome::Unhealthy(BackendError::Unavailable(_))
        ));
        assert_eq!(target.breaker().state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn background_loop_runs_until_cancelled() {
        let (target, probe) = target(5, Duration::from_secs(30));
        let monitor = Arc::new(HealthMonitor::new(
            vec![target],
            HealthMonitorConfig { enabled: true, interval: Duration::from_secs(5) },
        ));
        let token = monitor.shutdown_token();
        let handle = monitor.clone().start();

        tokio::time::sleep(Duration::from_secs(11)).await;
        let seen = probe.calls.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected at least 3 checks, saw {}", seen);

        token.cancel();
        handle.await.unwrap();
        let reports = monitor.check_all().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].service, "llm:hosted");
    }
}
