// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Fallback Manager
//!
//! Picks which implementation of one capability serves the next call.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Priority-ordered candidate selection over breakers and provider health
//!
//! Candidates are kept in tier order (`Primary`, `Secondary`, `Local`). The
//! selection is recomputed on every call, so new calls move back to a
//! higher-priority candidate as soon as its breaker admits again; calls already
//! running on a fallback finish there.
//!
//! When no candidate admits, a chain of two or more returns its last candidate
//! as a *forced* last resort. The facade then calls it without breaker
//! admission and marks the answer degraded: availability wins over purity, and
//! callers see that through `Served::degraded`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::info;

use crate::application::health_monitor::HealthTarget;
use crate::domain::capability::{Backend, BackendTier, Capability};
use crate::domain::circuit_breaker::CircuitBreaker;
use crate::domain::errors::BackendError;
use crate::domain::health::ProviderHealth;

const NONE_SERVED: usize = usize::MAX;

/// One implementation in a fallback chain, with its own breaker and health.
pub struct Candidate<B: ?Sized> {
    pub tier: BackendTier,
    pub backend: Arc<B>,
    pub breaker: Arc<CircuitBreaker>,
    pub health: Arc<Mutex<ProviderHealth>>,
}

impl<B: ?Sized> Clone for Candidate<B> {
    fn clone(&self) -> Self {
        Self {
            tier: self.tier,
            backend: Arc::clone(&self.backend),
            breaker: Arc::clone(&self.breaker),
            health: Arc::clone(&self.health),
        }
    }
}

impl<B: Backend + ?Sized> Candidate<B> {
    pub fn new(tier: BackendTier, backend: Arc<B>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            tier,
            backend,
            breaker,
            health: Arc::new(Mutex::new(ProviderHealth::default())),
        }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// Admitting breaker and not marked unavailable by the health monitor.
    pub fn is_eligible(&self) -> bool {
        self.health.lock().available && self.breaker.is_admitting()
    }
}

/// The candidate chosen for one call.
pub struct Selection<'a, B: ?Sized> {
    pub index: usize,
    pub candidate: &'a Candidate<B>,
    /// Nothing admits; this is the last resort and must bypass admission.
    pub forced: bool,
}

pub struct FallbackManager<B: ?Sized> {
    capability: Capability,
    candidates: Vec<Candidate<B>>,
    last_served: AtomicUsize,
}

impl<B: Backend + ?Sized + 'static> FallbackManager<B> {
    pub fn new(capability: Capability, mut candidates: Vec<Candidate<B>>) -> Self {
        candidates.sort_by_key(|c| c.tier);
        Self {
            capability,
            candidates,
            last_served: AtomicUsize::new(NONE_SERVED),
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn candidates(&self) -> &[Candidate<B>] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// First eligible candidate in priority order; otherwise the forced last
    /// resort for chains of two or more. `None` for an empty chain, or a single
    /// candidate whose breaker rejects.
    pub fn select_implementation(&self) -> Option<Selection<'_, B>> {
        if let Some((index, candidate)) = self.candidates.iter().enumerate().find(|(_, c)| c.is_eligible()) {
            return Some(Selection { index, candidate, forced: false });
        }

        match self.candidates.len() {
            0 => None,
            // A lone candidate that is merely marked unavailable still gets
            // its breaker's verdict.
            1 if self.candidates[0].breaker.is_admitting() => Some(Selection {
                index: 0,
                candidate: &self.candidates[0],
                forced: false,
            }),
            1 => None,
            n => Some(Selection {
                index: n - 1,
                candidate: &self.candidates[n - 1],
                forced: true,
            }),
        }
    }

    /// The candidate a call issued now would start on.
    pub fn active(&self) -> Option<&Candidate<B>> {
        self.select_implementation().map(|s| s.candidate)
    }

    /// Record which candidate answered, logging failover and recovery.
    pub fn note_served(&self, index: usize) {
        let previous = self.last_served.swap(index, Ordering::AcqRel);
        if previous == index {
            return;
        }
        let Some(now) = self.candidates.get(index) else {
            return;
        };
        match self.candidates.get(previous) {
            Some(before) if index < previous => info!(
                capability = %self.capability,
                from = %before.name(),
                to = %now.name(),
                tier = %now.tier,
                "capability returned to higher-priority implementation"
            ),
            Some(before) => info!(
                capability = %self.capability,
                from = %before.name(),
                to = %now.name(),
                tier = %now.tier,
                "capability failed over"
            ),
            None => {}
        }
    }

    /// Health monitor targets for every candidate in this chain.
    pub fn health_targets(&self) -> Vec<HealthTarget> {
        self.candidates
            .iter()
            .map(|candidate| {
                let backend = Arc::clone(&candidate.backend);
                HealthTarget::new(
                    Arc::clone(&candidate.breaker),
                    Arc::clone(&candidate.health),
                    move || -> BoxFuture<'static, Result<(), BackendError>> {
                        let backend = Arc::clone(&backend);
                        Box::pin(async move { backend.health_check().await })
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::capability::CacheBackend;
    use crate::domain::circuit_breaker::CircuitBreakerConfig;
    use crate::infrastructure::local::TtlCache;
    use std::time::Duration;

    fn candidate(tier: BackendTier, name: &str) -> Candidate<dyn CacheBackend> {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let backend: Arc<dyn CacheBackend> = Arc::new(TtlCache::new(name, None));
        Candidate::new(
            tier,
            backend,
            Arc::new(CircuitBreaker::new(format!("cache:{}", name), config)),
        )
    }

    #[tokio::test]
    async fn picks_first_admitting_in_tier_order() {
        let manager = FallbackManager::new(
            Capability::Cache,
            vec![
                candidate(BackendTier::Local, "local"),
                candidate(BackendTier::Primary, "primary"),
                candidate(BackendTier::Secondary, "secondary"),
            ],
        );
        let names: Vec<_> = manager.candidates().iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["primary", "secondary", "local"]);

        assert_eq!(manager.select_implementation().unwrap().candidate.name(), "primary");

        manager.candidates()[0].breaker.record_failure();
        let selection = manager.select_implementation().unwrap();
        assert_eq!(selection.candidate.name(), "secondary");
        assert!(!selection.forced);

        manager.candidates()[0].breaker.reset();
        assert_eq!(manager.select_implementation().unwrap().candidate.name(), "primary");
    }

    #[tokio::test]
    async fn last_resort_when_everything_is_open() {
        let manager = FallbackManager::new(
            Capability::Cache,
            vec![candidate(BackendTier::Primary, "primary"), candidate(BackendTier::Local, "local")],
        );
        for c in manager.candidates() {
            c.breaker.record_failure();
        }
        let selection = manager.select_implementation().unwrap();
        assert_eq!(selection.candidate.name(), "local");
        assert!(selection.forced);
    }

    #[tokio::test]
    async fn single_open_candidate_has_no_selection() {
        let manager = FallbackManager::new(Capability::Cache, vec![candidate(BackendTier::Primary, "only")]);
        manager.candidates()[0].breaker.record_failure();
        assert!(manager.select_implementation().is_none());
    }

    #[tokio::test]
    async fn unavailable_health_skips_candidate() {
        let manager = FallbackManager::new(
            Capability::Cache,
            vec![candidate(BackendTier::Primary, "primary"), candidate(BackendTier::Local, "local")],
        );
        manager.candidates()[0].health.lock().set_available(false);
        assert_eq!(manager.active().unwrap().name(), "local");
    }
}
