// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Service Facade
//!
//! The uniform call surface application code uses for every backend
//! capability. Each capability is bound once, at build time, to a typed
//! fallback chain; no string dispatch happens per call.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Breaker-guarded, tiered execution of capability operations
//!
//! # Call path
//!
//! 1. Ask the capability's [`FallbackManager`] where to start.
//! 2. Run the operation through that candidate's breaker (`attempt_call`).
//! 3. On a failure signal (unavailable, timeout, rejected by the breaker),
//!    continue down the chain; if nothing admitted and the chain has a last
//!    resort, call it without admission.
//! 4. Caller errors (`InvalidRequest`, `NotFound`) stop the walk and are
//!    returned as [`FacadeError::Backend`]; they never trigger failover.
//! 5. Every success comes back as [`Served`], naming the implementation that
//!    answered. Exhaustion is a typed error; no default value is ever made up.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::application::fallback_manager::{Candidate, FallbackManager};
use crate::application::health_monitor::HealthTarget;
use crate::domain::capability::{
    Backend, BackendTier, CacheBackend, Capability, ComputeBackend, DatabaseBackend, Generation,
    GenerationOptions, LlmBackend, SearchBackend, SearchHit, StorageBackend,
};
use crate::domain::circuit_breaker::{BreakerObserver, BreakerSnapshot, CircuitBreaker};
use crate::domain::envelope::TenantId;
use crate::domain::errors::{BackendError, CallError, CandidateFailure, FacadeError};
use crate::domain::health::{HealthState, ProviderHealth};
use crate::domain::node_config::FacadeConfigSpec;

/// Per-call context: the tenant scope and the caller's own deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct CallContext {
    pub tenant: TenantId,
    /// Total budget for the call, across every candidate tried.
    pub deadline: Option<Duration>,
}

impl CallContext {
    pub fn new(tenant: impl Into<TenantId>) -> Self {
        Self {
            tenant: tenant.into(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServedBy {
    pub backend: String,
    pub tier: BackendTier,
}

/// A result annotated with the implementation that produced it.
///
/// `served_by` and `degraded` are for observability; callers should not branch on them.
#[derive(Debug, Clone, PartialEq)]
pub struct Served<T> {
    pub value: T,
    pub served_by: ServedBy,
    /// Answered by something other than the chain's first candidate.
    pub degraded: bool,
}

impl<T> Served<T> {
    pub fn into_inner(self) -> T {
        self.value
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateStatus {
    pub backend: String,
    pub tier: BackendTier,
    pub breaker: BreakerSnapshot,
    pub health: ProviderHealth,
}

/// Aggregate status surface for one capability.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityStatus {
    pub service_name: Capability,
    pub active_implementation: Option<String>,
    pub health: HealthState,
    pub candidates: Vec<CandidateStatus>,
}

/// Capability-independent view of a bound chain.
pub trait BoundChain: Send + Sync {
    fn capability(&self) -> Capability;
    fn status(&self) -> CapabilityStatus;
    fn breakers(&self) -> Vec<Arc<CircuitBreaker>>;
    fn health_targets(&self) -> Vec<HealthTarget>;
}

impl<B: Backend + ?Sized + 'static> BoundChain for FallbackManager<B> {
    fn capability(&self) -> Capability {
        FallbackManager::capability(self)
    }

    fn status(&self) -> CapabilityStatus {
        let selection = self.select_implementation();
        let health = match &selection {
            Some(s) if s.forced => HealthState::Unhealthy,
            Some(s) if s.index == 0 => s.candidate.health.lock().state(),
            Some(_) => HealthState::Degraded,
            None => HealthState::Unhealthy,
        };
        CapabilityStatus {
            service_name: FallbackManager::capability(self),
            active_implementation: selection.map(|s| s.candidate.name().to_string()),
            health,
            candidates: self
                .candidates()
                .iter()
                .map(|c| CandidateStatus {
                    backend: c.name().to_string(),
                    tier: c.tier,
                    breaker: c.breaker.snapshot(),
                    health: c.health.lock().clone(),
                })
                .collect(),
        }
    }

    fn breakers(&self) -> Vec<Arc<CircuitBreaker>> {
        self.candidates().iter().map(|c| Arc::clone(&c.breaker)).collect()
    }

    fn health_targets(&self) -> Vec<HealthTarget> {
        FallbackManager::health_targets(self)
    }
}

pub struct ServiceFacade {
    database: Option<FallbackManager<dyn DatabaseBackend>>,
    storage: Option<FallbackManager<dyn StorageBackend>>,
    compute: Option<FallbackManager<dyn ComputeBackend>>,
    search: Option<FallbackManager<dyn SearchBackend>>,
    cache: Option<FallbackManager<dyn CacheBackend>>,
    llm: Option<FallbackManager<dyn LlmBackend>>,
}

impl ServiceFacade {
    pub fn builder(config: &FacadeConfigSpec) -> ServiceFacadeBuilder {
        ServiceFacadeBuilder::new(config.clone())
    }

    /// Every bound chain, in `Capability::ALL` order.
    pub fn chains(&self) -> Vec<&dyn BoundChain> {
        let mut chains: Vec<&dyn BoundChain> = Vec::new();
        if let Some(c) = &self.database {
            chains.push(c);
        }
        if let Some(c) = &self.storage {
            chains.push(c);
        }
        if let Some(c) = &self.compute {
            chains.push(c);
        }
        if let Some(c) = &self.search {
            chains.push(c);
        }
        if let Some(c) = &self.cache {
            chains.push(c);
        }
        if let Some(c) = &self.llm {
            chains.push(c);
        }
        chains
    }

    pub fn is_bound(&self, capability: Capability) -> bool {
        self.chains().iter().any(|c| c.capability() == capability)
    }

    pub fn status(&self) -> Vec<CapabilityStatus> {
        self.chains().iter().map(|c| c.status()).collect()
    }

    // ── database ────────────────────────────────────────────────────────────

    pub async fn put_record(
        &self,
        ctx: &CallContext,
        collection: &str,
        id: &str,
        record: Value,
    ) -> Result<Served<()>, FacadeError> {
        let tenant = &ctx.tenant;
        execute(Capability::Database, self.database.as_ref(), ctx, move |db: Arc<dyn DatabaseBackend>| {
            let record = record.clone();
            async move { db.put_record(tenant, collection, id, record).await }
        })
        .await
    }

    pub async fn get_record(
        &self,
        ctx: &CallContext,
        collection: &str,
        id: &str,
    ) -> Result<Served<Option<Value>>, FacadeError> {
        let tenant = &ctx.tenant;
        execute(Capability::Database, self.database.as_ref(), ctx, move |db: Arc<dyn DatabaseBackend>| async move {
            db.get_record(tenant, collection, id).await
        })
        .await
    }

    pub async fn query(
        &self,
        ctx: &CallContext,
        collection: &str,
        filter: &Value,
    ) -> Result<Served<Vec<Value>>, FacadeError> {
        let tenant = &ctx.tenant;
        execute(Capability::Database, self.database.as_ref(), ctx, move |db: Arc<dyn DatabaseBackend>| async move {
            db.query(tenant, collection, filter).await
        })
        .await
    }

    // ── storage ─────────────────────────────────────────────────────────────

    pub async fn store(&self, ctx: &CallContext, key: &str, bytes: Vec<u8>) -> Result<Served<()>, FacadeError> {
        let tenant = &ctx.tenant;
        execute(Capability::Storage, self.storage.as_ref(), ctx, move |s: Arc<dyn StorageBackend>| {
            let bytes = bytes.clone();
            async move { s.store(tenant, key, bytes).await }
        })
        .await
    }

    pub async fn retrieve(&self, ctx: &CallContext, key: &str) -> Result<Served<Option<Vec<u8>>>, FacadeError> {
        let tenant = &ctx.tenant;
        execute(Capability::Storage, self.storage.as_ref(), ctx, move |s: Arc<dyn StorageBackend>| async move {
            s.retrieve(tenant, key).await
        })
        .await
    }

    pub async fn delete(&self, ctx: &CallContext, key: &str) -> Result<Served<()>, FacadeError> {
        let tenant = &ctx.tenant;
        execute(Capability::Storage, self.storage.as_ref(), ctx, move |s: Arc<dyn StorageBackend>| async move {
            s.delete(tenant, key).await
        })
        .await
    }

    // ── compute ─────────────────────────────────────────────────────────────

    pub async fn invoke(&self, ctx: &CallContext, function: &str, payload: Value) -> Result<Served<Value>, FacadeError> {
        let tenant = &ctx.tenant;
        execute(Capability::Compute, self.compute.as_ref(), ctx, move |c: Arc<dyn ComputeBackend>| {
            let payload = payload.clone();
            async move { c.invoke(tenant, function, payload).await }
        })
        .await
    }

    // ── search ──────────────────────────────────────────────────────────────

    pub async fn index_document(&self, ctx: &CallContext, document_id: &str, text: &str) -> Result<Served<()>, FacadeError> {
        let tenant = &ctx.tenant;
        execute(Capability::Search, self.search.as_ref(), ctx, move |s: Arc<dyn SearchBackend>| async move {
            s.index_document(tenant, document_id, text).await
        })
        .await
    }

    pub async fn search(&self, ctx: &CallContext, query: &str, limit: usize) -> Result<Served<Vec<SearchHit>>, FacadeError> {
        let tenant = &ctx.tenant;
        execute(Capability::Search, self.search.as_ref(), ctx, move |s: Arc<dyn SearchBackend>| async move {
            s.search(tenant, query, limit).await
        })
        .await
    }

    // ── cache ───────────────────────────────────────────────────────────────

    pub async fn cache_get(&self, ctx: &CallContext, key: &str) -> Result<Served<Option<Value>>, FacadeError> {
        let tenant = &ctx.tenant;
        execute(Capability::Cache, self.cache.as_ref(), ctx, move |c: Arc<dyn CacheBackend>| async move {
            c.get(tenant, key).await
        })
        .await
    }

    pub async fn cache_set(
        &self,
        ctx: &CallContext,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<Served<()>, FacadeError> {
        let tenant = &ctx.tenant;
        execute(Capability::Cache, self.cache.as_ref(), ctx, move |c: Arc<dyn CacheBackend>| {
            let value = value.clone();
            async move { c.set(tenant, key, value, ttl).await }
        })
        .await
    }

    pub async fn cache_invalidate(&self, ctx: &CallContext, key: &str) -> Result<Served<()>, FacadeError> {
        let tenant = &ctx.tenant;
        execute(Capability::Cache, self.cache.as_ref(), ctx, move |c: Arc<dyn CacheBackend>| async move {
            c.invalidate(tenant, key).await
        })
        .await
    }

    // ── llm ─────────────────────────────────────────────────────────────────

    pub async fn generate(
        &self,
        ctx: &CallContext,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<Served<Generation>, FacadeError> {
        let tenant = &ctx.tenant;
        execute(Capability::Llm, self.llm.as_ref(), ctx, move |l: Arc<dyn LlmBackend>| async move {
            l.generate(tenant, prompt, options).await
        })
        .await
    }
}

/// `None` once the caller's deadline has passed; otherwise the budget left for
/// the next attempt (`Some(None)` when the caller set no deadline).
fn remaining_budget(expires_at: Option<Instant>) -> Option<Option<Duration>> {
    match expires_at {
        None => Some(None),
        Some(at) => {
            let left = at.saturating_duration_since(Instant::now());
            (!left.is_zero()).then_some(Some(left))
        }
    }
}

fn candidate_failure<B: Backend + ?Sized>(candidate: &Candidate<B>, error: impl ToString) -> CandidateFailure {
    CandidateFailure {
        backend: candidate.name().to_string(),
        tier: candidate.tier,
        error: error.to_string(),
    }
}

enum Attempt<T> {
    Served(T),
    /// Failure signal or breaker rejection: try the next candidate.
    Next { rejected: bool },
    /// Terminal for the whole call.
    Stop(FacadeError),
}

async fn attempt<B, T, F, Fut>(
    chain: &FallbackManager<B>,
    index: usize,
    forced: bool,
    budget: Option<Duration>,
    op: &F,
    failures: &mut Vec<CandidateFailure>,
) -> Attempt<Served<T>>
where
    B: Backend + ?Sized + 'static,
    F: Fn(Arc<B>) -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let capability = chain.capability();
    let candidate = &chain.candidates()[index];
    let single = chain.len() == 1;
    let started = Instant::now();

    let call = || op(Arc::clone(&candidate.backend));
    let result = if forced {
        candidate.breaker.force_call(budget, call).await
    } else {
        candidate.breaker.attempt_call(budget, call).await
    };
    let elapsed = started.elapsed();

    match result {
        Ok(value) => {
            let degraded = forced || index > 0;
            candidate.health.lock().record_success(elapsed);
            crate::metrics::record_facade_call(
                capability,
                candidate.tier,
                if degraded { "degraded" } else { "ok" },
                elapsed.as_secs_f64(),
            );
            chain.note_served(index);
            if degraded {
                debug!(
                    capability = %capability,
                    backend = %candidate.name(),
                    tier = %candidate.tier,
                    forced,
                    "served by fallback implementation"
                );
            }
            Attempt::Served(Served {
                value,
                served_by: ServedBy {
                    backend: candidate.name().to_string(),
                    tier: candidate.tier,
                },
                degraded,
            })
        }
        Err(CallError::Rejected(open)) => {
            crate::metrics::record_facade_call(capability, candidate.tier, "rejected", 0.0);
            if single {
                return Attempt::Stop(FacadeError::CircuitOpen(open));
            }
            failures.push(candidate_failure(candidate, &open));
            Attempt::Next { rejected: true }
        }
        Err(CallError::Failed { service, source }) if source.is_failure_signal() => {
            candidate.health.lock().record_failure(elapsed);
            crate::metrics::record_facade_call(capability, candidate.tier, "failed", elapsed.as_secs_f64());
            warn!(
                capability = %capability,
                service = %service,
                error = %source,
                "backend call failed"
            );
            if single {
                return Attempt::Stop(FacadeError::TransientDependency { service, source });
            }
            failures.push(candidate_failure(candidate, &source));
            Attempt::Next { rejected: false }
        }
        Err(CallError::Failed { service, source }) => {
            // The dependency answered; the request itself was wrong.
            candidate.health.lock().record_success(elapsed);
            crate::metrics::record_facade_call(capability, candidate.tier, "caller_error", elapsed.as_secs_f64());
            Attempt::Stop(FacadeError::Backend { service, source })
        }
    }
}

async fn execute<B, T, F, Fut>(
    capability: Capability,
    chain: Option<&FallbackManager<B>>,
    ctx: &CallContext,
    op: F,
) -> Result<Served<T>, FacadeError>
where
    B: Backend + ?Sized + 'static,
    F: Fn(Arc<B>) -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let chain = match chain {
        Some(chain) if !chain.is_empty() => chain,
        _ => return Err(FacadeError::NotBound(capability)),
    };
    let expires_at = ctx.deadline.map(|d| Instant::now() + d);
    let candidates = chain.candidates();
    let last = candidates.len() - 1;

    let (start, forced) = match chain.select_implementation() {
        Some(selection) => (selection.index, selection.forced),
        // lone candidate not admitting; the attempt below surfaces CircuitOpen
        None => (0, false),
    };

    let mut failures: Vec<CandidateFailure> = candidates[..start]
        .iter()
        .map(|c| candidate_failure(c, "skipped: not admitting"))
        .collect();

    let mut last_rejected = true;
    if !forced {
        for index in start..candidates.len() {
            let Some(budget) = remaining_budget(expires_at) else {
                failures.push(candidate_failure(&candidates[index], "caller deadline elapsed"));
                return Err(FacadeError::Exhausted { capability, failures });
            };
            match attempt(chain, index, false, budget, &op, &mut failures).await {
                Attempt::Served(served) => return Ok(served),
                Attempt::Stop(err) => return Err(err),
                Attempt::Next { rejected } => {
                    if index == last {
                        last_rejected = rejected;
                    }
                }
            }
        }
    }

    // Last resort: only when the final candidate never actually ran.
    if candidates.len() > 1 && last_rejected {
        if let Some(budget) = remaining_budget(expires_at) {
            match attempt(chain, last, true, budget, &op, &mut failures).await {
                Attempt::Served(served) => return Ok(served),
                Attempt::Stop(err) => return Err(err),
                Attempt::Next { .. } => {}
            }
        }
    }

    warn!(
        capability = %capability,
        tenant = %ctx.tenant,
        attempted = failures.len(),
        "every implementation failed"
    );
    Err(FacadeError::Exhausted { capability, failures })
}

/// Binds backends to capabilities and builds their breakers.
pub struct ServiceFacadeBuilder {
    config: FacadeConfigSpec,
    observer: Option<Arc<dyn BreakerObserver>>,
    database: Vec<(BackendTier, Arc<dyn DatabaseBackend>)>,
    storage: Vec<(BackendTier, Arc<dyn StorageBackend>)>,
    compute: Vec<(BackendTier, Arc<dyn ComputeBackend>)>,
    search: Vec<(BackendTier, Arc<dyn SearchBackend>)>,
    cache: Vec<(BackendTier, Arc<dyn CacheBackend>)>,
    llm: Vec<(BackendTier, Arc<dyn LlmBackend>)>,
}

impl ServiceFacadeBuilder {
    pub fn new(config: FacadeConfigSpec) -> Self {
        Self {
            config,
            observer: None,
            database: Vec::new(),
            storage: Vec::new(),
            compute: Vec::new(),
            search: Vec::new(),
            cache: Vec::new(),
            llm: Vec::new(),
        }
    }

    /// Attach an observer (typically the event bus) to every breaker built.
    pub fn with_observer(mut self, observer: Arc<dyn BreakerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn database(mut self, tier: BackendTier, backend: Arc<dyn DatabaseBackend>) -> Self {
        self.database.push((tier, backend));
        self
    }

    pub fn storage(mut self, tier: BackendTier, backend: Arc<dyn StorageBackend>) -> Self {
        self.storage.push((tier, backend));
        self
    }

    pub fn compute(mut self, tier: BackendTier, backend: Arc<dyn ComputeBackend>) -> Self {
        self.compute.push((tier, backend));
        self
    }

    pub fn search(mut self, tier: BackendTier, backend: Arc<dyn SearchBackend>) -> Self {
        self.search.push((tier, backend));
        self
    }

    pub fn cache(mut self, tier: BackendTier, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache.push((tier, backend));
        self
    }

    pub fn llm(mut self, tier: BackendTier, backend: Arc<dyn LlmBackend>) -> Self {
        self.llm.push((tier, backend));
        self
    }

    /// Build every chain. Fails on an invalid breaker config or two backends
    /// of one capability sharing a name (their breakers would collide).
    pub fn build(self) -> anyhow::Result<ServiceFacade> {
        Ok(ServiceFacade {
            database: self.chain(Capability::Database, &self.database)?,
            storage: self.chain(Capability::Storage, &self.storage)?,
            compute: self.chain(Capability::Compute, &self.compute)?,
            search: self.chain(Capability::Search, &self.search)?,
            cache: self.chain(Capability::Cache, &self.cache)?,
            llm: self.chain(Capability::Llm, &self.llm)?,
        })
    }

    fn chain<B: Backend + ?Sized + 'static>(
        &self,
        capability: Capability,
        bindings: &[(BackendTier, Arc<B>)],
    ) -> anyhow::Result<Option<FallbackManager<B>>> {
        if bindings.is_empty() {
            return Ok(None);
        }
        let config = self.config.breaker_for(capability);
        config.validate()?;

        let mut candidates = Vec::with_capacity(bindings.len());
        for (tier, backend) in bindings {
            let service = format!("{}:{}", capability, backend.name());
            if candidates.iter().any(|c: &Candidate<B>| c.breaker.service_name() == service) {
                anyhow::bail!("duplicate backend '{}' bound to {}", backend.name(), capability);
            }
            let mut breaker = CircuitBreaker::new(service, config.clone());
            if let Some(observer) = &self.observer {
                breaker = breaker.with_observer(Arc::clone(observer));
            }
            candidates.push(Candidate::new(*tier, Arc::clone(backend), Arc::new(breaker)));
        }
        Ok(Some(FallbackManager::new(capability, candidates)))
    }
}
