// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the service facade: failover across tiers, breaker
//! recovery through real traffic, and tenant partitioning of stored data.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use bulwark_core::application::{CallContext, FacadeRegistry, ServiceFacade};
use bulwark_core::domain::capability::{Backend, BackendTier, Capability, DatabaseBackend};
use bulwark_core::domain::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use bulwark_core::domain::envelope::TenantId;
use bulwark_core::domain::errors::{BackendError, FacadeError};
use bulwark_core::domain::node_config::FacadeConfigSpec;
use bulwark_core::infrastructure::local::{FilesystemBlobStore, InMemoryDatabase, TtlCache};

/// Primary database that can be switched off, counting every call it receives.
struct SwitchableDatabase {
    inner: InMemoryDatabase,
    up: AtomicBool,
    calls: AtomicUsize,
}

impl SwitchableDatabase {
    fn new() -> Self {
        Self {
            inner: InMemoryDatabase::new("managed-db"),
            up: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable("connection reset by peer".into()))
        }
    }
}

#[async_trait]
impl Backend for SwitchableDatabase {
    fn name(&self) -> &str {
        "managed-db"
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable("health endpoint unreachable".into()))
        }
    }
}

#[async_trait]
impl DatabaseBackend for SwitchableDatabase {
    async fn put_record(&self, tenant: &TenantId, collection: &str, id: &str, record: Value) -> Result<(), BackendError> {
        self.enter()?;
        self.inner.put_record(tenant, collection, id, record).await
    }

    async fn get_record(&self, tenant: &TenantId, collection: &str, id: &str) -> Result<Option<Value>, BackendError> {
        self.enter()?;
        self.inner.get_record(tenant, collection, id).await
    }

    async fn query(&self, tenant: &TenantId, collection: &str, filter: &Value) -> Result<Vec<Value>, BackendError> {
        self.enter()?;
        self.inner.query(tenant, collection, filter).await
    }
}

fn spec(threshold: u32, recovery: Duration) -> FacadeConfigSpec {
    FacadeConfigSpec {
        breaker: CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
            max_recovery_timeout: recovery * 4,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn registry(primary: Arc<SwitchableDatabase>, spec: &FacadeConfigSpec) -> FacadeRegistry {
    let facade = ServiceFacade::builder(spec)
        .database(BackendTier::Primary, primary)
        .database(BackendTier::Local, Arc::new(InMemoryDatabase::default()))
        .build()
        .unwrap();
    FacadeRegistry::new(facade)
}

#[tokio::test(start_paused = true)]
async fn test_threshold_trip_and_recovery_end_to_end() {
    let primary = Arc::new(SwitchableDatabase::new());
    let registry = registry(primary.clone(), &spec(3, Duration::from_secs(20)));
    let facade = registry.facade();
    let ctx = CallContext::new("tenant-a");
    let breaker = registry.breaker("database:managed-db").unwrap().clone();

    primary.set_up(false);
    for call in 1..=3 {
        let served = facade.get_record(&ctx, "users", "42").await.unwrap();
        assert_eq!(served.served_by.tier, BackendTier::Local, "call {call}");
        assert!(served.degraded);
        assert_eq!(primary.calls(), call);
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // 4th call: primary rejected before invocation
    let served = facade.get_record(&ctx, "users", "42").await.unwrap();
    assert_eq!(served.served_by.backend, "local-memory-db");
    assert_eq!(primary.calls(), 3);

    primary.set_up(true);
    tokio::time::advance(Duration::from_secs(20)).await;

    // 5th call: the primary is invoked exactly once and closes the breaker
    let served = facade.get_record(&ctx, "users", "42").await.unwrap();
    assert_eq!(served.served_by.backend, "managed-db");
    assert!(!served.degraded);
    assert_eq!(primary.calls(), 4);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_health_monitor_closes_breaker_without_traffic() {
    let primary = Arc::new(SwitchableDatabase::new());
    let registry = registry(primary.clone(), &spec(1, Duration::from_secs(10)));
    let ctx = CallContext::new("tenant-a");

    primary.set_up(false);
    registry.facade().get_record(&ctx, "users", "1").await.unwrap();
    let breaker = registry.breaker("database:managed-db").unwrap().clone();
    assert_eq!(breaker.state(), CircuitState::Open);

    primary.set_up(true);
    tokio::time::advance(Duration::from_secs(10)).await;
    let monitor = registry.health_monitor(Default::default());
    monitor.check_all().await;

    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(primary.calls(), 1);
    let status = registry.status();
    let database = status.iter().find(|s| s.service_name == Capability::Database).unwrap();
    assert_eq!(database.active_implementation.as_deref(), Some("managed-db"));
}

#[tokio::test(start_paused = true)]
async fn test_single_candidate_surfaces_circuit_open() {
    let primary = Arc::new(SwitchableDatabase::new());
    let facade = ServiceFacade::builder(&spec(2, Duration::from_secs(30)))
        .database(BackendTier::Primary, primary.clone())
        .build()
        .unwrap();
    let ctx = CallContext::new("tenant-a");

    primary.set_up(false);
    for _ in 0..2 {
        assert!(matches!(
            facade.get_record(&ctx, "users", "1").await,
            Err(FacadeError::TransientDependency { .. })
        ));
    }
    match facade.get_record(&ctx, "users", "1").await {
        Err(FacadeError::CircuitOpen(open)) => {
            assert_eq!(open.service, "database:managed-db");
            assert!(open.retry_after <= Duration::from_secs(30));
        }
        other => panic!("expected CircuitOpen, got {:?}", other),
    }
    assert_eq!(primary.calls(), 2);
}

#[tokio::test]
async fn test_tenants_never_observe_each_others_data() {
    let blobs = tempfile::tempdir().unwrap();
    let facade = ServiceFacade::builder(&FacadeConfigSpec::default())
        .database(BackendTier::Local, Arc::new(InMemoryDatabase::default()))
        .storage(
            BackendTier::Local,
            Arc::new(FilesystemBlobStore::new("local-fs", blobs.path()).unwrap()),
        )
        .cache(BackendTier::Local, Arc::new(TtlCache::default()))
        .build()
        .unwrap();

    let alpha = CallContext::new("tenant-alpha");
    let beta = CallContext::new("tenant-beta");

    facade.put_record(&alpha, "notes", "shared-key", json!({"owner": "alpha"})).await.unwrap();
    facade.store(&alpha, "reports/q3.pdf", b"alpha-bytes".to_vec()).await.unwrap();
    facade.cache_set(&alpha, "session", json!("alpha-session"), None).await.unwrap();

    assert_eq!(facade.get_record(&beta, "notes", "shared-key").await.unwrap().value, None);
    assert_eq!(facade.retrieve(&beta, "reports/q3.pdf").await.unwrap().value, None);
    assert_eq!(facade.cache_get(&beta, "session").await.unwrap().value, None);
    assert!(facade.query(&beta, "notes", &json!({})).await.unwrap().value.is_empty());

    facade.put_record(&beta, "notes", "shared-key", json!({"owner": "beta"})).await.unwrap();
    facade.store(&beta, "reports/q3.pdf", b"beta-bytes".to_vec()).await.unwrap();

    assert_eq!(
        facade.get_record(&alpha, "notes", "shared-key").await.unwrap().value,
        Some(json!({"owner": "alpha"}))
    );
    assert_eq!(
        facade.retrieve(&alpha, "reports/q3.pdf").await.unwrap().value,
        Some(b"alpha-bytes".to_vec())
    );

    facade.delete(&beta, "reports/q3.pdf").await.unwrap();
    assert!(facade.retrieve(&alpha, "reports/q3.pdf").await.unwrap().value.is_some());
}

#[tokio::test]
async fn test_unbound_capability_is_reported() {
    let facade = ServiceFacade::builder(&FacadeConfigSpec::default())
        .cache(BackendTier::Local, Arc::new(TtlCache::default()))
        .build()
        .unwrap();
    assert!(matches!(
        facade.search(&CallContext::new("t"), "anything", 5).await,
        Err(FacadeError::NotBound(Capability::Search))
    ));
}
