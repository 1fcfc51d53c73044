// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-process TTL cache. Expired entries are dropped lazily on read.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;

use crate::domain::capability::{Backend, CacheBackend};
use crate::domain::envelope::TenantId;
use crate::domain::errors::BackendError;

pub struct TtlCache {
    name: String,
    default_ttl: Option<Duration>,
    entries: DashMap<(TenantId, String), (Value, Option<Instant>)>,
}

impl TtlCache {
    pub fn new(name: impl Into<String>, default_ttl: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            default_ttl,
            entries: DashMap::new(),
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, (_, expires_at)| expires_at.map_or(true, |at| at > now));
        before - self.entries.len()
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new("local-ttl-cache", Some(Duration::from_secs(300)))
    }
}

#[async_trait]
impl Backend for TtlCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for TtlCache {
    async fn get(&self, tenant: &TenantId, key: &str) -> Result<Option<Value>, BackendError> {
        let entry_key = (tenant.clone(), key.to_string());
        let expired = match self.entries.get(&entry_key) {
            None => return Ok(None),
            Some(entry) => match entry.1 {
                Some(at) if at <= Instant::now() => true,
                _ => return Ok(Some(entry.0.clone())),
            },
        };
        if expired {
            self.entries.remove(&entry_key);
        }
        Ok(None)
    }

    async fn set(&self, tenant: &TenantId, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), BackendError> {
        let expires_at = ttl.or(self.default_ttl).map(|ttl| Instant::now() + ttl);
        self.entries.insert((tenant.clone(), key.to_string()), (value, expires_at));
        Ok(())
    }

    async fn invalidate(&self, tenant: &TenantId, key: &str) -> Result<(), BackendError> {
        self.entries.remove(&(tenant.clone(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = TtlCache::new("c", None);
        let t = TenantId::new("t");
        cache.set(&t, "short", json!(1), Some(Duration::from_secs(5))).await.unwrap();
        cache.set(&t, "forever", json!(2), None).await.unwrap();

        assert_eq!(cache.get(&t, "short").await.unwrap(), Some(json!(1)));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get(&t, "short").await.unwrap(), None);
        assert_eq!(cache.get(&t, "forever").await.unwrap(), Some(json!(2)));
        assert_eq!(cache.purge_expired(), 0);
    }

    #[tokio::test]
    async fn invalidate_and_isolation() {
        let cache = TtlCache::default();
        cache.set(&"a".into(), "k", json!("a"), None).await.unwrap();
        assert_eq!(cache.get(&"b".into(), "k").await.unwrap(), None);
        cache.invalidate(&"a".into(), "k").await.unwrap();
        assert_eq!(cache.get(&"a".into(), "k").await.unwrap(), None);
    }
}
