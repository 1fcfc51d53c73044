// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Capability Backends (Anti-Corruption Layer)
//!
//! The facade fronts a **closed** set of backend capabilities. Each capability
//! has exactly one async trait; concrete implementations (cloud primaries,
//! secondaries, local fallbacks) live outside the domain layer and are bound to
//! the facade once, at registration time.
//!
//! ## Tenancy
//!
//! Every operation takes the caller's [`TenantId`]. Implementations must
//! partition all state by tenant; the facade never rewrites or widens the
//! tenant scope it was handed.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::envelope::TenantId;
use crate::domain::errors::BackendError;

/// The fixed set of capabilities the facade exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Database,
    Storage,
    Compute,
    Search,
    Cache,
    Llm,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::Database,
        Capability::Storage,
        Capability::Compute,
        Capability::Search,
        Capability::Cache,
        Capability::Llm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Database => "database",
            Capability::Storage => "storage",
            Capability::Compute => "compute",
            Capability::Search => "search",
            Capability::Cache => "cache",
            Capability::Llm => "llm",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority tier of an implementation within a capability's fallback chain.
///
/// Chains are always ordered `Primary`, `Secondary`, `Local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendTier {
    Primary,
    Secondary,
    Local,
}

impl fmt::Display for BackendTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendTier::Primary => f.write_str("primary"),
            BackendTier::Secondary => f.write_str("secondary"),
            BackendTier::Local => f.write_str("local"),
        }
    }
}

/// Behaviour shared by every backend, regardless of capability.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable implementation name, used in breaker keys and `served_by` annotations.
    fn name(&self) -> &str;

    /// Cheap liveness probe used by the health monitor.
    async fn health_check(&self) -> Result<(), BackendError>;
}

/// Tenant-scoped document database.
#[async_trait]
pub trait DatabaseBackend: Backend {
    async fn put_record(
        &self,
        tenant: &TenantId,
        collection: &str,
        id: &str,
        record: Value,
    ) -> Result<(), BackendError>;

    async fn get_record(
        &self,
        tenant: &TenantId,
        collection: &str,
        id: &str,
    ) -> Result<Option<Value>, BackendError>;

    /// Returns every record in `collection` whose top-level fields equal the
    /// fields of `filter`. An empty object matches everything.
    async fn query(
        &self,
        tenant: &TenantId,
        collection: &str,
        filter: &Value,
    ) -> Result<Vec<Value>, BackendError>;
}

/// Tenant-scoped blob storage.
#[async_trait]
pub trait StorageBackend: Backend {
    async fn store(&self, tenant: &TenantId, key: &str, bytes: Vec<u8>) -> Result<(), BackendError>;

    async fn retrieve(&self, tenant: &TenantId, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    async fn delete(&self, tenant: &TenantId, key: &str) -> Result<(), BackendError>;
}

/// Named function execution.
#[async_trait]
pub trait ComputeBackend: Backend {
    async fn invoke(
        &self,
        tenant: &TenantId,
        function: &str,
        payload: Value,
    ) -> Result<Value, BackendError>;
}

/// A single search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub document_id: String,
    pub score: f64,
}

/// Full-text search.
#[async_trait]
pub trait SearchBackend: Backend {
    async fn index_document(
        &self,
        tenant: &TenantId,
        document_id: &str,
        text: &str,
    ) -> Result<(), BackendError>;

    async fn search(
        &self,
        tenant: &TenantId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, BackendError>;
}

/// Key/value cache.
#[async_trait]
pub trait CacheBackend: Backend {
    async fn get(&self, tenant: &TenantId, key: &str) -> Result<Option<Value>, BackendError>;

    async fn set(
        &self,
        tenant: &TenantId,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError>;

    async fn invalidate(&self, tenant: &TenantId, key: &str) -> Result<(), BackendError>;
}

/// Options for LLM generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,

    /// Sampling temperature (0.0 = deterministic, 1.0 = creative)
    pub temperature: Option<f32>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: Some(1024),
            temperature: Some(0.2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub model: String,
}

/// Text generation.
#[async_trait]
pub trait LlmBackend: Backend {
    async fn generate(
        &self,
        tenant: &TenantId,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<Generation, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_order_by_priority() {
        let mut tiers = vec![BackendTier::Local, BackendTier::Primary, BackendTier::Secondary];
        tiers.sort();
        assert_eq!(tiers, vec![BackendTier::Primary, BackendTier::Secondary, BackendTier::Local]);
    }

    #[test]
    fn capability_serializes_lowercase() {
        let yaml = serde_yaml::to_string(&Capability::Llm).unwrap();
        assert_eq!(yaml.trim(), "llm");
        let parsed: Capability = serde_yaml::from_str("database").unwrap();
        assert_eq!(parsed, Capability::Database);
    }
}
