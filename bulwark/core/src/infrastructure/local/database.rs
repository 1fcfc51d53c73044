// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory, tenant-partitioned document database.
//!
//! Last-resort fallback for the `database` capability. Nothing is persisted.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::domain::capability::{Backend, DatabaseBackend};
use crate::domain::envelope::TenantId;
use crate::domain::errors::BackendError;

type Collection = BTreeMap<String, Value>;

pub struct InMemoryDatabase {
    name: String,
    collections: RwLock<HashMap<(TenantId, String), Collection>>,
}

impl InMemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collections: RwLock::new(HashMap::new()),
        }
    }

    fn matches(record: &Value, filter: &serde_json::Map<String, Value>) -> bool {
        filter
            .iter()
            .all(|(field, expected)| record.get(field) == Some(expected))
    }
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new("local-memory-db")
    }
}

#[async_trait]
impl Backend for InMemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[async_trait]
impl DatabaseBackend for InMemoryDatabase {
    async fn put_record(
        &self,
        tenant: &TenantId,
        collection: &str,
        id: &str,
        record: Value,
    ) -> Result<(), BackendError> {
        if id.is_empty() {
            return Err(BackendError::InvalidRequest("record id cannot be empty".to_string()));
        }
        self.collections
            .write()
            .entry((tenant.clone(), collection.to_string()))
            .or_default()
            .insert(id.to_string(), record);
        Ok(())
    }

    async fn get_record(
        &self,
        tenant: &TenantId,
        collection: &str,
        id: &str,
    ) -> Result<Option<Value>, BackendError> {
        Ok(self
            .collections
            .read()
            .get(&(tenant.clone(), collection.to_string()))
            .and_then(|c| c.get(id))
            .cloned())
    }

    async fn query(
        &self,
        tenant: &TenantId,
        collection: &str,
        filter: &Value,
    ) -> Result<Vec<Value>, BackendError> {
        let match_all = serde_json::Map::new();
        let filter = match filter {
            Value::Object(map) => map,
            Value::Null => &match_all,
            other => {
                return Err(BackendError::InvalidRequest(format!(
                    "query filter must be an object, got {}",
                    other
                )))
            }
        };

        Ok(self
            .collections
            .read()
            .get(&(tenant.clone(), collection.to_string()))
            .map(|c| {
                c.values()
                    .filter(|record| Self::matches(record, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn tenants_do_not_share_records() {
        let db = InMemoryDatabase::default();
        let a = TenantId::new("tenant-a");
        let b = TenantId::new("tenant-b");

        db.put_record(&a, "users", "1", json!({"name": "ada"})).await.unwrap();
        assert_eq!(db.get_record(&a, "users", "1").await.unwrap(), Some(json!({"name": "ada"})));
        assert_eq!(db.get_record(&b, "users", "1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn query_filters_by_top_level_equality() {
        let db = InMemoryDatabase::default();
        let t = TenantId::new("tenant-a");
        db.put_record(&t, "users", "1", json!({"role": "admin", "name": "ada"})).await.unwrap();
        db.put_record(&t, "users", "2", json!({"role": "dev", "name": "bob"})).await.unwrap();
        db.put_record(&t, "users", "3", json!({"role": "admin", "name": "cy"})).await.unwrap();

        let admins = db.query(&t, "users", &json!({"role": "admin"})).await.unwrap();
        assert_eq!(admins.len(), 2);
        assert_eq!(admins[0]["name"], "ada");

        assert_eq!(db.query(&t, "users", &json!({})).await.unwrap().len(), 3);
        assert_eq!(db.query(&t, "users", &Value::Null).await.unwrap().len(), 3);
        assert!(matches!(
            db.query(&t, "users", &json!([1])).await,
            Err(BackendError::InvalidRequest(_))
        ));
    }
}
