// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Named in-process functions standing in for remote compute.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::domain::capability::{Backend, ComputeBackend};
use crate::domain::envelope::TenantId;
use crate::domain::errors::BackendError;

pub type LocalFunction = Arc<dyn Fn(&TenantId, Value) -> Result<Value, BackendError> + Send + Sync>;

pub struct LocalFunctions {
    name: String,
    functions: RwLock<HashMap<String, LocalFunction>>,
}

impl LocalFunctions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: RwLock::new(HashMap::new()),
        }
    }

    pub fn register<F>(&self, function: impl Into<String>, f: F)
    where
        F: Fn(&TenantId, Value) -> Result<Value, BackendError> + Send + Sync + 'static,
    {
        self.functions.write().insert(function.into(), Arc::new(f));
    }

    pub fn with_function<F>(self, function: impl Into<String>, f: F) -> Self
    where
        F: Fn(&TenantId, Value) -> Result<Value, BackendError> + Send + Sync + 'static,
    {
        self.register(function, f);
        self
    }

    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Backend for LocalFunctions {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[async_trait]
impl ComputeBackend for LocalFunctions {
    async fn invoke(&self, tenant: &TenantId, function: &str, payload: Value) -> Result<Value, BackendError> {
        let f = self
            .functions
            .read()
            .get(function)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("no local function named {}", function)))?;
        f(tenant, payload)
    }
}
