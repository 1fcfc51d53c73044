// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::collections::{HashMap, HashSet};

use crate::domain::envelope::{AgentId, TenantId};

/// Grant wildcard: the caller may act for any tenant.
pub const ANY_TENANT: &str = "*";

/// Decides whether a caller may act within a tenant scope.
pub trait TenantAuthorizer: Send + Sync {
    fn is_authorized(&self, caller: &AgentId, tenant: &TenantId) -> bool;
}

/// Fixed caller → tenants grant table, loaded from config.
#[derive(Debug, Clone, Default)]
pub struct StaticTenantPolicy {
    grants: HashMap<AgentId, HashSet<String>>,
}

impl StaticTenantPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, caller: impl Into<AgentId>, tenants: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.grants
            .entry(caller.into())
            .or_default()
            .extend(tenants.into_iter().map(Into::into));
        self
    }

    pub fn from_grants(grants: &HashMap<String, Vec<String>>) -> Self {
        grants
            .iter()
            .fold(Self::new(), |policy, (caller, tenants)| policy.grant(caller.as_str(), tenants.iter().cloned()))
    }
}

impl TenantAuthorizer for StaticTenantPolicy {
    fn is_authorized(&self, caller: &AgentId, tenant: &TenantId) -> bool {
        if tenant.is_empty() {
            return false;
        }
        self.grants
            .get(caller)
            .map(|tenants| tenants.contains(ANY_TENANT) || tenants.contains(tenant.as_str()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_and_wildcard() {
        let policy = StaticTenantPolicy::new()
            .grant("agent-a", ["tenant-1"])
            .grant("ops", [ANY_TENANT]);

        assert!(policy.is_authorized(&"agent-a".into(), &"tenant-1".into()));
        assert!(!policy.is_authorized(&"agent-a".into(), &"tenant-2".into()));
        assert!(policy.is_authorized(&"ops".into(), &"tenant-2".into()));
        assert!(!policy.is_authorized(&"stranger".into(), &"tenant-1".into()));
        assert!(!policy.is_authorized(&"ops".into(), &"".into()));
    }
}
