// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Facade Registry
//!
//! Built once at startup and handed to whatever needs the facade, its
//! breakers or its health targets. There is no process-wide breaker table;
//! this object is the only index.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::application::health_monitor::{HealthMonitor, HealthTarget};
use crate::application::service_facade::{CapabilityStatus, ServiceFacade};
use crate::domain::circuit_breaker::{BreakerSnapshot, CircuitBreaker};
use crate::domain::node_config::HealthMonitorConfig;

pub struct FacadeRegistry {
    facade: Arc<ServiceFacade>,
    breakers: BTreeMap<String, Arc<CircuitBreaker>>,
}

impl FacadeRegistry {
    pub fn new(facade: ServiceFacade) -> Self {
        let breakers = facade
            .chains()
            .iter()
            .flat_map(|chain| chain.breakers())
            .map(|breaker| (breaker.service_name().to_string(), breaker))
            .collect();
        Self {
            facade: Arc::new(facade),
            breakers,
        }
    }

    pub fn facade(&self) -> &Arc<ServiceFacade> {
        &self.facade
    }

    /// Breaker by service name (`"<capability>:<backend>"`).
    pub fn breaker(&self, service: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(service)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.breakers.keys().map(String::as_str)
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.values().map(|b| b.snapshot()).collect()
    }

    pub fn status(&self) -> Vec<CapabilityStatus> {
        self.facade.status()
    }

    /// Force one breaker closed. Returns `false` for an unknown service.
    pub fn reset(&self, service: &str) -> bool {
        match self.breakers.get(service) {
            Some(breaker) => {
                info!(service = %service, "manual breaker reset");
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.values() {
            breaker.reset();
        }
    }

    pub fn health_targets(&self) -> Vec<HealthTarget> {
        self.facade.chains().iter().flat_map(|chain| chain.health_targets()).collect()
    }

    pub fn health_monitor(&self, config: HealthMonitorConfig) -> HealthMonitor {
        HealthMonitor::new(self.health_targets(), config)
    }
}
