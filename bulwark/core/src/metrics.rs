// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Metric helpers.
//!
//! Thin wrappers over the `metrics` facade so names and labels stay
//! consistent. No exporter is installed here; the embedding process picks one.

use crate::domain::capability::{BackendTier, Capability};
use crate::domain::circuit_breaker::CircuitState;
use crate::domain::call::CallState;

pub fn record_breaker_transition(service: &str, to: CircuitState) {
    metrics::counter!(
        "bulwark_breaker_transitions_total",
        "service" => service.to_string(),
        "to" => to.to_string()
    )
    .increment(1);

    let value = match to {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    metrics::gauge!("bulwark_breaker_state", "service" => service.to_string()).set(value);
}

pub fn record_facade_call(capability: Capability, tier: BackendTier, outcome: &'static str, latency_secs: f64) {
    metrics::counter!(
        "bulwark_facade_calls_total",
        "capability" => capability.as_str(),
        "tier" => tier.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("bulwark_facade_call_seconds", "capability" => capability.as_str()).record(latency_secs);
}

pub fn record_router_outcome(state: CallState) {
    metrics::counter!("bulwark_router_calls_total", "state" => state.to_string()).increment(1);
}

pub fn record_delivery_attempt(outcome: &'static str) {
    metrics::counter!("bulwark_delivery_attempts_total", "outcome" => outcome).increment(1);
}

pub fn record_dead_letter() {
    metrics::counter!("bulwark_dead_letters_total").increment(1);
}

pub fn record_dead_letter_store_failure() {
    metrics::counter!("bulwark_dead_letter_store_failures_total").increment(1);
}

pub fn record_parked_callbacks(count: usize) {
    metrics::gauge!("bulwark_parked_callbacks").set(count as f64);
}
