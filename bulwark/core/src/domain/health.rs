// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Weight of the newest sample in the rolling success rate and latency.
const EWMA_ALPHA: f64 = 0.2;

/// Rolling health of one implementation in a fallback chain.
///
/// Updated on every call completion through that implementation and read by
/// the fallback manager when picking the next candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub available: bool,
    /// Exponentially weighted success rate in `[0, 1]`.
    pub success_rate: f64,
    #[serde(with = "humantime_serde")]
    pub avg_latency: Duration,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            available: true,
            success_rate: 1.0,
            avg_latency: Duration::ZERO,
            consecutive_failures: 0,
            total_calls: 0,
            last_checked_at: None,
        }
    }
}

impl ProviderHealth {
    pub fn record_success(&mut self, latency: Duration) {
        self.observe(1.0, latency);
        self.consecutive_failures = 0;
        self.available = true;
    }

    pub fn record_failure(&mut self, latency: Duration) {
        self.observe(0.0, latency);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn set_available(&mut self, available: bool) {
        self.available = available;
        self.last_checked_at = Some(Utc::now());
    }

    pub fn state(&self) -> HealthState {
        if !self.available {
            HealthState::Unhealthy
        } else if self.consecutive_failures > 0 || self.success_rate < 0.9 {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    fn observe(&mut self, sample: f64, latency: Duration) {
        if self.total_calls == 0 {
            self.success_rate = sample;
            self.avg_latency = latency;
        } else {
            self.success_rate = EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * self.success_rate;
            let avg = EWMA_ALPHA * latency.as_secs_f64() + (1.0 - EWMA_ALPHA) * self.avg_latency.as_secs_f64();
            self.avg_latency = Duration::from_secs_f64(avg);
        }
        self.total_calls += 1;
        self.last_checked_at = Some(Utc::now());
    }
}

/// Coarse health used on status surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => f.write_str("healthy"),
            HealthState::Degraded => f.write_str("degraded"),
            HealthState::Unhealthy => f.write_str("unhealthy"),
        }
    }
}
