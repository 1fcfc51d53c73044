// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Collaborator interfaces consumed by the reply dispatcher.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::envelope::{AgentId, EnvelopeId, ReplyAddress};
use crate::domain::errors::{DeadLetterError, DeliveryError};
use crate::domain::reply::{DeadLetter, ReplyPayload};

/// Pushes a reply to a `reply_to` address.
///
/// Implementations must send `payload.envelope_id` as the idempotency key so
/// the receiving side can discard duplicates.
#[async_trait]
pub trait ReplyTransport: Send + Sync {
    async fn deliver(&self, reply_to: &ReplyAddress, payload: &ReplyPayload) -> Result<(), DeliveryError>;
}

/// Agent presence / discovery.
#[async_trait]
pub trait AgentPresence: Send + Sync {
    async fn is_online(&self, agent: &AgentId) -> bool;

    /// Stream of agents observed coming online.
    fn subscribe(&self) -> broadcast::Receiver<AgentId>;
}

/// Durable home of undeliverable replies. Insertion is keyed by envelope id
/// and never duplicates.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Returns `false` when an entry for the envelope already exists.
    async fn insert(&self, letter: DeadLetter) -> Result<bool, DeadLetterError>;

    async fn get(&self, envelope_id: &EnvelopeId) -> Result<Option<DeadLetter>, DeadLetterError>;

    async fn list(&self) -> Result<Vec<DeadLetter>, DeadLetterError>;

    async fn remove(&self, envelope_id: &EnvelopeId) -> Result<DeadLetter, DeadLetterError>;
}

/// Bounded exponential retry budget for one reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total delivery attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    #[serde(default = "default_factor")]
    pub factor: f64,

    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Extra random delay as a fraction of the computed delay, in `[0, 1]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_factor() -> f64 {
    2.0
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            factor: default_factor(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `attempt + 1`, given `attempt` attempts have failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self.factor.max(1.0).powi(attempt.saturating_sub(1).min(63) as i32);
        let capped = (self.base_delay.as_nanos() as f64 * exp).min(self.max_delay.as_nanos() as f64);
        let jitter = if self.jitter > 0.0 && capped > 0.0 {
            rand::thread_rng().gen_range(0.0..self.jitter.min(1.0)) * capped
        } else {
            0.0
        };
        Duration::from_nanos((capped + jitter).round() as u64)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts < 1 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            anyhow::bail!("retry.jitter must be within [0, 1], got {}", self.jitter);
        }
        if self.factor < 1.0 {
            anyhow::bail!("retry.factor must be at least 1.0, got {}", self.factor);
        }
        Ok(())
    }
}
