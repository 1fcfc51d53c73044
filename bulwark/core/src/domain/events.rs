// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::call::CallState;
use crate::domain::circuit_breaker::CircuitState;
use crate::domain::envelope::{AgentId, ConversationId, EnvelopeId, ReplyAddress, TenantId, TraceId};
use crate::domain::errors::DeliveryExhaustedError;

/// Why a breaker changed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransitionReason {
    FailureThreshold { failures: u32 },
    RecoveryTimeoutElapsed,
    ProbeSucceeded { successes: u32 },
    ProbeFailed,
    ManualReset,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionReason::FailureThreshold { failures } => {
                write!(f, "{failures} consecutive failures reached the threshold")
            }
            TransitionReason::RecoveryTimeoutElapsed => f.write_str("recovery timeout elapsed"),
            TransitionReason::ProbeSucceeded { successes } => write!(f, "{successes} probe(s) succeeded"),
            TransitionReason::ProbeFailed => f.write_str("half-open probe failed"),
            TransitionReason::ManualReset => f.write_str("manual reset"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerTransition {
    pub service: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: TransitionReason,
    pub at: DateTime<Utc>,
}

/// Router lifecycle step for one envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEvent {
    pub envelope_id: EnvelopeId,
    pub trace_id: TraceId,
    pub conversation_id: ConversationId,
    pub tenant_id: TenantId,
    pub caller: AgentId,
    pub state: CallState,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryEvent {
    Delivered {
        envelope_id: EnvelopeId,
        trace_id: TraceId,
        reply_to: ReplyAddress,
        attempts: u32,
        delivered_at: DateTime<Utc>,
    },
    RetryScheduled {
        envelope_id: EnvelopeId,
        trace_id: TraceId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    Parked {
        envelope_id: EnvelopeId,
        trace_id: TraceId,
        agent_id: AgentId,
    },
    /// Alert-worthy: a reply could not be delivered.
    DeadLettered {
        trace_id: TraceId,
        error: DeliveryExhaustedError,
        dead_lettered_at: DateTime<Utc>,
    },
    Redelivered {
        envelope_id: EnvelopeId,
        trace_id: TraceId,
    },
    /// Alert-worthy: the dead-letter store rejected a reply. The dispatcher
    /// keeps the reply and retries the write.
    DeadLetterStoreFailed {
        envelope_id: EnvelopeId,
        trace_id: TraceId,
        attempt: u32,
        error: String,
    },
}

/// Everything published on the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BulwarkEvent {
    Breaker(BreakerTransition),
    Call(CallEvent),
    Delivery(DeliveryEvent),
}

impl BulwarkEvent {
    pub fn trace_id(&self) -> Option<&TraceId> {
        match self {
            BulwarkEvent::Breaker(_) => None,
            BulwarkEvent::Call(event) => Some(&event.trace_id),
            BulwarkEvent::Delivery(event) => Some(match event {
                DeliveryEvent::Delivered { trace_id, .. }
                | DeliveryEvent::RetryScheduled { trace_id, .. }
                | DeliveryEvent::Parked { trace_id, .. }
                | DeliveryEvent::DeadLettered { trace_id, .. }
                | DeliveryEvent::Redelivered { trace_id, .. }
                | DeliveryEvent::DeadLetterStoreFailed { trace_id, .. } => trace_id,
            }),
        }
    }
}
