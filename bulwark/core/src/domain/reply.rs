// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Reply-side value types: the payload delivered to `reply_to`, the pending
//! delivery entry held by the dispatcher, and the dead-letter record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::domain::envelope::{ConversationId, EnvelopeId, MessageEnvelope, ReplyAddress, TenantId, TraceId};
use crate::domain::errors::HandlerError;

/// Success and failure travel through the same channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplyOutcome {
    Success { result: Value },
    Failure { error: HandlerError },
}

/// The asynchronous result of one handled envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    /// Idempotency key on the receiving side.
    pub envelope_id: EnvelopeId,
    pub trace_id: TraceId,
    pub conversation_id: ConversationId,
    pub tenant_id: TenantId,
    pub tool_name: String,
    pub outcome: ReplyOutcome,
    pub completed_at: DateTime<Utc>,
}

impl ReplyPayload {
    pub fn for_envelope(envelope: &MessageEnvelope, outcome: ReplyOutcome) -> Self {
        Self {
            envelope_id: envelope.id(),
            trace_id: envelope.trace_id().clone(),
            conversation_id: envelope.conversation_id().clone(),
            tenant_id: envelope.tenant_id().clone(),
            tool_name: envelope.tool_name().to_string(),
            outcome,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ReplyOutcome::Success { .. })
    }
}

/// A reply waiting for (re)delivery.
///
/// The payload is shared, never copied, across retries.
#[derive(Debug, Clone)]
pub struct PendingCallback {
    pub envelope_id: EnvelopeId,
    pub reply_to: ReplyAddress,
    pub payload: Arc<ReplyPayload>,
    pub attempt_count: u32,
    pub next_attempt_at: Instant,
}

impl PendingCallback {
    pub fn new(reply_to: ReplyAddress, payload: Arc<ReplyPayload>) -> Self {
        Self {
            envelope_id: payload.envelope_id,
            reply_to,
            payload,
            attempt_count: 0,
            next_attempt_at: Instant::now(),
        }
    }
}

/// A reply that exhausted its delivery budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub envelope_id: EnvelopeId,
    pub reply_to: ReplyAddress,
    pub payload: ReplyPayload,
    pub attempts: u32,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}
