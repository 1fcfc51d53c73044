// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::envelope::{ConversationId, EnvelopeId, TraceId};

/// Lifecycle of one inbound envelope inside the router.
///
/// `Received → Validated → Acknowledged → Dispatched → Completed | Failed`.
/// Validation failures jump straight from `Received` to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    Received,
    Validated,
    Acknowledged,
    Dispatched,
    Completed,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Completed | CallState::Failed)
    }

    /// Whether `self → next` is a legal move.
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Received, Validated)
                | (Received, Failed)
                | (Validated, Acknowledged)
                | (Acknowledged, Dispatched)
                | (Dispatched, Completed)
                | (Dispatched, Failed)
        )
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallState::Received => "RECEIVED",
            CallState::Validated => "VALIDATED",
            CallState::Acknowledged => "ACKNOWLEDGED",
            CallState::Dispatched => "DISPATCHED",
            CallState::Completed => "COMPLETED",
            CallState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Synchronous answer to an accepted envelope, returned before the handler runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub envelope_id: EnvelopeId,
    pub trace_id: TraceId,
    pub conversation_id: ConversationId,
    pub accepted_at: DateTime<Utc>,
}
