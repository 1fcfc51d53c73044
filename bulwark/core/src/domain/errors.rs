// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Error Taxonomy
//!
//! | Error | Raised by | Surfaced |
//! |-------|-----------|----------|
//! | [`BackendError`] | a single implementation call | absorbed by breaker / fallback chain |
//! | [`CircuitOpenError`] | breaker admission | synchronously, to the immediate caller |
//! | [`FacadeError`] | `ServiceFacade` | synchronously, to application code |
//! | [`ValidationError`] | `McpRouter` boundary | synchronously, to the sending agent |
//! | [`HandlerError`] | tool handlers | asynchronously, inside the reply payload |
//! | [`DeliveryExhaustedError`] | `ReplyDispatcher` | asynchronously, as a dead letter + alert event |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::capability::{BackendTier, Capability};
use crate::domain::circuit_breaker::CircuitState;
use crate::domain::envelope::EnvelopeId;

/// Failure of one call against one implementation.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum BackendError {
    #[error("dependency unavailable: {0}")]
    Unavailable(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl BackendError {
    /// Whether this error says something about the dependency's health.
    ///
    /// Only infrastructure failures count against a breaker and trigger
    /// failover. Caller mistakes are returned untouched.
    pub fn is_failure_signal(&self) -> bool {
        matches!(self, BackendError::Unavailable(_) | BackendError::Timeout(_))
    }
}

/// A call rejected by a breaker without touching the dependency.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("circuit {state} for {service}; retry after {retry_after:?}")]
pub struct CircuitOpenError {
    pub service: String,
    pub state: CircuitState,
    /// Remaining cooldown. Zero when the rejection came from a saturated half-open window.
    pub retry_after: Duration,
}

/// Outcome of `CircuitBreaker::attempt_call` when the wrapped call did not succeed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    #[error(transparent)]
    Rejected(#[from] CircuitOpenError),

    #[error("{service}: {source}")]
    Failed {
        service: String,
        #[source]
        source: BackendError,
    },
}

/// One failed candidate in an exhausted fallback chain.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFailure {
    pub backend: String,
    pub tier: BackendTier,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FacadeError {
    #[error("transient dependency failure in {service}: {source}")]
    TransientDependency {
        service: String,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("{service} rejected the request: {source}")]
    Backend {
        service: String,
        #[source]
        source: BackendError,
    },

    #[error("capability {0} has no bound implementation")]
    NotBound(Capability),

    #[error("all {capability} implementations failed ({} attempted)", .failures.len())]
    Exhausted {
        capability: Capability,
        failures: Vec<CandidateFailure>,
    },
}

/// Rejection at the router boundary. Always terminal; the envelope never reaches a handler.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("envelope is missing required header `{0}`")]
    MissingHeader(&'static str),

    #[error("signature from {caller} did not verify")]
    InvalidSignature { caller: String },

    #[error("{caller} is not authorized for tenant {tenant}")]
    UnauthorizedTenant { caller: String, tenant: String },

    #[error("arguments reference tenant {referenced} but the envelope is scoped to {scoped}")]
    CrossTenantReference { scoped: String, referenced: String },

    #[error("envelope {0} was already consumed")]
    Replayed(EnvelopeId),

    #[error("envelope {0} is outside the replay window")]
    Expired(EnvelopeId),

    #[error("canonical encoding failed: {0}")]
    Encoding(String),
}

/// Failure of a tool handler, carried back to the caller inside the reply.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum HandlerError {
    #[error("no handler registered for tool `{0}`")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("handler failed: {0}")]
    Failed(String),

    #[error("handler exceeded {after_ms}ms")]
    TimedOut { after_ms: u64 },

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl From<FacadeError> for HandlerError {
    fn from(err: FacadeError) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

/// A single reply delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),

    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

/// Every delivery attempt for an envelope's reply failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("reply for {envelope_id} to {reply_to} undeliverable after {attempts} attempts: {last_error}")]
pub struct DeliveryExhaustedError {
    pub envelope_id: EnvelopeId,
    pub reply_to: String,
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("reply dispatcher is not accepting callbacks")]
    Closed,

    #[error("envelope {0} already has a delivery in progress")]
    InFlight(EnvelopeId),

    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
}

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("no signing key for {0}")]
    UnknownSigner(String),
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("dead-letter store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("dead-letter record could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no dead letter for envelope {0}")]
    NotFound(EnvelopeId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_infrastructure_errors_signal_failure() {
        assert!(BackendError::Unavailable("conn reset".into()).is_failure_signal());
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_failure_signal());
        assert!(!BackendError::InvalidRequest("bad key".into()).is_failure_signal());
        assert!(!BackendError::NotFound("doc-1".into()).is_failure_signal());
    }

    #[test]
    fn handler_error_wire_shape() {
        let json = serde_json::to_value(HandlerError::TimedOut { after_ms: 250 }).unwrap();
        assert_eq!(json["kind"], "timed_out");
        assert_eq!(json["detail"]["after_ms"], 250);

        let parsed: HandlerError =
            serde_json::from_value(serde_json::json!({"kind": "unknown_tool", "detail": "fs.read"})).unwrap();
        assert_eq!(parsed, HandlerError::UnknownTool("fs.read".into()));
    }

    #[test]
    fn exhausted_message_counts_attempts() {
        let err = FacadeError::Exhausted {
            capability: Capability::Storage,
            failures: vec![
                CandidateFailure { backend: "s3".into(), tier: BackendTier::Primary, error: "down".into() },
                CandidateFailure { backend: "fs".into(), tier: BackendTier::Local, error: "disk".into() },
            ],
        };
        assert_eq!(err.to_string(), "all storage implementations failed (2 attempted)");
    }
}
