// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Message Envelope
//!
//! The signed, addressed unit of a cross-agent tool call.
//!
//! An envelope is built at the call site, signed once, and is immutable from
//! then on: there are no setters, and every field is reachable only through
//! getters. The signature covers the canonical encoding of every field except
//! `auth_sig` itself, including the envelope `id` (the idempotency key used
//! for replay protection and reply deduplication) and `issued_at`.
//!
//! ## Canonical encoding
//!
//! Compact JSON, object keys sorted lexicographically at every depth, no
//! insignificant whitespace. Sender and receiver compute it independently from
//! the same field values, so the encoding must not depend on map iteration
//! order.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::errors::{SigningError, ValidationError};

/// Unique envelope identity. Doubles as the reply idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(pub Uuid);

impl EnvelopeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Tenant scope. Partitions every downstream data access.
    TenantId
);

string_id!(
    /// Correlates one logical request across every hop. Generated once at the origin.
    TraceId
);

string_id!(
    /// Groups related calls of one workflow for fan-in.
    ConversationId
);

string_id!(
    /// Identity of an agent (caller, signer, or reply target).
    AgentId
);

string_id!(
    /// URI-like delivery address for an asynchronous reply, e.g.
    /// `https://agent-b.internal/replies` or `local://agent-b`.
    ReplyAddress
);

impl TraceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl ConversationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl ReplyAddress {
    pub fn scheme(&self) -> Option<&str> {
        self.0.split_once("://").map(|(scheme, _)| scheme)
    }

    /// The agent this address belongs to: the authority part of the URI
    /// (without port), or the whole address when it has no scheme.
    pub fn agent_id(&self) -> AgentId {
        let rest = match self.0.split_once("://") {
            Some((_, rest)) => rest,
            None => self.0.as_str(),
        };
        let authority = rest.split('/').next().unwrap_or(rest);
        let host = authority.rsplit('@').next().unwrap_or(authority);
        let host = host.split(':').next().unwrap_or(host);
        AgentId::new(host)
    }
}

/// Routing and correlation metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeaders {
    pub tenant_id: TenantId,
    pub trace_id: TraceId,
    pub conversation_id: ConversationId,
    pub reply_to: ReplyAddress,
    pub caller: AgentId,
}

/// Produces signatures over canonical envelope bytes.
pub trait EnvelopeSigner: Send + Sync {
    /// The agent identity recorded as `caller` on envelopes this signer signs.
    fn signer_id(&self) -> &AgentId;

    fn sign(&self, bytes: &[u8]) -> Result<String, SigningError>;
}

/// Checks a signature against the caller it claims to come from.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, bytes: &[u8], signature: &str, caller: &AgentId) -> bool;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    id: EnvelopeId,
    issued_at: DateTime<Utc>,
    #[serde(flatten)]
    headers: EnvelopeHeaders,
    tool_name: String,
    #[serde(default)]
    arguments: Value,
    auth_sig: String,
}

impl MessageEnvelope {
    pub fn builder(tenant_id: impl Into<TenantId>) -> EnvelopeBuilder {
        EnvelopeBuilder::new(tenant_id.into())
    }

    pub fn id(&self) -> EnvelopeId {
        self.id
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn headers(&self) -> &EnvelopeHeaders {
        &self.headers
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.headers.tenant_id
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.headers.trace_id
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.headers.conversation_id
    }

    pub fn reply_to(&self) -> &ReplyAddress {
        &self.headers.reply_to
    }

    pub fn caller(&self) -> &AgentId {
        &self.headers.caller
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn arguments(&self) -> &Value {
        &self.arguments
    }

    pub fn auth_sig(&self) -> &str {
        &self.auth_sig
    }

    /// A tenant named inside the arguments, if any. Must equal the header tenant.
    pub fn referenced_tenant(&self) -> Option<&str> {
        self.arguments.get("tenant_id").and_then(Value::as_str)
    }

    /// First required header that is empty, if any.
    pub fn missing_header(&self) -> Option<&'static str> {
        if self.headers.tenant_id.is_empty() {
            Some("tenant_id")
        } else if self.headers.trace_id.is_empty() {
            Some("trace_id")
        } else if self.headers.conversation_id.is_empty() {
            Some("conversation_id")
        } else if self.headers.reply_to.is_empty() {
            Some("reply_to")
        } else if self.headers.caller.is_empty() {
            Some("caller")
        } else if self.tool_name.trim().is_empty() {
            Some("tool_name")
        } else if self.auth_sig.is_empty() {
            Some("auth_sig")
        } else {
            None
        }
    }

    /// Bytes covered by `auth_sig`.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, ValidationError> {
        let mut value = serde_json::to_value(self).map_err(|e| ValidationError::Encoding(e.to_string()))?;
        if let Value::Object(map) = &mut value {
            map.remove("auth_sig");
        }
        canonical_json(&value)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Serialize `value` as compact JSON with sorted object keys.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>, ValidationError> {
    let mut out = Vec::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<(), ValidationError> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key).map_err(|e| ValidationError::Encoding(e.to_string()))?;
                out.push(b':');
                write_canonical(&map[key], out)?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        scalar => {
            serde_json::to_writer(&mut *out, scalar).map_err(|e| ValidationError::Encoding(e.to_string()))?;
        }
    }
    Ok(())
}

/// Assembles and signs a [`MessageEnvelope`].
///
/// Trace and conversation ids are generated when not supplied; `caller` is
/// always the signer's identity.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    tenant_id: TenantId,
    trace_id: Option<TraceId>,
    conversation_id: Option<ConversationId>,
    reply_to: Option<ReplyAddress>,
    tool_name: String,
    arguments: Value,
}

impl EnvelopeBuilder {
    fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            trace_id: None,
            conversation_id: None,
            reply_to: None,
            tool_name: String::new(),
            arguments: Value::Object(Default::default()),
        }
    }

    pub fn trace_id(mut self, trace_id: impl Into<TraceId>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn conversation_id(mut self, conversation_id: impl Into<ConversationId>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn reply_to(mut self, reply_to: impl Into<ReplyAddress>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn tool(mut self, tool_name: impl Into<String>, arguments: Value) -> Self {
        self.tool_name = tool_name.into();
        self.arguments = arguments;
        self
    }

    pub fn sign(self, signer: &dyn EnvelopeSigner) -> Result<MessageEnvelope, SigningError> {
        let mut envelope = MessageEnvelope {
            id: EnvelopeId::new(),
            issued_at: Utc::now(),
            headers: EnvelopeHeaders {
                tenant_id: self.tenant_id,
                trace_id: self.trace_id.unwrap_or_else(TraceId::generate),
                conversation_id: self.conversation_id.unwrap_or_else(ConversationId::generate),
                reply_to: self.reply_to.unwrap_or_else(|| ReplyAddress::new("")),
                caller: signer.signer_id().clone(),
            },
            tool_name: self.tool_name,
            arguments: self.arguments,
            auth_sig: String::new(),
        };
        let bytes = envelope
            .canonical_bytes()
            .map_err(|e| SigningError::InvalidKey(format!("envelope could not be encoded: {e}")))?;
        envelope.auth_sig = signer.sign(&bytes)?;
        Ok(envelope)
    }
}
