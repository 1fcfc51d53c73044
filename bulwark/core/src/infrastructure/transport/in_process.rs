// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-Process Reply Transport
//!
//! Delivers replies addressed to `local://<agent>` straight into that agent's
//! `ReplyInbox`. Agents co-located in one process (and tests) use it instead
//! of HTTP.
//!
//! `ReplyInbox` is the receiving half of the protocol:
//! - deduplicates by idempotency key (the envelope id), so a redelivered reply
//!   is acknowledged but never applied twice
//! - correlates replies to waiting callers by `trace_id`, giving call sites
//!   request/response semantics over the asynchronous reply path
//! - keeps uncorrelated replies in arrival order for `next()`

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tracing::debug;

use crate::domain::delivery::ReplyTransport;
use crate::domain::envelope::{AgentId, EnvelopeId, ReplyAddress, TraceId};
use crate::domain::errors::DeliveryError;
use crate::domain::reply::ReplyPayload;

pub const LOCAL_SCHEME: &str = "local";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InboxError {
    #[error("no reply for trace {trace_id} within {after:?}")]
    TimedOut { trace_id: TraceId, after: Duration },

    #[error("inbox dropped before a reply for trace {0} arrived")]
    Closed(TraceId),
}

#[derive(Default)]
struct InboxState {
    seen: HashSet<EnvelopeId>,
    waiters: HashMap<TraceId, oneshot::Sender<ReplyPayload>>,
    unclaimed: VecDeque<ReplyPayload>,
}

/// Receiving side of one agent.
pub struct ReplyInbox {
    agent_id: AgentId,
    state: Mutex<InboxState>,
    arrived: Notify,
    applied: AtomicU64,
    duplicates: AtomicU64,
}

impl ReplyInbox {
    pub fn new(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            state: Mutex::new(InboxState::default()),
            arrived: Notify::new(),
            applied: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// The reply address that routes to this inbox.
    pub fn address(&self) -> ReplyAddress {
        ReplyAddress::new(format!("{}://{}", LOCAL_SCHEME, self.agent_id))
    }

    /// Accept a delivered reply. Returns `false` for a duplicate, which is
    /// acknowledged but not applied.
    pub fn accept(&self, payload: ReplyPayload) -> bool {
        let mut state = self.state.lock();
        if !state.seen.insert(payload.envelope_id) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(agent = %self.agent_id, envelope_id = %payload.envelope_id, "duplicate reply ignored");
            return false;
        }
        self.applied.fetch_add(1, Ordering::Relaxed);

        let payload = match state.waiters.remove(&payload.trace_id) {
            Some(waiter) => match waiter.send(payload) {
                Ok(()) => return true,
                // caller gave up; keep the reply
                Err(payload) => payload,
            },
            None => payload,
        };
        state.unclaimed.push_back(payload);
        drop(state);
        self.arrived.notify_one();
        true
    }

    /// Register interest in the reply for `trace_id`.
    pub fn expect(&self, trace_id: TraceId) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if let Some(pos) = state.unclaimed.iter().position(|p| p.trace_id == trace_id) {
            if let Some(payload) = state.unclaimed.remove(pos) {
                let _ = tx.send(payload);
            }
        } else {
            state.waiters.insert(trace_id.clone(), tx);
        }
        PendingReply { trace_id, rx }
    }

    /// Next uncorrelated reply, in arrival order.
    pub async fn next(&self) -> ReplyPayload {
        loop {
            if let Some(payload) = self.state.lock().unclaimed.pop_front() {
                return payload;
            }
            self.arrived.notified().await;
        }
    }

    pub fn try_next(&self) -> Option<ReplyPayload> {
        self.state.lock().unclaimed.pop_front()
    }

    /// Replies applied (duplicates excluded).
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }
}

/// A caller awaiting one correlated reply.
pub struct PendingReply {
    trace_id: TraceId,
    rx: oneshot::Receiver<ReplyPayload>,
}

impl PendingReply {
    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    pub async fn wait(self, timeout: Duration) -> Result<ReplyPayload, InboxError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(InboxError::Closed(self.trace_id)),
            Err(_) => Err(InboxError::TimedOut {
                trace_id: self.trace_id,
                after: timeout,
            }),
        }
    }
}

/// Routes `local://<agent>` replies to registered inboxes.
#[derive(Default)]
pub struct InProcessTransport {
    mailboxes: DashMap<AgentId, Arc<ReplyInbox>>,
    unreachable: DashMap<AgentId, ()>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or return the existing) inbox for `agent`.
    pub fn register(&self, agent: impl Into<AgentId>) -> Arc<ReplyInbox> {
        let agent = agent.into();
        self.mailboxes
            .entry(agent.clone())
            .or_insert_with(|| Arc::new(ReplyInbox::new(agent)))
            .clone()
    }

    pub fn unregister(&self, agent: &AgentId) {
        self.mailboxes.remove(agent);
    }

    /// Make deliveries to `agent` fail transiently, as if its link were down.
    pub fn set_reachable(&self, agent: &AgentId, reachable: bool) {
        if reachable {
            self.unreachable.remove(agent);
        } else {
            self.unreachable.insert(agent.clone(), ());
        }
    }
}

#[async_trait]
impl ReplyTransport for InProcessTransport {
    async fn deliver(&self, reply_to: &ReplyAddress, payload: &ReplyPayload) -> Result<(), DeliveryError> {
        if reply_to.scheme() != Some(LOCAL_SCHEME) {
            return Err(DeliveryError::Permanent(format!(
                "unsupported reply address for in-process transport: {}",
                reply_to
            )));
        }
        let agent = reply_to.agent_id();
        if self.unreachable.contains_key(&agent) {
            return Err(DeliveryError::Transient(format!("agent {} is unreachable", agent)));
        }
        let inbox = self
            .mailboxes
            .get(&agent)
            .map(|m| Arc::clone(m.value()))
            .ok_or_else(|| DeliveryError::Transient(format!("no mailbox registered for {}", agent)))?;
        inbox.accept(payload.clone());
        Ok(())
    }
}
