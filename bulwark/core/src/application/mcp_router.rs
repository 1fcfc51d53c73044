// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! MCP Router - Inbound envelope boundary and tool dispatch
//!
//! Every cross-agent tool call enters through [`McpRouter::receive`]. The
//! router validates the envelope, acknowledges it synchronously, and runs the
//! registered handler off the request path. The handler's result, success or
//! failure, always leaves through the [`ReplyDispatcher`].
//!
//! # Lifecycle
//!
//! ```text
//! RECEIVED → VALIDATED → ACKNOWLEDGED → DISPATCHED → COMPLETED
//!     │                                      └──────→ FAILED
//!     └──────────────────────────────────────────────→ FAILED
//! ```
//!
//! # Validation order
//!
//! 1. required headers present
//! 2. `issued_at` inside the replay window
//! 3. `auth_sig` verifies over the canonical bytes for `caller`
//! 4. `caller` is authorised for `tenant_id`
//! 5. arguments do not name a different tenant
//! 6. the envelope id has not been consumed
//!
//! This is the only tenant-isolation check in the system. A rejected envelope
//! never reaches a handler.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Synchronous half of the acknowledge-then-callback protocol

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::application::reply_dispatcher::ReplyDispatcher;
use crate::domain::call::{Acknowledgement, CallState};
use crate::domain::envelope::{
    AgentId, ConversationId, EnvelopeHeaders, EnvelopeId, MessageEnvelope, SignatureVerifier, TenantId, TraceId,
};
use crate::domain::errors::{HandlerError, ValidationError};
use crate::domain::events::CallEvent;
use crate::domain::node_config::RouterConfig;
use crate::domain::reply::{ReplyOutcome, ReplyPayload};
use crate::domain::tenancy::TenantAuthorizer;
use crate::infrastructure::event_bus::EventBus;

/// What a handler sees of the envelope that invoked it.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub envelope_id: EnvelopeId,
    pub headers: EnvelopeHeaders,
    pub arguments: Value,
}

impl ToolContext {
    fn from_envelope(envelope: &MessageEnvelope) -> Self {
        Self {
            envelope_id: envelope.id(),
            headers: envelope.headers().clone(),
            arguments: envelope.arguments().clone(),
        }
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

    pub fn caller(&self) -> &AgentId {
        &self.headers.caller
    }

    /// Required string argument.
    pub fn str_arg(&self, name: &str) -> Result<&str, HandlerError> {
        self.arguments
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::InvalidArguments(format!("missing string argument `{}`", name)))
    }
}

/// Business logic behind one `tool_name`.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, ctx: ToolContext) -> Result<Value, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, ctx: ToolContext) -> Result<Value, HandlerError> {
        (self.0)(ctx).await
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ToolHandler>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `tool_name`, replacing any previous one.
    pub fn register(&self, tool_name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        let tool_name = tool_name.into();
        if self.handlers.write().insert(tool_name.clone(), handler).is_some() {
            warn!(tool = %tool_name, "replaced existing tool handler");
        } else {
            debug!(tool = %tool_name, "registered tool handler");
        }
    }

    pub fn register_fn<F, Fut>(&self, tool_name: impl Into<String>, handler: F)
    where
        F: Fn(ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(tool_name, Arc::new(FnHandler(handler)));
    }

    pub fn unregister(&self, tool_name: &str) -> bool {
        self.handlers.write().remove(tool_name).is_some()
    }

    pub fn get(&self, tool_name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.read().get(tool_name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Cheap to clone; clones share registry, state table and replay cache.
#[derive(Clone)]
pub struct McpRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    tools: Arc<ToolRegistry>,
    verifier: Arc<dyn SignatureVerifier>,
    authorizer: Arc<dyn TenantAuthorizer>,
    dispatcher: Arc<ReplyDispatcher>,
    event_bus: EventBus,
    config: RouterConfig,
    /// Consumed envelope ids and their `issued_at`, kept for one replay window.
    consumed: DashMap<EnvelopeId, DateTime<Utc>>,
    states: DashMap<EnvelopeId, CallState>,
}

impl McpRouter {
    pub fn new(
        tools: Arc<ToolRegistry>,
        verifier: Arc<dyn SignatureVerifier>,
        authorizer: Arc<dyn TenantAuthorizer>,
        dispatcher: Arc<ReplyDispatcher>,
        event_bus: EventBus,
        config: RouterConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                tools,
                verifier,
                authorizer,
                dispatcher,
                event_bus,
                config,
                consumed: DashMap::new(),
                states: DashMap::new(),
            }),
        }
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.inner.tools
    }

    pub fn call_state(&self, envelope_id: &EnvelopeId) -> Option<CallState> {
        self.inner.states.get(envelope_id).map(|state| *state)
    }

    /// Validate and acknowledge `envelope`, then run its handler in the background.
    ///
    /// Returns before the handler starts. The handler's outcome is delivered to
    /// the envelope's `reply_to`.
    pub async fn receive(&self, envelope: MessageEnvelope) -> Result<Acknowledgement, ValidationError> {
        let inner = &self.inner;

        // Rejected envelopes never touch the state table.
        if let Err(err) = inner.validate(&envelope) {
            warn!(
                caller = %envelope.caller(),
                tenant_id = %envelope.tenant_id(),
                envelope_id = %envelope.id(),
                trace_id = %envelope.trace_id(),
                error = %err,
                "envelope rejected"
            );
            crate::metrics::record_router_outcome(CallState::Failed);
            return Err(err);
        }
        inner.begin(&envelope);
        inner.transition(&envelope, CallState::Validated, None);

        let ack = Acknowledgement {
            envelope_id: envelope.id(),
            trace_id: envelope.trace_id().clone(),
            conversation_id: envelope.conversation_id().clone(),
            accepted_at: Utc::now(),
        };
        inner.transition(&envelope, CallState::Acknowledged, None);
        debug!(
            envelope_id = %ack.envelope_id,
            trace_id = %ack.trace_id,
            tool = %envelope.tool_name(),
            "envelope acknowledged"
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.dispatch(envelope).await;
        });

        Ok(ack)
    }

    /// Forget consumed ids older than the replay window, along with the
    /// states of settled calls whose id has expired.
    pub fn prune_consumed(&self) -> usize {
        self.inner.prune_consumed()
    }

    /// Number of calls with a recorded state.
    pub fn tracked_calls(&self) -> usize {
        self.inner.states.len()
    }
}

impl RouterInner {
    fn validate(&self, envelope: &MessageEnvelope) -> Result<(), ValidationError> {
        if let Some(header) = envelope.missing_header() {
            return Err(ValidationError::MissingHeader(header));
        }

        if self.outside_window(envelope.issued_at()) {
            return Err(ValidationError::Expired(envelope.id()));
        }

        let bytes = envelope.canonical_bytes()?;
        if !self.verifier.verify(&bytes, envelope.auth_sig(), envelope.caller()) {
            return Err(ValidationError::InvalidSignature {
                caller: envelope.caller().to_string(),
            });
        }

        if !self.authorizer.is_authorized(envelope.caller(), envelope.tenant_id()) {
            return Err(ValidationError::UnauthorizedTenant {
                caller: envelope.caller().to_string(),
                tenant: envelope.tenant_id().to_string(),
            });
        }

        if let Some(referenced) = envelope.referenced_tenant() {
            if referenced != envelope.tenant_id().as_str() {
                return Err(ValidationError::CrossTenantReference {
                    scoped: envelope.tenant_id().to_string(),
                    referenced: referenced.to_string(),
                });
            }
        }

        self.prune_consumed();
        match self.consumed.entry(envelope.id()) {
            Entry::Occupied(_) => Err(ValidationError::Replayed(envelope.id())),
            Entry::Vacant(slot) => {
                slot.insert(envelope.issued_at());
                Ok(())
            }
        }
    }

    fn outside_window(&self, issued_at: DateTime<Utc>) -> bool {
        let now = Utc::now();
        let skew = if issued_at <= now {
            (now - issued_at).to_std()
        } else {
            (issued_at - now).to_std()
        };
        skew.map(|skew| skew > self.config.replay_window).unwrap_or(true)
    }

    fn prune_consumed(&self) -> usize {
        let before = self.consumed.len();
        self.consumed.retain(|_, issued_at| !self.outside_window(*issued_at));
        self.states
            .retain(|id, state| !state.is_terminal() || self.consumed.contains_key(id));
        before.saturating_sub(self.consumed.len())
    }

    /// Start tracking a call. Only called once `validate` has consumed the id,
    /// so the slot belongs to this envelope.
    fn begin(&self, envelope: &MessageEnvelope) {
        self.states.insert(envelope.id(), CallState::Received);
        self.publish(envelope, CallState::Received, None);
    }

    /// Record a lifecycle step. Only legal moves from a tracked state apply.
    fn transition(&self, envelope: &MessageEnvelope, state: CallState, detail: Option<String>) {
        let applied = match self.states.get_mut(&envelope.id()) {
            Some(mut current) if current.can_transition_to(state) => {
                *current = state;
                true
            }
            _ => false,
        };
        if !applied {
            debug!(envelope_id = %envelope.id(), state = %state, "state change ignored for envelope");
            return;
        }
        self.publish(envelope, state, detail);
    }

    fn publish(&self, envelope: &MessageEnvelope, state: CallState, detail: Option<String>) {
        self.event_bus.publish_call_event(CallEvent {
            envelope_id: envelope.id(),
            trace_id: envelope.trace_id().clone(),
            conversation_id: envelope.conversation_id().clone(),
            tenant_id: envelope.tenant_id().clone(),
            caller: envelope.caller().clone(),
            state,
            detail,
            at: Utc::now(),
        });
    }

    async fn dispatch(&self, envelope: MessageEnvelope) {
        self.transition(&envelope, CallState::Dispatched, None);

        let outcome = self.run_handler(&envelope).await;
        let (state, detail) = match &outcome {
            ReplyOutcome::Success { .. } => (CallState::Completed, None),
            ReplyOutcome::Failure { error } => {
                info!(
                    envelope_id = %envelope.id(),
                    trace_id = %envelope.trace_id(),
                    tool = %envelope.tool_name(),
                    error = %error,
                    "tool handler failed"
                );
                (CallState::Failed, Some(error.to_string()))
            }
        };

        let payload = ReplyPayload::for_envelope(&envelope, outcome);
        if let Err(err) = self.dispatcher.deliver(envelope.reply_to().clone(), payload).await {
            error!(
                envelope_id = %envelope.id(),
                trace_id = %envelope.trace_id(),
                reply_to = %envelope.reply_to(),
                error = %err,
                "could not queue reply"
            );
        }

        self.transition(&envelope, state, detail);
        crate::metrics::record_router_outcome(state);
    }

    async fn run_handler(&self, envelope: &MessageEnvelope) -> ReplyOutcome {
        let Some(handler) = self.tools.get(envelope.tool_name()) else {
            return ReplyOutcome::Failure {
                error: HandlerError::UnknownTool(envelope.tool_name().to_string()),
            };
        };

        let ctx = ToolContext::from_envelope(envelope);
        let task = tokio::spawn(async move { handler.handle(ctx).await });
        let abort = task.abort_handle();
        let timeout = self.config.handler_timeout;

        let result = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => Err(HandlerError::Panicked(panic_message(join_err.into_panic()))),
            Ok(Err(join_err)) => Err(HandlerError::Failed(join_err.to_string())),
            Err(_) => {
                abort.abort();
                Err(HandlerError::TimedOut {
                    after_ms: crate::application::duration_ms(timeout),
                })
            }
        };

        match result {
            Ok(result) => ReplyOutcome::Success { result },
            Err(error) => ReplyOutcome::Failure { error },
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::delivery::AgentPresence;
    use crate::domain::node_config::DispatcherConfig;
    use crate::domain::tenancy::StaticTenantPolicy;
    use crate::infrastructure::dead_letter::InMemoryDeadLetterStore;
    use crate::infrastructure::presence::PresenceRegistry;
    use crate::infrastructure::signature::{HmacKeyRing, HmacSigner};
    use crate::infrastructure::transport::{InProcessTransport, ReplyInbox};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixture {
        router: McpRouter,
        inbox: Arc<ReplyInbox>,
        signer: HmacSigner,
        calls: Arc<AtomicUsize>,
    }

    fn fixture(handler_timeout: Duration) -> Fixture {
        fixture_with(RouterConfig {
            handler_timeout,
            ..Default::default()
        })
    }

    fn fixture_with(config: RouterConfig) -> Fixture {
        let transport = Arc::new(InProcessTransport::new());
        let inbox = transport.register("agent-a");
        let presence: Arc<dyn AgentPresence> = Arc::new(PresenceRegistry::new());
        let bus = EventBus::with_default_capacity();
        let dispatcher = Arc::new(ReplyDispatcher::new(
            transport,
            presence,
            Arc::new(InMemoryDeadLetterStore::new()),
            bus.clone(),
            DispatcherConfig::default(),
        ));
        dispatcher.clone().start();

        let keys = HmacKeyRing::new();
        keys.register("agent-a", b"secret-a".to_vec());
        let policy = StaticTenantPolicy::new().grant("agent-a", ["tenant-a"]);

        let calls = Arc::new(AtomicUsize::new(0));
        let tools = Arc::new(ToolRegistry::new());
        let counter = calls.clone();
        tools.register_fn("echo", move |ctx: ToolContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"echo": ctx.arguments, "tenant": ctx.tenant_id().as_str()}))
            }
        });
        tools.register_fn("sleep", |_ctx: ToolContext| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        });
        tools.register_fn("boom", |_ctx: ToolContext| async {
            if true {
                panic!("handler blew up");
            }
            Ok(Value::Null)
        });

        let router = McpRouter::new(
            tools,
            Arc::new(keys),
            Arc::new(policy),
            dispatcher,
            bus,
            config,
        );
        Fixture {
            router,
            inbox,
            signer: HmacSigner::new("agent-a", b"secret-a".to_vec()),
            calls,
        }
    }

    fn envelope(f: &Fixture, tenant: &str, tool: &str, args: Value) -> MessageEnvelope {
        MessageEnvelope::builder(tenant)
            .reply_to(f.inbox.address())
            .tool(tool, args)
            .sign(&f.signer)
            .unwrap()
    }

    #[tokio::test]
    async fn acknowledges_then_replies() {
        let f = fixture(Duration::from_secs(5));
        let env = envelope(&f, "tenant-a", "echo", json!({"x": 1}));
        let pending = f.inbox.expect(env.trace_id().clone());

        let ack = f.router.receive(env.clone()).await.unwrap();
        assert_eq!(ack.envelope_id, env.id());
        assert_eq!(&ack.trace_id, env.trace_id());

        let reply = pending.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply.envelope_id, env.id());
        assert_eq!(&reply.conversation_id, env.conversation_id());
        assert_eq!(
            reply.outcome,
            ReplyOutcome::Success { result: json!({"echo": {"x": 1}, "tenant": "tenant-a"}) }
        );
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forged_signature_never_reaches_handler() {
        let f = fixture(Duration::from_secs(5));
        let forger = HmacSigner::new("agent-a", b"guessed".to_vec());
        let env = MessageEnvelope::builder("tenant-a")
            .reply_to(f.inbox.address())
            .tool("echo", json!({}))
            .sign(&forger)
            .unwrap();

        let err = f.router.receive(env.clone()).await.unwrap_err();
        assert_eq!(err, ValidationError::InvalidSignature { caller: "agent-a".into() });
        assert_eq!(f.router.call_state(&env.id()), None);
        tokio::task::yield_now().await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_envelopes_leave_no_state_behind() {
        let f = fixture(Duration::from_secs(5));
        let forger = HmacSigner::new("agent-a", b"guessed".to_vec());

        for _ in 0..500 {
            let env = MessageEnvelope::builder("tenant-a")
                .reply_to(f.inbox.address())
                .tool("echo", json!({}))
                .sign(&forger)
                .unwrap();
            assert!(f.router.receive(env).await.is_err());
        }
        for _ in 0..500 {
            let env = envelope(&f, "tenant-b", "echo", json!({}));
            assert!(f.router.receive(env).await.is_err());
        }

        assert_eq!(f.router.tracked_calls(), 0);
    }

    #[tokio::test]
    async fn settled_calls_are_forgotten_with_their_replay_entry() {
        let f = fixture_with(RouterConfig {
            handler_timeout: Duration::from_secs(5),
            replay_window: Duration::from_millis(300),
            ..Default::default()
        });
        let done = envelope(&f, "tenant-a", "echo", json!({}));
        let pending = f.inbox.expect(done.trace_id().clone());
        f.router.receive(done.clone()).await.unwrap();
        pending.wait(Duration::from_secs(5)).await.unwrap();
        while f.router.call_state(&done.id()) != Some(CallState::Completed) {
            tokio::task::yield_now().await;
        }

        let running = envelope(&f, "tenant-a", "sleep", json!({}));
        f.router.receive(running.clone()).await.unwrap();
        assert_eq!(f.router.tracked_calls(), 2);

        // Still inside the window: nothing is pruned.
        assert_eq!(f.router.prune_consumed(), 0);
        assert_eq!(f.router.tracked_calls(), 2);

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(f.router.prune_consumed(), 2);
        assert_eq!(f.router.call_state(&done.id()), None);
        assert_eq!(f.router.call_state(&running.id()), Some(CallState::Dispatched));
        assert_eq!(f.router.tracked_calls(), 1);
    }

    #[tokio::test]
    async fn tenant_checks_reject_before_dispatch() {
        let f = fixture(Duration::from_secs(5));

        let other_tenant = envelope(&f, "tenant-b", "echo", json!({}));
        assert!(matches!(
            f.router.receive(other_tenant).await,
            Err(ValidationError::UnauthorizedTenant { .. })
        ));

        let cross = envelope(&f, "tenant-a", "echo", json!({"tenant_id": "tenant-b"}));
        assert_eq!(
            f.router.receive(cross).await.unwrap_err(),
            ValidationError::CrossTenantReference { scoped: "tenant-a".into(), referenced: "tenant-b".into() }
        );

        let no_reply_to = MessageEnvelope::builder("tenant-a").tool("echo", json!({})).sign(&f.signer).unwrap();
        assert_eq!(
            f.router.receive(no_reply_to).await.unwrap_err(),
            ValidationError::MissingHeader("reply_to")
        );
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn replayed_envelope_is_rejected() {
        let f = fixture(Duration::from_secs(5));
        let env = envelope(&f, "tenant-a", "echo", json!({}));
        let pending = f.inbox.expect(env.trace_id().clone());

        f.router.receive(env.clone()).await.unwrap();
        pending.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(f.router.receive(env.clone()).await.unwrap_err(), ValidationError::Replayed(env.id()));
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_tool_fails_through_reply_path() {
        let f = fixture(Duration::from_secs(5));
        let env = envelope(&f, "tenant-a", "fs.read", json!({}));
        let pending = f.inbox.expect(env.trace_id().clone());

        f.router.receive(env.clone()).await.unwrap();
        let reply = pending.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            reply.outcome,
            ReplyOutcome::Failure { error: HandlerError::UnknownTool("fs.read".into()) }
        );

        while f.router.call_state(&env.id()) != Some(CallState::Failed) {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out() {
        let f = fixture(Duration::from_millis(250));
        let env = envelope(&f, "tenant-a", "sleep", json!({}));
        let pending = f.inbox.expect(env.trace_id().clone());

        f.router.receive(env).await.unwrap();
        let reply = pending.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply.outcome, ReplyOutcome::Failure { error: HandlerError::TimedOut { after_ms: 250 } });
    }

    #[tokio::test]
    async fn panicking_handler_becomes_failure_reply() {
        let f = fixture(Duration::from_secs(5));
        let env = envelope(&f, "tenant-a", "boom", json!({}));
        let pending = f.inbox.expect(env.trace_id().clone());

        f.router.receive(env).await.unwrap();
        let reply = pending.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            reply.outcome,
            ReplyOutcome::Failure { error: HandlerError::Panicked("handler blew up".into()) }
        );
    }
}
