// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Reply Dispatcher - Background delivery of handler results to `reply_to`
//!
//! Handler completions are queued on a bounded channel. A single worker takes
//! them off the queue and runs one delivery task per envelope, bounded by a
//! semaphore.
//!
//! # Delivery rules
//!
//! - Attempts for one envelope run strictly in sequence inside its task;
//!   different envelopes deliver in parallel.
//! - Transient failures retry with exponential backoff until
//!   `retry.max_attempts`; permanent failures stop at once.
//! - An exhausted or permanently failed reply goes to the dead-letter store
//!   exactly once and raises a `DeadLettered` event. Nothing is dropped: if
//!   the store write fails, a `DeadLetterStoreFailed` event is raised and the
//!   write is retried with the delivery backoff.
//! - A reply whose target agent is offline is parked without spending an
//!   attempt and flushed when presence reports the agent back online.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Asynchronous half of the acknowledge-then-callback protocol

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::delivery::{AgentPresence, DeadLetterStore, ReplyTransport};
use crate::domain::envelope::{AgentId, EnvelopeId, ReplyAddress};
use crate::domain::errors::{DeadLetterError, DeliveryError, DeliveryExhaustedError, DispatchError};
use crate::domain::events::DeliveryEvent;
use crate::domain::node_config::DispatcherConfig;
use crate::domain::reply::{DeadLetter, PendingCallback, ReplyPayload};
use crate::infrastructure::event_bus::EventBus;

pub struct ReplyDispatcher {
    inner: Arc<DispatcherInner>,
    sender: mpsc::Sender<PendingCallback>,
    receiver: Mutex<Option<mpsc::Receiver<PendingCallback>>>,
    shutdown_token: CancellationToken,
}

struct DispatcherInner {
    transport: Arc<dyn ReplyTransport>,
    presence: Arc<dyn AgentPresence>,
    dead_letters: Arc<dyn DeadLetterStore>,
    event_bus: EventBus,
    config: DispatcherConfig,
    parked: Mutex<HashMap<AgentId, Vec<PendingCallback>>>,
    /// Envelopes queued, parked or being delivered.
    active: DashMap<EnvelopeId, ()>,
    permits: Arc<Semaphore>,
}

impl ReplyDispatcher {
    pub fn new(
        transport: Arc<dyn ReplyTransport>,
        presence: Arc<dyn AgentPresence>,
        dead_letters: Arc<dyn DeadLetterStore>,
        event_bus: EventBus,
        config: DispatcherConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let permits = Arc::new(Semaphore::new(config.max_concurrent_deliveries.max(1)));
        Self {
            inner: Arc::new(DispatcherInner {
                transport,
                presence,
                dead_letters,
                event_bus,
                config,
                parked: Mutex::new(HashMap::new()),
                active: DashMap::new(),
                permits,
            }),
            sender,
            receiver: Mutex::new(Some(receiver)),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Start the delivery worker. Only the first call starts anything.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let receiver = self.receiver.lock().take();
        tokio::spawn(async move {
            match receiver {
                Some(receiver) => self.run(receiver).await,
                None => warn!("Reply dispatcher already started"),
            }
        })
    }

    /// Queue a reply for delivery to `reply_to`.
    pub async fn deliver(&self, reply_to: ReplyAddress, payload: ReplyPayload) -> Result<(), DispatchError> {
        self.enqueue(PendingCallback::new(reply_to, Arc::new(payload))).await
    }

    /// Move a dead letter back into the queue with a fresh attempt budget.
    pub async fn redeliver(&self, envelope_id: &EnvelopeId) -> Result<(), DispatchError> {
        if self.inner.active.contains_key(envelope_id) {
            return Err(DispatchError::InFlight(*envelope_id));
        }
        let letter = self.inner.dead_letters.remove(envelope_id).await?;
        info!(
            envelope_id = %envelope_id,
            trace_id = %letter.payload.trace_id,
            reply_to = %letter.reply_to,
            "redelivering dead letter"
        );

        let callback = PendingCallback::new(letter.reply_to.clone(), Arc::new(letter.payload.clone()));
        if let Err(err) = self.enqueue(callback).await {
            self.inner.dead_letters.insert(letter).await?;
            return Err(err);
        }
        self.inner.event_bus.publish_delivery_event(DeliveryEvent::Redelivered {
            envelope_id: *envelope_id,
            trace_id: letter.payload.trace_id,
        });
        Ok(())
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, DeadLetterError> {
        self.inner.dead_letters.list().await
    }

    pub fn parked_count(&self) -> usize {
        self.inner.parked.lock().values().map(Vec::len).sum()
    }

    /// Replies queued, parked or in delivery.
    pub fn pending_count(&self) -> usize {
        self.inner.active.len()
    }

    async fn enqueue(&self, callback: PendingCallback) -> Result<(), DispatchError> {
        if self.shutdown_token.is_cancelled() {
            return Err(DispatchError::Closed);
        }
        let envelope_id = callback.envelope_id;
        if self.inner.active.insert(envelope_id, ()).is_some() {
            return Err(DispatchError::InFlight(envelope_id));
        }
        if self.sender.send(callback).await.is_err() {
            self.inner.active.remove(&envelope_id);
            return Err(DispatchError::Closed);
        }
        debug!(envelope_id = %envelope_id, "reply queued for delivery");
        Ok(())
    }

    async fn run(&self, mut receiver: mpsc::Receiver<PendingCallback>) {
        info!(
            max_concurrent = self.inner.config.max_concurrent_deliveries,
            max_attempts = self.inner.config.retry.max_attempts,
            "Starting reply dispatcher"
        );

        let mut came_online = self.inner.presence.subscribe();
        let mut presence_open = true;

        loop {
            tokio::select! {
                callback = receiver.recv() => match callback {
                    Some(callback) => Arc::clone(&self.inner).spawn_delivery(callback).await,
                    None => break,
                },
                agent = came_online.recv(), if presence_open => match agent {
                    Ok(agent) => self.inner.flush(Some(&agent)).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "presence notifications lagged, flushing every parked reply");
                        self.inner.flush(None).await;
                    }
                    Err(RecvError::Closed) => presence_open = false,
                },
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping reply dispatcher");
                    break;
                }
            }
        }

        // Hand off whatever was already queued.
        receiver.close();
        while let Ok(callback) = receiver.try_recv() {
            Arc::clone(&self.inner).spawn_delivery(callback).await;
        }
        info!("Reply dispatcher stopped");
    }
}

impl DispatcherInner {
    async fn spawn_delivery(self: Arc<Self>, callback: PendingCallback) {
        let permit = Arc::clone(&self.permits).acquire_owned().await.ok();
        tokio::spawn(async move {
            let _permit = permit;
            self.deliver_with_retry(callback).await;
        });
    }

    /// Re-spawn parked replies, for one agent or for every agent now online.
    async fn flush(self: &Arc<Self>, agent: Option<&AgentId>) {
        let ready: Vec<PendingCallback> = match agent {
            Some(agent) => self.parked.lock().remove(agent).unwrap_or_default(),
            None => {
                let agents: Vec<AgentId> = self.parked.lock().keys().cloned().collect();
                let mut ready = Vec::new();
                for agent in agents {
                    if self.presence.is_online(&agent).await {
                        ready.extend(self.parked.lock().remove(&agent).unwrap_or_default());
                    }
                }
                ready
            }
        };
        if ready.is_empty() {
            return;
        }
        info!(count = ready.len(), "flushing parked replies");
        self.record_parked();
        for callback in ready {
            Arc::clone(self).spawn_delivery(callback).await;
        }
    }

    async fn deliver_with_retry(&self, mut callback: PendingCallback) {
        let retry = &self.config.retry;
        loop {
            let agent = callback.reply_to.agent_id();
            if !self.presence.is_online(&agent).await {
                let envelope_id = callback.envelope_id;
                self.park(&agent, callback);
                if !self.presence.is_online(&agent).await {
                    return;
                }
                // came back between the check and parking
                match self.unpark(&agent, &envelope_id) {
                    Some(parked) => callback = parked,
                    None => return,
                }
            }

            callback.attempt_count += 1;
            let result = match tokio::time::timeout(
                self.config.delivery_timeout,
                self.transport.deliver(&callback.reply_to, &callback.payload),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Transient(format!(
                    "delivery timed out after {:?}",
                    self.config.delivery_timeout
                ))),
            };

            match result {
                Ok(()) => {
                    crate::metrics::record_delivery_attempt("delivered");
                    debug!(
                        envelope_id = %callback.envelope_id,
                        trace_id = %callback.payload.trace_id,
                        attempts = callback.attempt_count,
                        "reply delivered"
                    );
                    self.active.remove(&callback.envelope_id);
                    self.event_bus.publish_delivery_event(DeliveryEvent::Delivered {
                        envelope_id: callback.envelope_id,
                        trace_id: callback.payload.trace_id.clone(),
                        reply_to: callback.reply_to.clone(),
                        attempts: callback.attempt_count,
                        delivered_at: Utc::now(),
                    });
                    return;
                }
                Err(err) if err.is_transient() && !retry.is_exhausted(callback.attempt_count) => {
                    crate::metrics::record_delivery_attempt("retry");
                    let delay = retry.delay_after(callback.attempt_count);
                    callback.next_attempt_at = Instant::now() + delay;
                    debug!(
                        envelope_id = %callback.envelope_id,
                        attempt = callback.attempt_count,
                        delay = ?delay,
                        error = %err,
                        "reply delivery failed, retrying"
                    );
                    self.event_bus.publish_delivery_event(DeliveryEvent::RetryScheduled {
                        envelope_id: callback.envelope_id,
                        trace_id: callback.payload.trace_id.clone(),
                        attempt: callback.attempt_count,
                        delay_ms: crate::application::duration_ms(delay),
                        error: err.to_string(),
                    });
                    tokio::time::sleep_until(callback.next_attempt_at).await;
                }
                Err(err) => {
                    crate::metrics::record_delivery_attempt("failed");
                    self.dead_letter(callback, err).await;
                    return;
                }
            }
        }
    }

    fn park(&self, agent: &AgentId, callback: PendingCallback) {
        debug!(envelope_id = %callback.envelope_id, agent = %agent, "agent offline, parking reply");
        self.event_bus.publish_delivery_event(DeliveryEvent::Parked {
            envelope_id: callback.envelope_id,
            trace_id: callback.payload.trace_id.clone(),
            agent_id: agent.clone(),
        });
        self.parked.lock().entry(agent.clone()).or_default().push(callback);
        self.record_parked();
    }

    fn unpark(&self, agent: &AgentId, envelope_id: &EnvelopeId) -> Option<PendingCallback> {
        let mut parked = self.parked.lock();
        let entries = parked.get_mut(agent)?;
        let index = entries.iter().position(|c| &c.envelope_id == envelope_id)?;
        let callback = entries.remove(index);
        if entries.is_empty() {
            parked.remove(agent);
        }
        drop(parked);
        self.record_parked();
        Some(callback)
    }

    fn record_parked(&self) {
        let count = self.parked.lock().values().map(Vec::len).sum();
        crate::metrics::record_parked_callbacks(count);
    }

    async fn dead_letter(&self, callback: PendingCallback, err: DeliveryError) {
        let exhausted = DeliveryExhaustedError {
            envelope_id: callback.envelope_id,
            reply_to: callback.reply_to.to_string(),
            attempts: callback.attempt_count,
            last_error: err.to_string(),
        };
        let letter = DeadLetter {
            envelope_id: callback.envelope_id,
            reply_to: callback.reply_to.clone(),
            payload: callback.payload.as_ref().clone(),
            attempts: callback.attempt_count,
            last_error: err.to_string(),
            dead_lettered_at: Utc::now(),
        };
        let dead_lettered_at = letter.dead_lettered_at;

        // The reply stays active until the store accepts it.
        let mut store_attempt = 0u32;
        let inserted = loop {
            store_attempt += 1;
            match self.dead_letters.insert(letter.clone()).await {
                Ok(inserted) => break inserted,
                Err(store_err) => {
                    let delay = self.config.retry.delay_after(store_attempt);
                    error!(
                        envelope_id = %callback.envelope_id,
                        trace_id = %callback.payload.trace_id,
                        attempt = store_attempt,
                        retry_in = ?delay,
                        error = %store_err,
                        "failed to persist dead letter"
                    );
                    crate::metrics::record_dead_letter_store_failure();
                    self.event_bus.publish_delivery_event(DeliveryEvent::DeadLetterStoreFailed {
                        envelope_id: callback.envelope_id,
                        trace_id: callback.payload.trace_id.clone(),
                        attempt: store_attempt,
                        error: store_err.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        };

        self.active.remove(&callback.envelope_id);
        if !inserted {
            warn!(envelope_id = %callback.envelope_id, "dead letter already recorded for envelope");
            return;
        }
        error!(
            envelope_id = %callback.envelope_id,
            trace_id = %callback.payload.trace_id,
            reply_to = %callback.reply_to,
            attempts = callback.attempt_count,
            error = %err,
            "reply undeliverable, moved to dead-letter store"
        );
        crate::metrics::record_dead_letter();
        self.event_bus.publish_delivery_event(DeliveryEvent::DeadLettered {
            trace_id: callback.payload.trace_id.clone(),
            error: exhausted,
            dead_lettered_at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::delivery::RetryPolicy;
    use crate::domain::envelope::{ConversationId, TenantId, TraceId};
    use crate::domain::events::BulwarkEvent;
    use crate::domain::reply::ReplyOutcome;
    use crate::infrastructure::dead_letter::InMemoryDeadLetterStore;
    use crate::infrastructure::presence::PresenceRegistry;
    use crate::infrastructure::transport::InProcessTransport;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        dispatcher: Arc<ReplyDispatcher>,
        transport: Arc<InProcessTransport>,
        presence: Arc<PresenceRegistry>,
        store: InMemoryDeadLetterStore,
        bus: EventBus,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let transport = Arc::new(InProcessTransport::new());
        let presence = Arc::new(PresenceRegistry::new());
        let store = InMemoryDeadLetterStore::new();
        let bus = EventBus::with_default_capacity();
        let config = DispatcherConfig {
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(100),
                jitter: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let dispatcher = Arc::new(ReplyDispatcher::new(
            transport.clone(),
            presence.clone(),
            Arc::new(store.clone()),
            bus.clone(),
            config,
        ));
        dispatcher.clone().start();
        Fixture { dispatcher, transport, presence, store, bus }
    }

    fn payload(trace: &str) -> ReplyPayload {
        ReplyPayload {
            envelope_id: EnvelopeId::new(),
            trace_id: TraceId::new(trace),
            conversation_id: ConversationId::new("conv-1"),
            tenant_id: TenantId::new("tenant-a"),
            tool_name: "echo".into(),
            outcome: ReplyOutcome::Success { result: json!({"ok": true}) },
            completed_at: Utc::now(),
        }
    }

    async fn next_delivery_event(receiver: &mut crate::infrastructure::event_bus::EventReceiver) -> DeliveryEvent {
        loop {
            if let BulwarkEvent::Delivery(event) = receiver.recv().await.unwrap() {
                match event {
                    DeliveryEvent::RetryScheduled { .. } | DeliveryEvent::Parked { .. } => continue,
                    other => return other,
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_to_reply_address() {
        let f = fixture(3);
        let inbox = f.transport.register("agent-a");
        let mut events = f.bus.subscribe();

        let p = payload("trace-1");
        let pending = inbox.expect(p.trace_id.clone());
        f.dispatcher.deliver(inbox.address(), p.clone()).await.unwrap();

        assert_eq!(pending.wait(Duration::from_secs(5)).await.unwrap(), p);
        assert!(matches!(
            next_delivery_event(&mut events).await,
            DeliveryEvent::Delivered { attempts: 1, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reply_is_dead_lettered_once() {
        let f = fixture(3);
        f.transport.register("agent-a");
        f.transport.set_reachable(&"agent-a".into(), false);
        let mut events = f.bus.subscribe();

        let p = payload("trace-2");
        f.dispatcher.deliver(ReplyAddress::new("local://agent-a"), p.clone()).await.unwrap();

        match next_delivery_event(&mut events).await {
            DeliveryEvent::DeadLettered { error, .. } => {
                assert_eq!(error.envelope_id, p.envelope_id);
                assert_eq!(error.attempts, 3);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(f.store.len(), 1);
        assert_eq!(f.dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_skips_retries() {
        let f = fixture(5);
        let mut events = f.bus.subscribe();
        let p = payload("trace-3");
        f.dispatcher.deliver(ReplyAddress::new("ftp://agent-a"), p).await.unwrap();

        match next_delivery_event(&mut events).await {
            DeliveryEvent::DeadLettered { error, .. } => assert_eq!(error.attempts, 1),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn offline_agent_is_parked_then_flushed() {
        let f = fixture(3);
        let inbox = f.transport.register("agent-b");
        let agent: AgentId = "agent-b".into();
        f.presence.mark_offline(&agent);

        let p = payload("trace-4");
        let pending = inbox.expect(p.trace_id.clone());
        f.dispatcher.deliver(inbox.address(), p).await.unwrap();

        while f.dispatcher.parked_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(inbox.applied_count(), 0);

        f.presence.mark_online(&agent);
        let reply = pending.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply.trace_id.as_str(), "trace-4");
        assert_eq!(f.dispatcher.parked_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn redeliver_moves_letter_back_to_queue() {
        let f = fixture(1);
        let inbox = f.transport.register("agent-c");
        f.transport.set_reachable(&"agent-c".into(), false);
        let mut events = f.bus.subscribe();

        let p = payload("trace-5");
        f.dispatcher.deliver(inbox.address(), p.clone()).await.unwrap();
        next_delivery_event(&mut events).await;
        assert_eq!(f.dispatcher.dead_letters().await.unwrap().len(), 1);

        f.transport.set_reachable(&"agent-c".into(), true);
        f.dispatcher.redeliver(&p.envelope_id).await.unwrap();
        assert!(matches!(next_delivery_event(&mut events).await, DeliveryEvent::Redelivered { .. }));
        assert!(matches!(next_delivery_event(&mut events).await, DeliveryEvent::Delivered { .. }));
        assert_eq!(inbox.applied_count(), 1);
        assert!(f.store.is_empty());

        let again = f.dispatcher.redeliver(&p.envelope_id).await.unwrap_err();
        assert!(matches!(again, DispatchError::DeadLetter(DeadLetterError::NotFound(_))));
    }
}
