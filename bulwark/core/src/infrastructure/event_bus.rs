// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Facade and Protocol Events
//
// In-memory event streaming over a tokio broadcast channel. Carries breaker
// transitions, router call-state changes and reply delivery outcomes to
// dashboards, alerting hooks and tests. Events are not persisted.

use crate::domain::circuit_breaker::BreakerObserver;
use crate::domain::envelope::TraceId;
use crate::domain::events::{BreakerTransition, BulwarkEvent, CallEvent, DeliveryEvent};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus for publishing and subscribing to facade/protocol events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<BulwarkEvent>>,
}

impl EventBus {
    /// Capacity bounds how many events are buffered before slow receivers lag
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_breaker_event(&self, event: BreakerTransition) {
        self.publish(BulwarkEvent::Breaker(event));
    }

    pub fn publish_call_event(&self, event: CallEvent) {
        self.publish(BulwarkEvent::Call(event));
    }

    pub fn publish_delivery_event(&self, event: DeliveryEvent) {
        self.publish(BulwarkEvent::Delivery(event));
    }

    fn publish(&self, event: BulwarkEvent) {
        debug!("Publishing event: {:?}", event);

        // send() only fails when nobody is subscribed
        let receiver_count = self.sender.send(event).unwrap_or(0);

        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to events of one logical request only
    pub fn subscribe_trace(&self, trace_id: TraceId) -> TraceEventReceiver {
        TraceEventReceiver {
            receiver: self.sender.subscribe(),
            trace_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl BreakerObserver for EventBus {
    fn on_transition(&self, transition: &BreakerTransition) {
        self.publish_breaker_event(transition.clone());
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all events
pub struct EventReceiver {
    receiver: broadcast::Receiver<BulwarkEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<BulwarkEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<BulwarkEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one `trace_id`
pub struct TraceEventReceiver {
    receiver: broadcast::Receiver<BulwarkEvent>,
    trace_id: TraceId,
}

impl TraceEventReceiver {
    /// Next event carrying this receiver's trace id; others are skipped
    pub async fn recv(&mut self) -> Result<BulwarkEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.trace_id() == Some(&self.trace_id) {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::circuit_breaker::CircuitState;
    use crate::domain::envelope::EnvelopeId;
    use crate::domain::events::TransitionReason;
    use chrono::Utc;

    #[tokio::test]
    async fn test_breaker_observer_publishes() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe();

        bus.on_transition(&BreakerTransition {
            service: "database:postgres".to_string(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
            reason: TransitionReason::FailureThreshold { failures: 3 },
            at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            BulwarkEvent::Breaker(t) => {
                assert_eq!(t.service, "database:postgres");
                assert_eq!(t.to, CircuitState::Open);
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_trace_filtering() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe_trace(TraceId::new("trace-a"));

        bus.publish_delivery_event(DeliveryEvent::Redelivered {
            envelope_id: EnvelopeId::new(),
            trace_id: TraceId::new("trace-b"),
        });
        let wanted = EnvelopeId::new();
        bus.publish_delivery_event(DeliveryEvent::Redelivered {
            envelope_id: wanted,
            trace_id: TraceId::new("trace-a"),
        });

        match receiver.recv().await.unwrap() {
            BulwarkEvent::Delivery(DeliveryEvent::Redelivered { envelope_id, .. }) => {
                assert_eq!(envelope_id, wanted);
            }
            other => panic!("Wrong event received: {:?}", other),
        }
    }

    #[test]
    fn test_try_recv_empty() {
        let bus = EventBus::default();
        let mut receiver = bus.subscribe();
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
        assert_eq!(bus.subscriber_count(), 1);
    }
}
