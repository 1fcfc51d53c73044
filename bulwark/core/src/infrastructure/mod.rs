// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod dead_letter;
pub mod event_bus;
pub mod local;
pub mod presence;
pub mod signature;
pub mod transport;

pub use dead_letter::{FileDeadLetterStore, InMemoryDeadLetterStore};
pub use event_bus::{EventBus, EventBusError, EventReceiver, TraceEventReceiver};
pub use presence::PresenceRegistry;
pub use signature::{Ed25519KeyRing, Ed25519Signer, HmacKeyRing, HmacSigner};
pub use transport::{CompositeTransport, HttpReplyTransport, InProcessTransport, PendingReply, ReplyInbox};
