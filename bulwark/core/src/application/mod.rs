// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application
//!
//! Use-case services that drive the domain: fallback selection and the
//! service facade, background health probing, and the router/dispatcher pair
//! that carries agent tool calls.

pub mod facade_registry;
pub mod fallback_manager;
pub mod health_monitor;
pub mod mcp_router;
pub mod reply_dispatcher;
pub mod service_facade;

use std::time::Duration;

pub use facade_registry::FacadeRegistry;
pub use fallback_manager::{Candidate, FallbackManager, Selection};
pub use health_monitor::{CheckOutcome, CheckReport, HealthMonitor, HealthTarget};
pub use mcp_router::{McpRouter, ToolContext, ToolHandler, ToolRegistry};
pub use reply_dispatcher::ReplyDispatcher;
pub use service_facade::{
    BoundChain, CallContext, CandidateStatus, CapabilityStatus, Served, ServedBy, ServiceFacade, ServiceFacadeBuilder,
};

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
