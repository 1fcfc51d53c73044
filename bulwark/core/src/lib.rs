// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Bulwark Core
//!
//! Resilient service facade (per-backend circuit breakers with tiered
//! fallback) and the signed, acknowledge-then-callback agent messaging
//! protocol that carries facade calls across agent boundaries.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** `domain` holds the state machines and contracts,
//!   `application` wires them into the facade, router and dispatcher,
//!   `infrastructure` provides concrete backends, transports and stores.

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod metrics;

pub use domain::*;
