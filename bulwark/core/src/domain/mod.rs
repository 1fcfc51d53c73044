// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Value types, state machines and collaborator traits of the facade and the
//! agent messaging protocol.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** No I/O; everything here is driven by the application layer

pub mod call;
pub mod capability;
pub mod circuit_breaker;
pub mod delivery;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod health;
pub mod node_config;
pub mod reply;
pub mod tenancy;
