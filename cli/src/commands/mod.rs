// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for Bulwark CLI

pub mod config;
pub mod dead_letter;
pub mod envelope;
pub mod keygen;

pub use self::config::ConfigCommand;
pub use self::dead_letter::DeadLetterCommand;
pub use self::envelope::EnvelopeCommand;
pub use self::keygen::KeygenArgs;
