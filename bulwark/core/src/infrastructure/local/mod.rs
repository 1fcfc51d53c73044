// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Local fallback implementations, one per capability.
//!
//! These are the last resort of every fallback chain: no network, no external
//! process, tenant-partitioned like the primaries they stand in for.

pub mod cache;
pub mod compute;
pub mod database;
pub mod llm;
pub mod search;
pub mod storage;

pub use cache::TtlCache;
pub use compute::{LocalFunction, LocalFunctions};
pub use database::InMemoryDatabase;
pub use llm::RuleBasedLlm;
pub use search::LocalSearchIndex;
pub use storage::FilesystemBlobStore;
