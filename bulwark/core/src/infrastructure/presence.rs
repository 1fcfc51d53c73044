// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! In-process agent presence registry.
//!
//! Fed by discovery/heartbeat signals from outside the core. Agents are
//! assumed online until first marked offline, so a registry with no
//! information never blocks delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::domain::delivery::AgentPresence;
use crate::domain::envelope::AgentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    Online,
    Offline,
}

pub struct PresenceRegistry {
    agents: DashMap<AgentId, (Presence, DateTime<Utc>)>,
    came_online: broadcast::Sender<AgentId>,
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceRegistry {
    pub fn new() -> Self {
        let (came_online, _) = broadcast::channel(256);
        Self {
            agents: DashMap::new(),
            came_online,
        }
    }

    /// Record a heartbeat. Publishes a came-online notification on an
    /// offline → online change.
    pub fn mark_online(&self, agent: &AgentId) {
        let previous = self
            .agents
            .insert(agent.clone(), (Presence::Online, Utc::now()))
            .map(|(presence, _)| presence);

        if previous == Some(Presence::Offline) {
            info!(agent = %agent, "agent came back online");
            let _ = self.came_online.send(agent.clone());
        } else {
            debug!(agent = %agent, "agent heartbeat");
        }
    }

    pub fn mark_offline(&self, agent: &AgentId) {
        info!(agent = %agent, "agent marked offline");
        self.agents.insert(agent.clone(), (Presence::Offline, Utc::now()));
    }

    pub fn last_seen(&self, agent: &AgentId) -> Option<DateTime<Utc>> {
        self.agents
            .get(agent)
            .filter(|entry| entry.0 == Presence::Online)
            .map(|entry| entry.1)
    }
}

#[async_trait]
impl AgentPresence for PresenceRegistry {
    async fn is_online(&self, agent: &AgentId) -> bool {
        self.agents
            .get(agent)
            .map(|entry| entry.0 == Presence::Online)
            .unwrap_or(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<AgentId> {
        self.came_online.subscribe()
    }
}
