//! Ephemeral per-agent activity
//!
//! Deciding, decided and executing indicators never enter the message log.
//! Entries that should fade out carry a deadline and are pruned by
//! [`AgentStateTable::expire`].

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use eddy_wire::DecisionAction;
use serde::Serialize;

/// How long a decision or a finished indicator stays visible
pub const LINGER: Duration = Duration::from_secs(2);

/// What an agent is doing right now
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentActivity {
    /// Deciding whether to reply to a message
    Deciding { in_reply_to: Option<String> },
    /// Made a decision; removed after [`LINGER`]
    Decided {
        action: DecisionAction,
        reason: Option<String>,
    },
    /// Producing a message
    Executing { message_id: String },
    /// Finished a message; indicator cleared after [`LINGER`]
    Finished { message_id: String },
}

#[derive(Debug, Clone)]
pub struct AgentState {
    pub name: Option<String>,
    pub activity: AgentActivity,
    expires_at: Option<Instant>,
}

/// Activity of every agent in the conversation
#[derive(Debug, Default)]
pub struct AgentStateTable {
    agents: HashMap<String, AgentState>,
}

impl AgentStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentState> {
        self.agents.get(agent_id)
    }

    pub fn activity(&self, agent_id: &str) -> Option<&AgentActivity> {
        self.agents.get(agent_id).map(|s| &s.activity)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AgentState)> {
        self.agents.iter().map(|(id, s)| (id.as_str(), s))
    }

    fn set(
        &mut self,
        agent_id: &str,
        name: Option<String>,
        activity: AgentActivity,
        expires_at: Option<Instant>,
    ) -> bool {
        let name = name.or_else(|| self.agents.get(agent_id).and_then(|s| s.name.clone()));
        let unchanged = self
            .agents
            .get(agent_id)
            .is_some_and(|s| s.activity == activity && s.name == name);
        if unchanged {
            return false;
        }
        self.agents.insert(
            agent_id.to_string(),
            AgentState {
                name,
                activity,
                expires_at,
            },
        );
        true
    }

    pub fn set_deciding(
        &mut self,
        agent_id: &str,
        name: Option<String>,
        in_reply_to: Option<String>,
    ) -> bool {
        self.set(agent_id, name, AgentActivity::Deciding { in_reply_to }, None)
    }

    pub fn set_decision(
        &mut self,
        agent_id: &str,
        action: DecisionAction,
        reason: Option<String>,
        now: Instant,
    ) -> bool {
        self.set(
            agent_id,
            None,
            AgentActivity::Decided { action, reason },
            Some(now + LINGER),
        )
    }

    /// Mark the agent as producing `message_id`; replaces any deciding state
    pub fn set_executing(&mut self, agent_id: &str, name: Option<String>, message_id: &str) -> bool {
        self.set(
            agent_id,
            name,
            AgentActivity::Executing {
                message_id: message_id.to_string(),
            },
            None,
        )
    }

    pub fn finish(&mut self, agent_id: &str, message_id: &str, now: Instant) -> bool {
        self.set(
            agent_id,
            None,
            AgentActivity::Finished {
                message_id: message_id.to_string(),
            },
            Some(now + LINGER),
        )
    }

    pub fn clear(&mut self, agent_id: &str) -> bool {
        self.agents.remove(agent_id).is_some()
    }

    /// Drop every indicator tied to a message that no longer exists
    pub fn clear_message(&mut self, message_id: &str) -> Vec<String> {
        let stale: Vec<String> = self
            .agents
            .iter()
            .filter(|(_, s)| match &s.activity {
                AgentActivity::Executing { message_id: m } | AgentActivity::Finished { message_id: m } => {
                    m == message_id
                }
                _ => false,
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.agents.remove(id);
        }
        stale
    }

    /// Remove entries whose deadline passed; returns their agent ids
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .agents
            .iter()
            .filter(|(_, s)| s.expires_at.is_some_and(|at| at <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.agents.remove(id);
        }
        expired
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.agents.values().filter_map(|s| s.expires_at).min()
    }
}
