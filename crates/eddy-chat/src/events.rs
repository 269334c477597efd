//! Update types published to the view layer

use eddy_wire::{ExecutionLogEntry, Message};
use serde::Serialize;

use crate::agents::AgentActivity;

/// State of the push connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting { attempt: u32 },
    Open,
    /// Dropped; the next attempt starts after `delay_ms`
    Reconnecting { attempt: u32, delay_ms: u64, error: String },
    /// Attempts exhausted; the connection will not be retried
    GaveUp { attempts: u32 },
    Closed,
}

/// A change to the conversation, emitted after it was applied
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatUpdate {
    /// A message was appended
    MessageAdded { message: Message },

    /// A message changed in place
    MessageUpdated { message: Message },

    /// An optimistic message received its server id
    Rekeyed { client_id: String, server_id: String },

    /// Older history was prepended; `anchor` is the message that was first
    /// before the prepend, for viewport restoration
    MessagesPrepended {
        ids: Vec<String>,
        anchor: Option<String>,
    },

    /// Messages were removed by rollback, edit or abort
    MessagesRemoved { ids: Vec<String> },

    /// Messages came back after a failed rollback
    MessagesRestored { ids: Vec<String> },

    /// The execution log of a streaming message grew or changed
    ExecutionLog {
        message_id: String,
        entry: ExecutionLogEntry,
    },

    /// Ephemeral agent activity; `None` clears the indicator
    AgentActivity {
        agent_id: String,
        activity: Option<AgentActivity>,
    },

    /// Status line of one agent's stream (`thinking`, `streaming`); `None`
    /// when the stream finished
    StreamingStatus {
        agent_id: String,
        message_id: String,
        status: Option<String>,
    },

    Connection(ConnectionStatus),

    SummarizationStart { tokens_before: u32 },

    SummarizationEnd { tokens_before: u32, tokens_after: u32 },

    /// A recoverable error the user should see
    Error { message: String },
}

impl ChatUpdate {
    /// Id of the message the update is about, if any
    pub fn message_id(&self) -> Option<&str> {
        match self {
            ChatUpdate::MessageAdded { message } | ChatUpdate::MessageUpdated { message } => {
                Some(message.id.as_str())
            }
            ChatUpdate::Rekeyed { server_id, .. } => Some(server_id.as_str()),
            ChatUpdate::ExecutionLog { message_id, .. }
            | ChatUpdate::StreamingStatus { message_id, .. } => Some(message_id.as_str()),
            _ => None,
        }
    }
}
