//! eddy-chat: streaming conversation reconciliation
//!
//! This crate keeps a conversation's message log consistent while agents
//! stream into it over an unreliable push connection, and drives the user
//! actions (send, abort, rollback, edit, retry, summarization, pagination)
//! that mutate the same log.

pub mod agents;
pub mod backend;
pub mod connection;
pub mod error;
pub mod events;
pub mod handle;
pub mod history;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod store;
pub mod summarize;
pub mod tokens;
pub mod trace;
pub mod transport;

#[cfg(test)]
mod testing;

pub use agents::{AgentActivity, AgentStateTable};
pub use backend::{PersistenceApi, RegistrySource, Summarizer, SummaryOutcome};
pub use connection::{ConnectionHandle, ConnectionItem, StreamConnection};
pub use error::{Error, Result};
pub use events::{ChatUpdate, ConnectionStatus};
pub use handle::SessionHandle;
pub use history::HistoryPager;
pub use reconciler::StreamReconciler;
pub use registry::{RegistryCache, Resolution};
pub use session::{ChatSession, SessionConfig};
pub use store::MessageStore;
pub use summarize::{SummarizationConfig, SummarizationTrigger};
pub use transport::{EventTransport, RetryConfig, SseTransport};
