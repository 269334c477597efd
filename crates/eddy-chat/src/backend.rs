//! Collaborator contracts: persistence, summarization and registry lookups
//!
//! The engine only talks to these traits. [`ApiClient`] implements all of
//! them over REST.

use async_trait::async_trait;
use eddy_wire::{AgentProfile, ApiClient, Message, Page};

use crate::error::{Error, Result};

pub use eddy_wire::SummaryResponse as SummaryOutcome;

/// Persisted message history
#[async_trait]
pub trait PersistenceApi: Send + Sync {
    /// Fetch messages older than `before`, or the newest page
    async fn fetch_page(
        &self,
        conversation_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Page>;

    /// Persist a new message; returns the server id
    async fn append(&self, conversation_id: &str, message: &Message) -> Result<String>;

    async fn delete(&self, conversation_id: &str, message_id: &str) -> Result<()>;

    /// Delete everything after `message_id`
    async fn rollback_to(&self, conversation_id: &str, message_id: &str) -> Result<()>;
}

/// External summarization service
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message], model_id: &str) -> Result<SummaryOutcome>;
}

/// Source of registry metadata (agent profiles, tool descriptions)
#[async_trait]
pub trait RegistrySource<T>: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<T>;
}

#[async_trait]
impl PersistenceApi for ApiClient {
    async fn fetch_page(
        &self,
        conversation_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Page> {
        Ok(ApiClient::fetch_page(self, conversation_id, before, limit).await?)
    }

    async fn append(&self, conversation_id: &str, message: &Message) -> Result<String> {
        Ok(self
            .append_message(
                conversation_id,
                message.role,
                &message.content,
                message.client_id.as_deref().or(Some(message.id.as_str())),
            )
            .await?)
    }

    async fn delete(&self, conversation_id: &str, message_id: &str) -> Result<()> {
        Ok(self.delete_message(conversation_id, message_id).await?)
    }

    async fn rollback_to(&self, conversation_id: &str, message_id: &str) -> Result<()> {
        Ok(ApiClient::rollback_to(self, conversation_id, message_id).await?)
    }
}

#[async_trait]
impl Summarizer for ApiClient {
    async fn summarize(&self, messages: &[Message], model_id: &str) -> Result<SummaryOutcome> {
        ApiClient::summarize(self, model_id, messages)
            .await
            .map_err(|e| Error::Summarization(e.to_string()))
    }
}

#[async_trait]
impl RegistrySource<AgentProfile> for ApiClient {
    async fn fetch(&self, id: &str) -> Result<AgentProfile> {
        Ok(self.fetch_agent(id).await?)
    }
}
