//! Chat session: the single owner of the message log
//!
//! The session multiplexes the push connection, ephemeral-state timers,
//! history pages and user actions. Everything that mutates the log runs on
//! the task that owns the session, so re-keying, rollback and streaming never
//! interleave mid-operation.

use std::{sync::Arc, time::Instant};

use eddy_wire::{Message, MessageState, Page, Role};
use tokio::sync::{broadcast, mpsc};

use crate::{
    backend::{PersistenceApi, Summarizer},
    connection::{ConnectionHandle, ConnectionItem, StreamConnection},
    error::{Error, Result},
    events::{ChatUpdate, ConnectionStatus},
    handle::SessionHandle,
    history::HistoryPager,
    reconciler::{SILENT_PREFIX, StreamReconciler},
    store::MessageStore,
    summarize::{SummarizationConfig, SummarizationTrigger},
    tokens,
    transport::{EventTransport, RetryConfig},
};

/// Prefix of ids the client generates before the server assigns one
pub const LOCAL_PREFIX: &str = "local-";

/// Configuration for a chat session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub conversation_id: String,
    /// Model the conversation runs on; selects the token ratio
    pub model_id: String,
    /// Context window of the model
    pub model_max_tokens: u32,
    /// Messages per history page
    pub page_size: usize,
    pub summarization: SummarizationConfig,
    pub retry: RetryConfig,
}

impl SessionConfig {
    pub fn new(conversation_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            model_id: model_id.into(),
            model_max_tokens: 8192,
            page_size: 50,
            summarization: SummarizationConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Whether the server knows this message
fn is_persisted(message: &Message) -> bool {
    !message.id.starts_with(LOCAL_PREFIX) && !message.id.starts_with(SILENT_PREFIX)
}

enum Wake {
    Connection(Option<ConnectionItem>),
    Page(Result<Page>),
    Timer,
    Abort,
}

/// One conversation: connection, reconciliation, pagination and actions
pub struct ChatSession {
    config: SessionConfig,
    reconciler: StreamReconciler,
    pager: HistoryPager,
    trigger: SummarizationTrigger,
    connector: StreamConnection,
    connection: Option<ConnectionHandle>,
    status: ConnectionStatus,
    persistence: Arc<dyn PersistenceApi>,
    summarizer: Arc<dyn Summarizer>,
    page_tx: mpsc::Sender<Result<Page>>,
    page_rx: mpsc::Receiver<Result<Page>>,
    handle: SessionHandle,
}

impl ChatSession {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn EventTransport>,
        persistence: Arc<dyn PersistenceApi>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        let (page_tx, page_rx) = mpsc::channel(4);
        Self {
            reconciler: StreamReconciler::new(),
            pager: HistoryPager::new(config.page_size),
            trigger: SummarizationTrigger::new(config.model_id.clone(), config.summarization.clone()),
            connector: StreamConnection::new(transport).with_retry_config(config.retry.clone()),
            connection: None,
            status: ConnectionStatus::Closed,
            persistence,
            summarizer,
            page_tx,
            page_rx,
            handle: SessionHandle::new(),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Get a cloneable handle for aborting from other tasks
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Subscribe to applied changes
    pub fn subscribe(&self) -> broadcast::Receiver<ChatUpdate> {
        self.reconciler.subscribe()
    }

    pub fn store(&self) -> &MessageStore {
        self.reconciler.store()
    }

    pub fn reconciler(&self) -> &StreamReconciler {
        &self.reconciler
    }

    pub fn pager(&self) -> &HistoryPager {
        &self.pager
    }

    pub fn connection_status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// Estimate of the tokens the next request will carry
    pub fn active_tokens(&self) -> u32 {
        tokens::estimate(self.store().active_history(), &self.config.model_id)
    }

    /// Open the push connection
    pub fn connect(&mut self) {
        if self.connection.is_none() {
            self.connection = Some(self.connector.open(&self.config.conversation_id));
        }
    }

    /// Close the push connection
    pub async fn close(&mut self) {
        if let Some(handle) = self.connection.take() {
            StreamConnection::close(handle).await;
        }
        self.set_status(ConnectionStatus::Closed);
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            self.status = status.clone();
            self.reconciler.emit(ChatUpdate::Connection(status));
        }
    }

    fn sync_streaming(&self) {
        self.handle.set_streaming(self.store().has_streaming());
    }

    /// Request the next older page. The fetch runs in the background and
    /// its result is applied by [`ChatSession::pump`], so live events keep
    /// flowing meanwhile. Returns `false` if a fetch is already in flight or
    /// history is exhausted.
    pub fn load_older(&mut self) -> bool {
        let Some(request) = self.pager.next_request() else {
            return false;
        };

        let persistence = Arc::clone(&self.persistence);
        let page_tx = self.page_tx.clone();
        let conversation_id = self.config.conversation_id.clone();
        tokio::spawn(async move {
            let result = persistence
                .fetch_page(&conversation_id, request.before.as_deref(), request.limit)
                .await;
            let _ = page_tx.send(result).await;
        });
        true
    }

    /// Wait for the next connection item, page, timer or abort and apply
    /// it. Cancel-safe. Returns `false` once the connection has ended.
    pub async fn pump(&mut self) -> bool {
        let deadline = self.reconciler.next_deadline();
        let cancel = self.handle.token();

        let wake = tokio::select! {
            item = next_item(&mut self.connection) => Wake::Connection(item),
            Some(page) = self.page_rx.recv() => Wake::Page(page),
            _ = sleep_until(deadline) => Wake::Timer,
            _ = cancel.cancelled() => Wake::Abort,
        };

        match wake {
            Wake::Connection(Some(ConnectionItem::Frame(frame))) => {
                self.reconciler.ingest(&frame, Instant::now());
                self.sync_streaming();
            }
            Wake::Connection(Some(ConnectionItem::Status(status))) => self.set_status(status),
            Wake::Connection(None) => {
                self.connection = None;
                if !matches!(self.status, ConnectionStatus::GaveUp { .. }) {
                    self.set_status(ConnectionStatus::Closed);
                }
                return false;
            }
            Wake::Page(Ok(page)) => {
                self.pager.apply_page(&mut self.reconciler, page);
            }
            Wake::Page(Err(e)) => {
                self.pager.fail();
                tracing::warn!("Failed to load history page: {}", e);
                self.reconciler.emit(ChatUpdate::Error {
                    message: format!("Failed to load history: {}", e),
                });
            }
            Wake::Timer => {
                self.reconciler.expire(Instant::now());
            }
            Wake::Abort => self.abort_streams(),
        }
        true
    }

    /// Abort every stream in progress and strip the partial messages
    pub fn abort(&mut self) {
        self.handle.abort();
        self.abort_streams();
    }

    fn abort_streams(&mut self) {
        let stripped = self.reconciler.strip_streaming();
        self.handle.reset();
        self.sync_streaming();
        tracing::info!(stripped = stripped.len(), "Aborted streaming");
    }

    /// Abort the reply in progress before a new turn. Also honors an abort
    /// raised through the handle that `pump` has not applied yet.
    fn cancel_pending(&mut self) {
        if self.handle.token().is_cancelled() || self.store().has_streaming() {
            self.abort_streams();
        }
    }

    /// Send a user message. Inserted optimistically, summarized first if the
    /// context is full, then persisted. Returns the server id.
    pub async fn send(&mut self, text: &str) -> Result<String> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Other("Cannot send an empty message".into()));
        }

        self.cancel_pending();
        let client_id = format!("{}{}", LOCAL_PREFIX, uuid::Uuid::new_v4());
        self.reconciler
            .insert_optimistic(Message::user(client_id.clone(), text));

        self.maybe_summarize().await;

        let Some(message) = self.store().get(&client_id).cloned() else {
            // the server echo already replaced it
            return Ok(self.store().resolve(&client_id).to_string());
        };

        match self
            .persistence
            .append(&self.config.conversation_id, &message)
            .await
        {
            Ok(server_id) => {
                self.reconciler.rekey(&client_id, &server_id);
                self.reconciler.patch(&server_id, |m| {
                    if m.state == MessageState::Pending {
                        m.state = MessageState::Done;
                    }
                });
                tracing::debug!(client_id = %client_id, server_id = %server_id, "Message sent");
                Ok(server_id)
            }
            Err(e) => {
                let error = e.to_string();
                self.reconciler.patch(&client_id, |m| {
                    m.state = MessageState::Error;
                    m.error = Some(error);
                });
                Err(Error::persistence("send message", e))
            }
        }
    }

    /// Summarize the active history if it is over the threshold. Failures
    /// are reported and the conversation proceeds unsummarized.
    pub async fn maybe_summarize(&mut self) -> bool {
        let history = self.store().active_history();
        if !self
            .trigger
            .should_summarize(history, self.config.model_max_tokens)
        {
            return false;
        }
        let Some(plan) = self.trigger.plan(history) else {
            return false;
        };

        tracing::info!(
            tokens_before = plan.tokens_before,
            messages = plan.messages.len(),
            "Summarizing conversation"
        );
        self.reconciler.emit(ChatUpdate::SummarizationStart {
            tokens_before: plan.tokens_before,
        });

        let (summary, outcome) = match self
            .trigger
            .summarize(self.summarizer.as_ref(), &plan)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Summarization failed, continuing without: {}", e);
                self.reconciler.emit(ChatUpdate::Error {
                    message: e.to_string(),
                });
                self.reconciler.emit(ChatUpdate::SummarizationEnd {
                    tokens_before: plan.tokens_before,
                    tokens_after: plan.tokens_before,
                });
                return false;
            }
        };

        let summary_id = summary.id.clone();
        if !self
            .reconciler
            .splice_summary(&plan.splice_after, summary.clone())
        {
            tracing::warn!(after = %plan.splice_after, "Summary anchor disappeared, dropping summary");
            return false;
        }

        let tokens_after = self.active_tokens();
        tracing::info!(
            tokens_before = plan.tokens_before,
            tokens_after,
            reported_before = outcome.token_count_before,
            reported_after = outcome.token_count_after,
            "Conversation summarized"
        );
        self.reconciler.emit(ChatUpdate::SummarizationEnd {
            tokens_before: plan.tokens_before,
            tokens_after,
        });

        match self
            .persistence
            .append(&self.config.conversation_id, &summary)
            .await
        {
            Ok(server_id) => {
                self.reconciler.rekey(&summary_id, &server_id);
            }
            Err(e) => tracing::warn!("Summary kept locally only: {}", e),
        }
        true
    }

    /// Remove every message after `message_id`, locally first, then in
    /// persistence. A failed persistence call restores the messages.
    pub async fn rollback_to(&mut self, message_id: &str) -> Result<()> {
        let target = self.resolve_known(message_id)?;
        self.cancel_pending();
        let Some(removed) = self.reconciler.truncate_after(&target) else {
            return Err(Error::Other(format!("Unknown message: {}", message_id)));
        };
        if removed.is_empty() {
            return Ok(());
        }
        self.sync_streaming();

        if let Err(e) = self
            .persistence
            .rollback_to(&self.config.conversation_id, &target)
            .await
        {
            tracing::warn!(message_id = %target, "Rollback failed, restoring: {}", e);
            self.reconciler.restore(removed);
            self.sync_streaming();
            return Err(Error::persistence(format!("roll back to {}", target), e));
        }

        tracing::info!(message_id = %target, removed = removed.messages.len(), "Rolled back");
        Ok(())
    }

    /// Replace a user message: it and everything after it are removed, then
    /// the new text is sent. Returns the server id of the new message.
    pub async fn edit(&mut self, message_id: &str, text: &str) -> Result<String> {
        let target = self.resolve_known(message_id)?;
        if self.store().get(&target).map(|m| m.role) != Some(Role::User) {
            return Err(Error::Other(format!(
                "Only user messages can be edited: {}",
                message_id
            )));
        }

        self.cancel_pending();
        let Some(mut removed) = self.reconciler.remove_from(&target) else {
            return Err(Error::Other(format!("Unknown message: {}", message_id)));
        };
        self.sync_streaming();

        let persisted = match removed.anchor.clone() {
            Some(anchor) => {
                self.persistence
                    .rollback_to(&self.config.conversation_id, &anchor)
                    .await
            }
            None => {
                let (deleted, result) = self.delete_all(&removed.messages).await;
                // already gone on the server, so they stay gone locally
                removed.messages.retain(|m| !deleted.contains(&m.id));
                result
            }
        };
        if let Err(e) = persisted {
            tracing::warn!(message_id = %target, "Edit failed, restoring: {}", e);
            self.reconciler.restore(removed);
            self.sync_streaming();
            return Err(Error::persistence(format!("edit message {}", target), e));
        }

        self.send(text).await
    }

    /// Delete messages one by one; returns the ids deleted before any
    /// failure along with the outcome
    async fn delete_all(&self, messages: &[Message]) -> (Vec<String>, Result<()>) {
        let mut deleted = vec![];
        for message in messages.iter().filter(|m| is_persisted(m)) {
            if let Err(e) = self
                .persistence
                .delete(&self.config.conversation_id, &message.id)
                .await
            {
                return (deleted, Err(e));
            }
            deleted.push(message.id.clone());
        }
        (deleted, Ok(()))
    }

    /// Re-run the request a message answered: roll back to before the user
    /// message and send its text again.
    pub async fn retry(&mut self, message_id: &str) -> Result<String> {
        let target = self.resolve_known(message_id)?;
        let store = self.store();
        let Some(index) = store.index_of(&target) else {
            return Err(Error::Other(format!("Unknown message: {}", message_id)));
        };
        let message = &store.messages()[index];

        let request = if message.role == Role::User {
            Some(message)
        } else {
            message
                .in_reply_to
                .as_deref()
                .and_then(|id| store.get(id))
                .filter(|m| m.role == Role::User)
                .or_else(|| {
                    store.messages()[..index]
                        .iter()
                        .rev()
                        .find(|m| m.role == Role::User && !m.is_summary)
                })
        };
        let Some(request) = request else {
            return Err(Error::Other(format!("Nothing to retry for {}", message_id)));
        };

        let (request_id, text) = (request.id.clone(), request.content.clone());
        tracing::info!(message_id = %target, request_id = %request_id, "Retrying");
        self.edit(&request_id, &text).await
    }

    fn resolve_known(&self, message_id: &str) -> Result<String> {
        match self.store().get(message_id) {
            Some(message) => Ok(message.id.clone()),
            None => Err(Error::Other(format!("Unknown message: {}", message_id))),
        }
    }
}

async fn next_item(connection: &mut Option<ConnectionHandle>) -> Option<ConnectionItem> {
    match connection {
        Some(handle) => handle.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
