//! Mock collaborators shared by the unit tests

use std::{collections::VecDeque, time::Duration};

use async_stream::stream;
use async_trait::async_trait;
use eddy_wire::{Message, Page};
use parking_lot::Mutex;

use crate::{
    backend::{PersistenceApi, SummaryOutcome, Summarizer},
    error::{Error, Result},
    transport::{EventTransport, SignalStream, TransportSignal},
};

/// Plays back one scripted signal list per connect call, then refuses
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Vec<TransportSignal>>>,
    pub connects: Mutex<u32>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Vec<TransportSignal>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            connects: Mutex::new(0),
        }
    }
}

#[async_trait]
impl EventTransport for ScriptedTransport {
    async fn connect(&self, _conversation_id: &str) -> Result<SignalStream> {
        *self.connects.lock() += 1;
        let Some(script) = self.scripts.lock().pop_front() else {
            return Err(Error::Transport("connection refused".into()));
        };
        Ok(Box::pin(stream! {
            for signal in script {
                yield signal;
            }
        }))
    }
}

/// In-memory persistence serving pages from a fixed history
#[derive(Default)]
pub struct MockPersistence {
    pub history: Mutex<Vec<Message>>,
    pub appended: Mutex<Vec<Message>>,
    pub rollbacks: Mutex<Vec<String>>,
    pub deletes: Mutex<Vec<String>>,
    /// Fail every mutating call
    pub fail: Mutex<bool>,
    /// Fail deletes once this many have succeeded
    pub fail_deletes_after: Mutex<Option<usize>>,
    pub page_delay: Mutex<Duration>,
}

impl MockPersistence {
    pub fn with_history(history: Vec<Message>) -> Self {
        Self {
            history: Mutex::new(history),
            ..Default::default()
        }
    }

    fn check(&self, operation: &str) -> Result<()> {
        if *self.fail.lock() {
            Err(Error::Other(format!("{} refused", operation)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PersistenceApi for MockPersistence {
    async fn fetch_page(
        &self,
        _conversation_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Page> {
        let delay = *self.page_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let history = self.history.lock();
        let end = match before {
            Some(id) => history.iter().position(|m| m.id == id).unwrap_or(0),
            None => history.len(),
        };
        let start = end.saturating_sub(limit);
        Ok(Page {
            messages: history[start..end].to_vec(),
            has_more: start > 0,
        })
    }

    async fn append(&self, _conversation_id: &str, message: &Message) -> Result<String> {
        self.check("append")?;
        let mut appended = self.appended.lock();
        appended.push(message.clone());
        Ok(format!("srv-{}", appended.len()))
    }

    async fn delete(&self, _conversation_id: &str, message_id: &str) -> Result<()> {
        self.check("delete")?;
        let mut deletes = self.deletes.lock();
        if self.fail_deletes_after.lock().is_some_and(|n| deletes.len() >= n) {
            return Err(Error::Other(format!("delete {} refused", message_id)));
        }
        deletes.push(message_id.to_string());
        Ok(())
    }

    async fn rollback_to(&self, _conversation_id: &str, message_id: &str) -> Result<()> {
        self.check("rollback")?;
        self.rollbacks.lock().push(message_id.to_string());
        Ok(())
    }
}

/// Summarizer returning a fixed text and recording what it was asked
#[derive(Default)]
pub struct MockSummarizer {
    pub calls: Mutex<Vec<Vec<String>>>,
    pub fail: Mutex<bool>,
}

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn summarize(&self, messages: &[Message], _model_id: &str) -> Result<SummaryOutcome> {
        self.calls
            .lock()
            .push(messages.iter().map(|m| m.id.clone()).collect());
        if *self.fail.lock() {
            return Err(Error::Summarization("summarizer unavailable".into()));
        }
        Ok(SummaryOutcome {
            summary_text: format!("{} earlier messages", messages.len()),
            token_count_before: 0,
            token_count_after: 0,
        })
    }
}
