//! Automatic context summarization
//!
//! When the active history approaches the model's context window, the part
//! of it the model has already answered is condensed by an external
//! summarizer. The summary is spliced into the log right after the last
//! summarized message and becomes the new token-accounting boundary; the
//! messages it replaces stay visible.

use eddy_wire::{Message, Role};

use crate::{
    backend::{SummaryOutcome, Summarizer},
    error::{Error, Result},
    tokens,
};

/// Configuration for automatic summarization
#[derive(Debug, Clone)]
pub struct SummarizationConfig {
    /// Whether summarization is enabled
    pub enabled: bool,
    /// Summarize once the estimate exceeds `model_max_tokens - safety_margin`
    pub safety_margin: u32,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            safety_margin: 1000,
        }
    }
}

/// What to summarize and where the result goes
#[derive(Debug, Clone)]
pub struct SummaryPlan {
    /// Messages handed to the summarizer, oldest first
    pub messages: Vec<Message>,
    /// The summary is inserted right after this message
    pub splice_after: String,
    /// Estimate of the active history before summarizing
    pub tokens_before: u32,
}

/// Decides when to summarize and what
#[derive(Debug, Clone)]
pub struct SummarizationTrigger {
    config: SummarizationConfig,
    model_id: String,
}

impl SummarizationTrigger {
    pub fn new(model_id: impl Into<String>, config: SummarizationConfig) -> Self {
        Self {
            config,
            model_id: model_id.into(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn threshold(&self, model_max_tokens: u32) -> u32 {
        model_max_tokens.saturating_sub(self.config.safety_margin)
    }

    /// Whether the active history is over the threshold
    pub fn should_summarize(&self, active_history: &[Message], model_max_tokens: u32) -> bool {
        self.config.enabled
            && tokens::estimate(active_history, &self.model_id) > self.threshold(model_max_tokens)
    }

    /// Pick the span to summarize: the active history minus the newest
    /// unanswered user message. `None` while anything is still streaming or
    /// when there is nothing new to condense.
    pub fn plan(&self, active_history: &[Message]) -> Option<SummaryPlan> {
        if active_history.iter().any(|m| m.is_streaming()) {
            return None;
        }

        let span = match active_history.split_last() {
            Some((last, rest)) if last.role == Role::User && !last.is_summary => rest,
            _ => active_history,
        };
        if span.iter().all(|m| m.is_summary) {
            return None;
        }

        let splice_after = span.last()?.id.clone();
        let messages = span
            .iter()
            .filter(|m| m.is_summary || !m.content.is_empty())
            .cloned()
            .collect();

        Some(SummaryPlan {
            messages,
            splice_after,
            tokens_before: tokens::estimate(active_history, &self.model_id),
        })
    }

    /// Run the external summarizer and build the summary message
    pub async fn summarize(
        &self,
        summarizer: &dyn Summarizer,
        plan: &SummaryPlan,
    ) -> Result<(Message, SummaryOutcome)> {
        let outcome = summarizer
            .summarize(&plan.messages, &self.model_id)
            .await
            .map_err(|e| match e {
                Error::Summarization(_) => e,
                other => Error::Summarization(other.to_string()),
            })?;

        if outcome.summary_text.trim().is_empty() {
            return Err(Error::Summarization("summarizer returned an empty summary".into()));
        }

        let id = format!("summary-{}", uuid::Uuid::new_v4());
        Ok((Message::summary(id, &outcome.summary_text), outcome))
    }
}
