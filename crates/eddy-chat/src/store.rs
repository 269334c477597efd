//! Canonical ordered message log of one conversation

use std::collections::{HashMap, HashSet};

use eddy_wire::{Message, MessageState, Reaction};

use crate::trace;

/// Outcome of [`MessageStore::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    Unchanged,
}

/// Messages taken out of the log by a rollback, with the position they
/// occupied, so a failed persistence call can put them back.
#[derive(Debug, Clone, Default)]
pub struct Removed {
    /// Id of the message the removed span followed (`None` = log start)
    pub anchor: Option<String>,
    pub messages: Vec<Message>,
}

impl Removed {
    pub fn ids(&self) -> Vec<String> {
        self.messages.iter().map(|m| m.id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Ordered, addressable message log.
///
/// Order is append-only except for explicit rollback, edit, abort and the
/// prepending of older history pages.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
    /// id -> position in `messages`, rebuilt on every structural change
    positions: HashMap<String, usize>,
    /// client-generated id -> server id
    aliases: HashMap<String, String>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// All messages in order, summaries included
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Messages the view should render
    pub fn visible(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.is_visible())
    }

    /// Resolve a possibly-stale client id to the current id
    pub fn resolve<'a>(&'a self, id: &'a str) -> &'a str {
        self.aliases.get(id).map(String::as_str).unwrap_or(id)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.positions.get(self.resolve(id)).copied()
    }

    fn reindex(&mut self) {
        self.positions = self
            .messages
            .iter()
            .enumerate()
            .map(|(idx, m)| (m.id.clone(), idx))
            .collect();
    }

    fn append(&mut self, message: Message) {
        self.positions.insert(message.id.clone(), self.messages.len());
        self.messages.push(message);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_of(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.index_of(id).map(|idx| &self.messages[idx])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.index_of(id).map(move |idx| &mut self.messages[idx])
    }

    /// Apply a change that reports whether it changed anything. Used on
    /// the per-chunk path, where cloning the message to compare is too slow.
    pub fn patch_with(&mut self, id: &str, f: impl FnOnce(&mut Message) -> bool) -> bool {
        self.get_mut(id).is_some_and(f)
    }

    /// Apply a change to one message; returns whether it changed
    pub fn patch(&mut self, id: &str, f: impl FnOnce(&mut Message)) -> bool {
        match self.get_mut(id) {
            Some(message) => {
                let before = message.clone();
                f(message);
                *message != before
            }
            None => false,
        }
    }

    /// Append a message; refused if the id is already present
    pub fn push(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.append(message);
        true
    }

    /// Insert or merge a message by id.
    ///
    /// The local trace is merged with the incoming one, so steps accumulated
    /// from chunks survive a `new_message` that carries fewer of them.
    pub fn upsert(&mut self, incoming: Message) -> Upsert {
        let Some(idx) = self.index_of(&incoming.id) else {
            self.append(incoming);
            return Upsert::Inserted;
        };

        let existing = &mut self.messages[idx];
        let before = existing.clone();
        merge_into(existing, incoming);
        if *existing == before {
            Upsert::Unchanged
        } else {
            Upsert::Updated
        }
    }

    /// Replace a client-generated id with the server-assigned one.
    ///
    /// If the server copy is already present the optimistic copy is folded
    /// into it and dropped.
    pub fn rekey(&mut self, client_id: &str, server_id: &str) -> bool {
        if client_id == server_id {
            return false;
        }
        let Some(idx) = self.positions.get(client_id).copied() else {
            return false;
        };

        if let Some(server_idx) = self.positions.get(server_id).copied() {
            let optimistic = self.messages.remove(idx);
            let server_idx = if server_idx > idx { server_idx - 1 } else { server_idx };
            let server = &mut self.messages[server_idx];
            if server.content.is_empty() {
                server.content = optimistic.content;
            }
            server.client_id = Some(client_id.to_string());
        } else {
            let message = &mut self.messages[idx];
            message.id = server_id.to_string();
            message.client_id = Some(client_id.to_string());
        }

        self.aliases
            .insert(client_id.to_string(), server_id.to_string());
        self.reindex();
        true
    }

    /// Add a reaction unless the same agent already reacted
    pub fn add_reaction(&mut self, id: &str, reaction: Reaction) -> bool {
        self.patch(id, |m| {
            if !m.reactions.iter().any(|r| r.from_agent_id == reaction.from_agent_id) {
                m.reactions.push(reaction);
            }
        })
    }

    /// Prepend an older page; ids already present, or repeated within the
    /// page, are skipped. Returns the ids actually inserted.
    pub fn prepend(&mut self, page: Vec<Message>) -> Vec<String> {
        let mut seen = HashSet::new();
        let fresh: Vec<Message> = page
            .into_iter()
            .filter(|m| !self.contains(&m.id) && seen.insert(m.id.clone()))
            .collect();
        let ids = fresh.iter().map(|m| m.id.clone()).collect();
        self.messages.splice(0..0, fresh);
        self.reindex();
        ids
    }

    /// Remove every message after `id`
    pub fn truncate_after(&mut self, id: &str) -> Option<Removed> {
        let idx = self.index_of(id)?;
        let removed = Removed {
            anchor: Some(self.messages[idx].id.clone()),
            messages: self.messages.split_off(idx + 1),
        };
        self.reindex();
        Some(removed)
    }

    /// Remove `id` and every message after it
    pub fn remove_from(&mut self, id: &str) -> Option<Removed> {
        let idx = self.index_of(id)?;
        let removed = Removed {
            anchor: idx.checked_sub(1).map(|prev| self.messages[prev].id.clone()),
            messages: self.messages.split_off(idx),
        };
        self.reindex();
        Some(removed)
    }

    /// Put back messages taken out by a rollback
    pub fn restore(&mut self, removed: Removed) {
        let at = match removed.anchor.as_deref() {
            Some(anchor) => self.index_of(anchor).map(|i| i + 1).unwrap_or(self.messages.len()),
            None => 0,
        };
        let fresh: Vec<Message> = removed
            .messages
            .into_iter()
            .filter(|m| !self.contains(&m.id))
            .collect();
        self.messages.splice(at..at, fresh);
        self.reindex();
    }

    /// Remove all messages that are still streaming
    pub fn strip_streaming(&mut self) -> Vec<String> {
        let (live, kept): (Vec<Message>, Vec<Message>) = std::mem::take(&mut self.messages)
            .into_iter()
            .partition(|m| m.is_streaming());
        self.messages = kept;
        self.reindex();
        live.into_iter().map(|m| m.id).collect()
    }

    /// Whether any message is still streaming
    pub fn has_streaming(&self) -> bool {
        self.messages.iter().any(|m| m.is_streaming())
    }

    /// The live message of a sender, if any
    pub fn streaming_for(&self, sender_id: &str) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_streaming() && m.is_from(sender_id))
    }

    /// First message from `agent_id` after the message it replied to
    pub fn next_from(&self, agent_id: &str, in_reply_to: Option<&str>) -> Option<&Message> {
        let start = match in_reply_to {
            Some(id) => self.index_of(id)? + 1,
            None => 0,
        };
        self.messages[start..].iter().find(|m| {
            m.is_from(agent_id)
                && match (in_reply_to, m.in_reply_to.as_deref()) {
                    (Some(target), Some(replied)) => self.resolve(replied) == self.resolve(target),
                    _ => true,
                }
        })
    }

    /// Insert a summary message right after `after_id`
    pub fn splice_summary(&mut self, after_id: &str, summary: Message) -> bool {
        if self.contains(&summary.id) {
            return false;
        }
        match self.index_of(after_id) {
            Some(idx) => {
                self.messages.insert(idx + 1, summary);
                self.reindex();
                true
            }
            None => false,
        }
    }

    /// Id of the latest summary, which bounds token accounting
    pub fn summary_boundary(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_summary)
            .map(|m| m.id.as_str())
    }

    /// The slice that goes to the model: the latest summary and everything
    /// after it, or the whole log when nothing has been summarized.
    pub fn active_history(&self) -> &[Message] {
        let start = self
            .messages
            .iter()
            .rposition(|m| m.is_summary)
            .unwrap_or(0);
        &self.messages[start..]
    }
}

fn merge_into(existing: &mut Message, incoming: Message) {
    // a late echo of a live state must not reopen a finished message
    if !(existing.state.is_terminal() && incoming.state.is_live()) {
        existing.state = incoming.state;
    }
    if !incoming.content.is_empty() {
        existing.content = incoming.content;
    }

    existing.process_trace = trace::merge(&existing.process_trace, &incoming.process_trace);

    if incoming.sender_id.is_some() {
        existing.sender_id = incoming.sender_id;
    }
    if incoming.sender_name.is_some() {
        existing.sender_name = incoming.sender_name;
    }
    if incoming.sender_avatar_ref.is_some() {
        existing.sender_avatar_ref = incoming.sender_avatar_ref;
    }
    if incoming.timestamp != 0 {
        existing.timestamp = incoming.timestamp;
    }
    if incoming.client_id.is_some() {
        existing.client_id = incoming.client_id;
    }
    if incoming.in_reply_to.is_some() {
        existing.in_reply_to = incoming.in_reply_to;
    }
    if !incoming.execution_log.is_empty() {
        existing.execution_log = incoming.execution_log;
    }
    if incoming.error.is_some() {
        existing.error = incoming.error;
    } else if existing.state != MessageState::Error {
        existing.error = None;
    }
    existing.is_summary |= incoming.is_summary;

    for reaction in incoming.reactions {
        if !existing
            .reactions
            .iter()
            .any(|r| r.from_agent_id == reaction.from_agent_id)
        {
            existing.reactions.push(reaction);
        }
    }
}
