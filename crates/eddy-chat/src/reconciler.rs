//! Stream reconciliation
//!
//! The reconciler is the only writer of the [`MessageStore`]. Server events
//! arrive through [`StreamReconciler::ingest`]; user-initiated mutations
//! (optimistic insert, rollback, abort, summary splice, page prepend) go
//! through the methods below so that every change is published as a
//! [`ChatUpdate`].
//!
//! Every event can be applied twice without effect: chunks are identified by
//! sequence number (or timestamp), traces merge idempotently, reactions are
//! de-duplicated, and ids removed by rollback are tombstoned.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::Instant,
};

use eddy_wire::{
    DecisionAction, ExecutionLogEntry, Message, MessageState, RawFrame, Role, Step, StreamChunk,
    StreamDone, StreamEvent,
};
use tokio::sync::broadcast;

use crate::{
    agents::AgentStateTable,
    events::ChatUpdate,
    store::{MessageStore, Removed, Upsert},
    trace,
};

/// Capacity of each message's execution-log ring
pub const EXECUTION_LOG_CAPACITY: usize = 100;

/// Prefix of placeholder messages synthesized for silent agents
pub const SILENT_PREFIX: &str = "silent-";

/// Identity of one applied chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ChunkKey {
    Thinking(ChunkId),
    Content(ChunkId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ChunkId {
    Seq(u64),
    At(i64),
}

/// Applies normalized server events to the message log
pub struct StreamReconciler {
    store: MessageStore,
    agents: AgentStateTable,
    /// Ids removed by rollback, edit or abort; late events for them are dropped
    tombstones: HashSet<String>,
    applied_chunks: HashMap<String, HashSet<ChunkKey>>,
    logs: HashMap<String, VecDeque<ExecutionLogEntry>>,
    update_tx: broadcast::Sender<ChatUpdate>,
}

impl Default for StreamReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamReconciler {
    pub fn new() -> Self {
        let (update_tx, _) = broadcast::channel(256);
        Self {
            store: MessageStore::new(),
            agents: AgentStateTable::new(),
            tombstones: HashSet::new(),
            applied_chunks: HashMap::new(),
            logs: HashMap::new(),
            update_tx,
        }
    }

    /// Subscribe to applied changes
    pub fn subscribe(&self) -> broadcast::Receiver<ChatUpdate> {
        self.update_tx.subscribe()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn agents(&self) -> &AgentStateTable {
        &self.agents
    }

    /// Live execution log of a streaming message
    pub fn execution_log(&self, message_id: &str) -> Option<&VecDeque<ExecutionLogEntry>> {
        self.logs.get(self.store.resolve(message_id))
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.contains(id)
    }

    pub(crate) fn emit(&self, update: ChatUpdate) {
        // no subscribers is fine
        let _ = self.update_tx.send(update);
    }

    fn emit_message(&self, id: &str, added: bool) {
        if let Some(message) = self.store.get(id) {
            let message = message.clone();
            self.emit(if added {
                ChatUpdate::MessageAdded { message }
            } else {
                ChatUpdate::MessageUpdated { message }
            });
        }
    }

    fn emit_agent(&self, agent_id: &str) {
        self.emit(ChatUpdate::AgentActivity {
            agent_id: agent_id.to_string(),
            activity: self.agents.activity(agent_id).cloned(),
        });
    }

    /// Normalize and apply one raw frame. Malformed frames are logged and
    /// skipped; they never interrupt the stream.
    pub fn ingest(&mut self, frame: &RawFrame, now: Instant) -> bool {
        match eddy_wire::normalize(frame) {
            Ok(event) => self.apply(event, now),
            Err(e) => {
                tracing::warn!(event = %frame.event, "Skipping malformed frame: {}", e);
                false
            }
        }
    }

    /// Apply a normalized event; returns whether anything changed
    pub fn apply(&mut self, event: StreamEvent, now: Instant) -> bool {
        if let Some(id) = event.message_id() {
            if self.tombstones.contains(id) {
                tracing::debug!(kind = event.kind(), message_id = id, "Dropping event for removed message");
                return false;
            }
        }

        match event {
            StreamEvent::NewMessage(message) => self.on_new_message(message),
            StreamEvent::AgentThinking(chunk) => self.on_chunk(chunk, true),
            StreamEvent::AgentStreamChunk(chunk) => self.on_chunk(chunk, false),
            StreamEvent::AgentStreamDone(done) => self.on_done(done, now),
            StreamEvent::AgentDeciding {
                agent_id,
                agent_name,
                in_reply_to,
            } => {
                let changed = self.agents.set_deciding(&agent_id, agent_name, in_reply_to);
                if changed {
                    self.emit_agent(&agent_id);
                }
                changed
            }
            StreamEvent::AgentDecision {
                agent_id,
                action,
                reason,
                ..
            } => {
                let changed = self.agents.set_decision(&agent_id, action, reason, now);
                if changed {
                    self.emit_agent(&agent_id);
                }
                changed
            }
            StreamEvent::AgentSilent {
                agent_id,
                agent_name,
                in_reply_to,
                reason,
                timestamp,
            } => self.on_silent(agent_id, agent_name, in_reply_to, reason, timestamp),
            StreamEvent::ExecutionLog {
                message_id,
                agent_id,
                entry,
            } => self.on_execution_log(message_id, agent_id, entry),
            StreamEvent::Reaction {
                message_id,
                reaction,
            } => {
                let changed = self.store.add_reaction(&message_id, reaction);
                if changed {
                    self.emit_message(&message_id, false);
                }
                changed
            }
            StreamEvent::AgentError {
                message_id,
                agent_id,
                error,
            } => self.on_error(message_id, agent_id, error, now),
            StreamEvent::Unknown { kind } => {
                tracing::debug!(kind = %kind, "Ignoring unknown event");
                false
            }
        }
    }

    fn on_new_message(&mut self, message: Message) -> bool {
        let id = message.id.clone();
        let mut changed = false;

        if let Some(client_id) = message.client_id.as_deref() {
            if self.tombstones.contains(client_id) {
                return false;
            }
            if self.store.rekey(client_id, &id) {
                self.move_keyed_state(client_id, &id);
                self.emit(ChatUpdate::Rekeyed {
                    client_id: client_id.to_string(),
                    server_id: id.clone(),
                });
                changed = true;
            }
        }

        if message.is_streaming() {
            if let Some(sender) = message.sender_id.clone() {
                self.finalize_previous(&sender, &id);
            }
        }

        match self.store.upsert(message) {
            Upsert::Inserted => {
                self.emit_message(&id, true);
                true
            }
            Upsert::Updated => {
                self.emit_message(&id, false);
                true
            }
            Upsert::Unchanged => {
                if changed {
                    self.emit_message(&id, false);
                }
                changed
            }
        }
    }

    fn move_keyed_state(&mut self, from: &str, to: &str) {
        if let Some(applied) = self.applied_chunks.remove(from) {
            self.applied_chunks.insert(to.to_string(), applied);
        }
        if let Some(log) = self.logs.remove(from) {
            self.logs.insert(to.to_string(), log);
        }
    }

    /// Close any other live message from the same sender
    fn finalize_previous(&mut self, sender_id: &str, except_id: &str) {
        let stale: Vec<String> = self
            .store
            .messages()
            .iter()
            .filter(|m| m.is_streaming() && m.is_from(sender_id) && m.id != except_id)
            .map(|m| m.id.clone())
            .collect();

        for id in stale {
            tracing::warn!(
                agent_id = sender_id,
                message_id = %id,
                "New stream from agent while previous one is open, finalizing previous"
            );
            self.store.patch(&id, |m| {
                m.state = MessageState::Done;
                trace::close_running(&mut m.process_trace, false);
            });
            self.seal_log(&id);
            self.applied_chunks.remove(&id);
            self.emit_message(&id, false);
        }
    }

    fn on_chunk(&mut self, chunk: StreamChunk, thinking: bool) -> bool {
        let id = self.store.resolve(&chunk.message_id).to_string();

        let chunk_id = chunk
            .seq
            .map(ChunkId::Seq)
            .or(chunk.timestamp.map(ChunkId::At));
        if let Some(chunk_id) = chunk_id {
            let key = if thinking {
                ChunkKey::Thinking(chunk_id)
            } else {
                ChunkKey::Content(chunk_id)
            };
            let already = self
                .applied_chunks
                .get(&id)
                .is_some_and(|applied| applied.contains(&key));
            if already {
                return false;
            }
            // a finished message keeps no chunk bookkeeping
            let finished = self.store.get(&id).is_some_and(|m| m.state.is_terminal());
            if !finished {
                self.applied_chunks.entry(id.clone()).or_default().insert(key);
            }
        }

        let added = !self.store.contains(&id);
        if added {
            if let Some(agent_id) = chunk.agent_id.as_deref() {
                self.finalize_previous(agent_id, &id);
            }
            let mut message = Message::new(id.clone(), Role::Assistant);
            message.state = MessageState::Thinking;
            message.in_reply_to = chunk.in_reply_to.clone();
            message.timestamp = chunk
                .timestamp
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
            if let Some(agent_id) = chunk.agent_id.clone() {
                message = message.from_sender(agent_id, chunk.agent_name.clone());
            }
            self.store.push(message);
        }

        let changed = self.store.patch_with(&id, |m| {
            let merged = trace::merge(&m.process_trace, &chunk.steps);
            let mut changed = merged != m.process_trace;
            m.process_trace = merged;
            if m.state.is_terminal() {
                // only late trace fragments are still accepted
                return changed;
            }

            if !thinking {
                if let Some(accumulated) = chunk.accumulated.as_deref() {
                    if m.content != accumulated {
                        m.content = accumulated.to_string();
                        changed = true;
                    }
                } else if let Some(delta) = chunk.delta.as_deref().filter(|d| !d.is_empty()) {
                    m.content.push_str(delta);
                    changed = true;
                }
            }
            let state = if m.content.is_empty() {
                MessageState::Thinking
            } else {
                MessageState::Streaming
            };
            changed |= m.state != state;
            m.state = state;
            changed
        });

        let mut agent_changed = false;
        if let Some(agent_id) = chunk.agent_id.as_deref() {
            let live = self.store.get(&id).is_some_and(|m| m.is_streaming());
            if live && self.agents.set_executing(agent_id, chunk.agent_name.clone(), &id) {
                self.emit_agent(agent_id);
                agent_changed = true;
            }
        }

        if added || changed {
            self.emit_message(&id, added);
            if let Some(m) = self.store.get(&id).filter(|m| m.is_streaming()) {
                if let Some(agent_id) = m.sender_id.clone() {
                    let status = if m.is_thinking() { "thinking" } else { "streaming" };
                    self.emit(ChatUpdate::StreamingStatus {
                        agent_id,
                        message_id: id.clone(),
                        status: Some(status.to_string()),
                    });
                }
            }
        }
        added || changed || agent_changed
    }

    /// Move the live execution-log ring into the message
    fn seal_log(&mut self, id: &str) {
        if let Some(ring) = self.logs.remove(id) {
            if !ring.is_empty() {
                self.store.patch(id, |m| {
                    if m.execution_log.is_empty() {
                        m.execution_log = ring.into_iter().collect();
                    }
                });
            }
        }
    }

    fn on_done(&mut self, done: StreamDone, now: Instant) -> bool {
        let id = self.store.resolve(&done.message_id).to_string();

        let added = !self.store.contains(&id);
        if added {
            let mut message = Message::new(id.clone(), Role::Assistant);
            message.timestamp = chrono::Utc::now().timestamp_millis();
            if let Some(agent_id) = done.agent_id.clone() {
                message = message.from_sender(agent_id, done.agent_name.clone());
            }
            self.store.push(message);
        }

        let failed = done.error.is_some();
        let mut changed = self.store.patch(&id, |m| {
            if let Some(content) = done.content {
                m.content = content;
            }
            m.process_trace = trace::merge(&m.process_trace, &done.steps);
            trace::close_running(&mut m.process_trace, failed);
            if !done.execution_log.is_empty() {
                m.execution_log = done.execution_log;
            }
            match done.error {
                Some(error) => {
                    m.state = MessageState::Error;
                    m.error = Some(error);
                }
                None if m.state != MessageState::Error => m.state = MessageState::Done,
                None => {}
            }
        });
        let log_len = self.store.get(&id).map(|m| m.execution_log.len()).unwrap_or(0);
        self.seal_log(&id);
        changed |= self.store.get(&id).map(|m| m.execution_log.len()).unwrap_or(0) != log_len;
        self.applied_chunks.remove(&id);

        let agent_id = done
            .agent_id
            .or_else(|| self.store.get(&id).and_then(|m| m.sender_id.clone()));
        if let Some(agent_id) = agent_id.as_deref() {
            if self.agents.finish(agent_id, &id, now) {
                self.emit_agent(agent_id);
                changed = true;
            }
        }

        if added || changed {
            self.emit_message(&id, added);
            if let Some(agent_id) = agent_id {
                self.emit(ChatUpdate::StreamingStatus {
                    agent_id,
                    message_id: id,
                    status: None,
                });
            }
        }
        added || changed
    }

    fn on_silent(
        &mut self,
        agent_id: String,
        agent_name: Option<String>,
        in_reply_to: Option<String>,
        reason: Option<String>,
        timestamp: i64,
    ) -> bool {
        if in_reply_to
            .as_deref()
            .is_some_and(|id| self.tombstones.contains(id))
        {
            return false;
        }

        let record = Step::decision(timestamp, agent_id.clone(), DecisionAction::Silent, reason);
        let agent_changed = self.agents.clear(&agent_id);
        if agent_changed {
            self.emit_agent(&agent_id);
        }

        let target = in_reply_to
            .as_deref()
            .and_then(|reply_to| self.store.next_from(&agent_id, Some(reply_to)))
            .map(|m| m.id.clone());

        let (id, added) = match target {
            Some(id) => (id, false),
            None => {
                let id = match in_reply_to.as_deref() {
                    Some(reply_to) => format!("{}{}-{}", SILENT_PREFIX, agent_id, reply_to),
                    None => format!("{}{}-{}", SILENT_PREFIX, agent_id, timestamp),
                };
                if self.tombstones.contains(&id) {
                    return agent_changed;
                }
                let mut placeholder = Message::new(id.clone(), Role::Assistant)
                    .from_sender(agent_id.clone(), agent_name);
                placeholder.in_reply_to = in_reply_to;
                placeholder.timestamp = timestamp;
                let added = self.store.push(placeholder);
                (id, added)
            }
        };

        let changed = self.store.patch(&id, |m| {
            m.process_trace = trace::merge(&m.process_trace, std::slice::from_ref(&record));
        });
        if added || changed {
            self.emit_message(&id, added);
        }
        added || changed || agent_changed
    }

    fn on_execution_log(
        &mut self,
        message_id: Option<String>,
        agent_id: Option<String>,
        entry: ExecutionLogEntry,
    ) -> bool {
        let target = match (message_id, agent_id) {
            (Some(id), _) => Some(self.store.resolve(&id).to_string()),
            (None, Some(agent)) => self.store.streaming_for(&agent).map(|m| m.id.clone()),
            (None, None) => None,
        };
        let Some(id) = target else {
            tracing::debug!("Execution log without a target message");
            return false;
        };
        if !self.store.get(&id).is_some_and(|m| m.is_streaming()) {
            // terminal logs arrive with stream_done
            return false;
        }

        let ring = self.logs.entry(id.clone()).or_default();
        if entry.is_thinking_placeholder()
            && ring.back().is_some_and(|last| last.is_thinking_placeholder())
        {
            match ring.back_mut() {
                Some(last) if *last != entry => *last = entry.clone(),
                _ => return false,
            }
        } else if ring.contains(&entry) {
            return false;
        } else {
            ring.push_back(entry.clone());
            while ring.len() > EXECUTION_LOG_CAPACITY {
                ring.pop_front();
            }
        }

        self.emit(ChatUpdate::ExecutionLog {
            message_id: id,
            entry,
        });
        true
    }

    fn on_error(
        &mut self,
        message_id: String,
        agent_id: Option<String>,
        error: String,
        now: Instant,
    ) -> bool {
        let id = self.store.resolve(&message_id).to_string();
        let added = !self.store.contains(&id);
        if added {
            let mut message = Message::new(id.clone(), Role::Assistant);
            message.timestamp = chrono::Utc::now().timestamp_millis();
            if let Some(agent_id) = agent_id.clone() {
                message = message.from_sender(agent_id, None);
            }
            self.store.push(message);
        }

        let changed = self.store.patch(&id, |m| {
            m.state = MessageState::Error;
            m.error = Some(error.clone());
            trace::close_running(&mut m.process_trace, true);
        });
        self.seal_log(&id);
        self.applied_chunks.remove(&id);

        if added || changed {
            tracing::warn!(message_id = %id, "Message failed: {}", error);
            self.emit_message(&id, added);
            let agent_id = agent_id.or_else(|| self.store.get(&id).and_then(|m| m.sender_id.clone()));
            if let Some(agent_id) = agent_id {
                if self.agents.finish(&agent_id, &id, now) {
                    self.emit_agent(&agent_id);
                }
                self.emit(ChatUpdate::StreamingStatus {
                    agent_id,
                    message_id: id,
                    status: None,
                });
            }
        }
        added || changed
    }

    /// Prune ephemeral indicators whose deadline passed
    pub fn expire(&mut self, now: Instant) -> bool {
        let expired = self.agents.expire(now);
        for agent_id in &expired {
            self.emit(ChatUpdate::AgentActivity {
                agent_id: agent_id.clone(),
                activity: None,
            });
        }
        !expired.is_empty()
    }

    /// Earliest ephemeral deadline, for the owner's timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.agents.next_deadline()
    }

    // --- Local mutations ---

    /// Insert a message created by the client before the server knows it
    pub fn insert_optimistic(&mut self, message: Message) -> bool {
        let id = message.id.clone();
        let inserted = self.store.push(message);
        if inserted {
            self.emit_message(&id, true);
        }
        inserted
    }

    /// Re-key an optimistic message once the server assigned its id
    pub fn rekey(&mut self, client_id: &str, server_id: &str) -> bool {
        let changed = self.store.rekey(client_id, server_id);
        if changed {
            self.move_keyed_state(client_id, server_id);
            self.emit(ChatUpdate::Rekeyed {
                client_id: client_id.to_string(),
                server_id: server_id.to_string(),
            });
        }
        changed
    }

    /// Apply a local change to one message and publish it
    pub fn patch(&mut self, id: &str, f: impl FnOnce(&mut Message)) -> bool {
        let changed = self.store.patch(id, f);
        if changed {
            self.emit_message(self.store.resolve(id).to_string().as_str(), false);
        }
        changed
    }

    fn forget(&mut self, removed: &[String]) {
        for id in removed {
            self.applied_chunks.remove(id);
            self.logs.remove(id);
            for agent_id in self.agents.clear_message(id) {
                self.emit(ChatUpdate::AgentActivity {
                    agent_id,
                    activity: None,
                });
            }
            self.tombstones.insert(id.clone());
        }
    }

    fn forget_removed(&mut self, removed: &Removed) {
        let mut ids = removed.ids();
        ids.extend(removed.messages.iter().filter_map(|m| m.client_id.clone()));
        self.forget(&ids);
        if !removed.is_empty() {
            self.emit(ChatUpdate::MessagesRemoved { ids: removed.ids() });
        }
    }

    /// Remove everything after `id`; `None` if the id is unknown
    pub fn truncate_after(&mut self, id: &str) -> Option<Removed> {
        let removed = self.store.truncate_after(id)?;
        self.forget_removed(&removed);
        Some(removed)
    }

    /// Remove `id` and everything after it
    pub fn remove_from(&mut self, id: &str) -> Option<Removed> {
        let removed = self.store.remove_from(id)?;
        self.forget_removed(&removed);
        Some(removed)
    }

    /// Undo a removal after a failed persistence call
    pub fn restore(&mut self, removed: Removed) {
        let ids = removed.ids();
        for m in &removed.messages {
            self.tombstones.remove(&m.id);
            if let Some(client_id) = &m.client_id {
                self.tombstones.remove(client_id);
            }
        }
        self.store.restore(removed);
        self.emit(ChatUpdate::MessagesRestored { ids });
    }

    /// Drop every streaming message (abort)
    pub fn strip_streaming(&mut self) -> Vec<String> {
        let stripped = self.store.strip_streaming();
        if !stripped.is_empty() {
            self.forget(&stripped);
            for id in &stripped {
                tracing::debug!(message_id = %id, "Stripped streaming message");
            }
            self.emit(ChatUpdate::MessagesRemoved {
                ids: stripped.clone(),
            });
        }
        stripped
    }

    /// Prepend an older page; returns the anchor for viewport restoration
    pub fn prepend_page(&mut self, page: Vec<Message>) -> Option<String> {
        let anchor = self.store.visible().next().map(|m| m.id.clone());
        let page: Vec<Message> = page
            .into_iter()
            .filter(|m| !self.tombstones.contains(&m.id))
            .collect();
        let ids = self.store.prepend(page);
        if !ids.is_empty() {
            self.emit(ChatUpdate::MessagesPrepended {
                ids,
                anchor: anchor.clone(),
            });
        }
        anchor
    }

    /// Insert a summary right after `after_id`
    pub fn splice_summary(&mut self, after_id: &str, summary: Message) -> bool {
        let id = summary.id.clone();
        let spliced = self.store.splice_summary(after_id, summary);
        if spliced {
            self.emit_message(&id, true);
        }
        spliced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentActivity;
    use eddy_wire::{StepDetail, StepKind, StepStatus, THINKING_PLACEHOLDER};
    use serde_json::json;
    use std::time::Duration;

    fn frame(event: &str, data: serde_json::Value) -> RawFrame {
        RawFrame::new(event, data.to_string())
    }

    fn chunk(id: &str, seq: u64, delta: &str) -> RawFrame {
        frame(
            "agent_stream_chunk",
            json!({"messageId": id, "agentId": "a1", "agentName": "Ada", "delta": delta, "seq": seq}),
        )
    }

    fn ids(r: &StreamReconciler) -> Vec<String> {
        r.store().messages().iter().map(|m| m.id.clone()).collect()
    }

    fn script() -> Vec<RawFrame> {
        vec![
            frame("agent_deciding", json!({"agentId": "a1", "inReplyTo": "u1"})),
            frame("agent_decision", json!({"agentId": "a1", "decision": "reply"})),
            frame(
                "agent_thinking",
                json!({"messageId": "m1", "agentId": "a1", "inReplyTo": "u1",
                       "processSteps": [{"type": "thinking", "timestamp": 10, "content": "plan"}]}),
            ),
            frame(
                "execution_log",
                json!({"messageId": "m1", "log": {"logType": "thinking", "content": THINKING_PLACEHOLDER, "timestamp": 11}}),
            ),
            chunk("m1", 1, "Hel"),
            chunk("m1", 2, "lo"),
            frame(
                "agent_stream_chunk",
                json!({"messageId": "m1", "agentId": "a1", "seq": 3, "delta": "!",
                       "processSteps": [{"type": "tool_call", "timestamp": 20, "name": "search", "toolCallId": "c1"}]}),
            ),
            frame("reaction", json!({"messageId": "u1", "fromAgentId": "a2"})),
            frame(
                "agent_stream_done",
                json!({"messageId": "m1", "agentId": "a1",
                       "processSteps": [{"type": "tool_call", "timestamp": 20, "name": "search", "toolCallId": "c1", "result": "ok"}]}),
            ),
        ]
    }

    fn seeded() -> StreamReconciler {
        let mut r = StreamReconciler::new();
        r.insert_optimistic(Message::assistant("u1", "question"));
        r
    }

    #[test]
    fn test_full_stream_lifecycle() {
        let mut r = seeded();
        let now = Instant::now();
        for f in script() {
            r.ingest(&f, now);
        }

        let m = r.store().get("m1").unwrap();
        assert_eq!(m.content, "Hello!");
        assert_eq!(m.state, MessageState::Done);
        assert_eq!(m.sender_id.as_deref(), Some("a1"));
        assert_eq!(m.in_reply_to.as_deref(), Some("u1"));
        assert_eq!(m.process_trace.len(), 2);
        assert!(m.process_trace.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(m.execution_log.len(), 1);
        assert!(r.execution_log("m1").is_none());
        assert_eq!(r.store().get("u1").unwrap().reactions.len(), 1);

        assert!(matches!(
            r.agents().activity("a1"),
            Some(AgentActivity::Finished { .. })
        ));
        r.expire(now + Duration::from_secs(2));
        assert!(r.agents().activity("a1").is_none());
    }

    #[test]
    fn test_reapplying_every_event_is_a_no_op() {
        let mut r = seeded();
        let now = Instant::now();
        for f in script() {
            r.ingest(&f, now);
            let snapshot = r.store().messages().to_vec();
            assert!(!r.ingest(&f, now), "second application changed state: {}", f.event);
            assert_eq!(r.store().messages(), snapshot.as_slice());
        }

        // replaying the whole stream after completion changes nothing either
        let snapshot = r.store().messages().to_vec();
        for f in script() {
            r.ingest(&f, now);
        }
        assert_eq!(r.store().messages(), snapshot.as_slice());
    }

    #[test]
    fn test_accumulated_wins_over_local_concatenation() {
        let mut r = StreamReconciler::new();
        let now = Instant::now();
        r.ingest(&chunk("m1", 1, "Hel"), now);
        r.ingest(
            &frame(
                "agent_stream_chunk",
                json!({"messageId": "m1", "seq": 2, "delta": "XX", "accumulated": "Hello"}),
            ),
            now,
        );
        assert_eq!(r.store().get("m1").unwrap().content, "Hello");
    }

    #[test]
    fn test_state_machine_thinking_then_streaming() {
        let mut r = StreamReconciler::new();
        let now = Instant::now();
        r.ingest(
            &frame("agent_thinking", json!({"messageId": "m1", "agentId": "a1"})),
            now,
        );
        assert!(r.store().get("m1").unwrap().is_thinking());
        r.ingest(&chunk("m1", 1, "x"), now);
        let m = r.store().get("m1").unwrap();
        assert!(!m.is_thinking());
        assert!(m.is_streaming());
    }

    #[test]
    fn test_thinking_clears_deciding() {
        let mut r = StreamReconciler::new();
        let now = Instant::now();
        r.ingest(&frame("agent_deciding", json!({"agentId": "a1"})), now);
        assert!(matches!(
            r.agents().activity("a1"),
            Some(AgentActivity::Deciding { .. })
        ));
        r.ingest(
            &frame("agent_thinking", json!({"messageId": "m1", "agentId": "a1"})),
            now,
        );
        assert!(matches!(
            r.agents().activity("a1"),
            Some(AgentActivity::Executing { .. })
        ));
    }

    #[test]
    fn test_decision_removed_after_two_seconds() {
        let mut r = StreamReconciler::new();
        let now = Instant::now();
        r.ingest(
            &frame("agent_decision", json!({"agentId": "a1", "decision": "reply"})),
            now,
        );
        assert_eq!(r.next_deadline(), Some(now + Duration::from_secs(2)));
        assert!(!r.expire(now + Duration::from_millis(500)));
        assert!(r.expire(now + Duration::from_secs(2)));
        assert!(r.agents().activity("a1").is_none());
    }

    #[test]
    fn test_one_stream_per_sender() {
        let mut r = StreamReconciler::new();
        let now = Instant::now();
        r.ingest(&chunk("m1", 1, "first"), now);
        r.ingest(&chunk("m2", 1, "second"), now);

        assert_eq!(r.store().get("m1").unwrap().state, MessageState::Done);
        assert!(r.store().get("m2").unwrap().is_streaming());
        let live: Vec<_> = r.store().messages().iter().filter(|m| m.is_streaming()).collect();
        assert_eq!(live.len(), 1);
    }

    #[test]
    fn test_chunks_without_identity_append() {
        let mut r = StreamReconciler::new();
        let now = Instant::now();
        let f = frame("agent_stream_chunk", json!({"messageId": "m1", "delta": "ab"}));
        r.ingest(&f, now);
        r.ingest(&f, now);
        assert_eq!(r.store().get("m1").unwrap().content, "abab");
    }

    #[test]
    fn test_chunk_timestamp_is_identity_without_seq() {
        let mut r = StreamReconciler::new();
        let now = Instant::now();
        let f = frame(
            "agent_stream_chunk",
            json!({"messageId": "m1", "delta": "ab", "timestamp": 1000}),
        );
        r.ingest(&f, now);
        r.ingest(&f, now);
        assert_eq!(r.store().get("m1").unwrap().content, "ab");
    }

    #[test]
    fn test_silent_attaches_to_next_message_from_agent() {
        let mut r = seeded();
        let now = Instant::now();
        r.ingest(
            &frame(
                "new_message",
                json!({"id": "m1", "senderId": "a1", "content": "reply", "inReplyTo": "u1"}),
            ),
            now,
        );
        r.ingest(
            &frame(
                "agent_silent",
                json!({"agentId": "a1", "inReplyTo": "u1", "reason": "nothing new", "timestamp": 30}),
            ),
            now,
        );

        assert_eq!(ids(&r), vec!["u1", "m1"]);
        let trace = &r.store().get("m1").unwrap().process_trace;
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].kind(), StepKind::SubDecision);
    }

    #[test]
    fn test_silent_synthesizes_single_placeholder() {
        let mut r = seeded();
        let now = Instant::now();
        let silent = frame(
            "agent_silent",
            json!({"agentId": "a2", "agentName": "Bo", "inReplyTo": "u1", "reason": "covered", "timestamp": 40}),
        );
        r.ingest(&silent, now);
        r.ingest(&silent, now);

        assert_eq!(ids(&r), vec!["u1", "silent-a2-u1"]);
        let placeholder = r.store().get("silent-a2-u1").unwrap();
        assert!(placeholder.content.is_empty());
        assert_eq!(placeholder.state, MessageState::Done);
        assert!(placeholder.is_from("a2"));
        assert_eq!(placeholder.process_trace.len(), 1);
        match &placeholder.process_trace[0].detail {
            StepDetail::SubDecision { action, reason, .. } => {
                assert_eq!(*action, DecisionAction::Silent);
                assert_eq!(reason.as_deref(), Some("covered"));
            }
            other => panic!("unexpected detail: {:?}", other),
        }
    }

    #[test]
    fn test_execution_log_placeholder_updates_in_place() {
        let mut r = StreamReconciler::new();
        let now = Instant::now();
        r.ingest(&chunk("m1", 1, "x"), now);
        for ts in 1..=5 {
            r.ingest(
                &frame(
                    "execution_log",
                    json!({"messageId": "m1", "logType": "thinking", "content": THINKING_PLACEHOLDER, "timestamp": ts}),
                ),
                now,
            );
        }
        let ring = r.execution_log("m1").unwrap();
        assert_eq!(ring.len(), 1);
        assert_eq!(ring[0].timestamp, 5);
    }

    #[test]
    fn test_execution_log_ring_is_bounded() {
        let mut r = StreamReconciler::new();
        let now = Instant::now();
        r.ingest(&chunk("m1", 1, "x"), now);
        for i in 0..150 {
            r.ingest(
                &frame(
                    "execution_log",
                    json!({"messageId": "m1", "logType": "info", "content": format!("line {}", i), "timestamp": i}),
                ),
                now,
            );
        }
        let ring = r.execution_log("m1").unwrap();
        assert_eq!(ring.len(), EXECUTION_LOG_CAPACITY);
        assert_eq!(ring.front().unwrap().text, "line 50");
    }

    #[test]
    fn test_rekey_on_server_echo() {
        let mut r = StreamReconciler::new();
        let now = Instant::now();
        r.insert_optimistic(Message::user("tmp-1", "hi"));
        r.ingest(
            &frame(
                "new_message",
                json!({"id": "srv-1", "role": "user", "content": "hi", "clientId": "tmp-1"}),
            ),
            now,
        );
        assert_eq!(ids(&r), vec!["srv-1"]);
        assert_eq!(r.store().get("srv-1").unwrap().state, MessageState::Done);
    }

    #[test]
    fn test_events_for_rolled_back_ids_are_dropped() {
        let mut r = seeded();
        let now = Instant::now();
        r.ingest(&chunk("m1", 1, "partial"), now);
        let removed = r.truncate_after("u1").unwrap();
        assert_eq!(removed.ids(), vec!["m1".to_string()]);

        assert!(!r.ingest(&chunk("m1", 2, " more"), now));
        assert!(!r.ingest(
            &frame("agent_stream_done", json!({"messageId": "m1"})),
            now
        ));
        assert_eq!(ids(&r), vec!["u1"]);
    }

    #[test]
    fn test_restore_lifts_tombstones() {
        let mut r = seeded();
        let now = Instant::now();
        r.ingest(&chunk("m1", 1, "partial"), now);
        let removed = r.truncate_after("u1").unwrap();
        r.restore(removed);
        assert!(!r.is_tombstoned("m1"));
        r.ingest(&chunk("m1", 2, " more"), now);
        assert_eq!(r.store().get("m1").unwrap().content, "partial more");
    }

    #[test]
    fn test_agent_error_marks_message() {
        let mut r = StreamReconciler::new();
        let now = Instant::now();
        r.ingest(&chunk("m1", 1, "par"), now);
        r.ingest(
            &frame("agent_error", json!({"messageId": "m1", "agentId": "a1", "error": "quota"})),
            now,
        );
        let m = r.store().get("m1").unwrap();
        assert_eq!(m.state, MessageState::Error);
        assert_eq!(m.error.as_deref(), Some("quota"));
        assert!(!m.is_streaming());
    }

    #[test]
    fn test_done_with_error_marks_running_steps_failed() {
        let mut r = StreamReconciler::new();
        let now = Instant::now();
        r.ingest(
            &frame(
                "agent_thinking",
                json!({"messageId": "m1", "steps": [{"type": "tool_call", "timestamp": 5, "name": "fetch"}]}),
            ),
            now,
        );
        r.ingest(
            &frame("agent_stream_done", json!({"messageId": "m1", "error": "tool crashed"})),
            now,
        );
        let m = r.store().get("m1").unwrap();
        assert_eq!(m.state, MessageState::Error);
        assert_eq!(m.process_trace[0].status, StepStatus::Error);
    }

    #[test]
    fn test_strip_streaming_publishes_removal() {
        let mut r = seeded();
        let mut rx = r.subscribe();
        let now = Instant::now();
        r.ingest(&chunk("m1", 1, "x"), now);
        assert_eq!(r.strip_streaming(), vec!["m1".to_string()]);

        let mut removed = None;
        while let Ok(update) = rx.try_recv() {
            if let ChatUpdate::MessagesRemoved { ids } = update {
                removed = Some(ids);
            }
        }
        assert_eq!(removed, Some(vec!["m1".to_string()]));
        assert!(r.agents().activity("a1").is_none());
    }

    #[test]
    fn test_streaming_status_is_scoped_per_agent() {
        let mut r = StreamReconciler::new();
        let mut rx = r.subscribe();
        let now = Instant::now();
        r.ingest(&chunk("m1", 1, "x"), now);
        r.ingest(
            &frame("agent_stream_done", json!({"messageId": "m1", "agentId": "a1"})),
            now,
        );

        let statuses: Vec<Option<String>> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|u| match u {
                ChatUpdate::StreamingStatus { agent_id, status, .. } if agent_id == "a1" => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![Some("streaming".to_string()), None]);
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let mut r = StreamReconciler::new();
        assert!(!r.ingest(&RawFrame::new("agent_stream_chunk", "{oops"), Instant::now()));
        assert!(r.store().is_empty());
    }
}
