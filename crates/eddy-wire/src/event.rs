//! Raw server frames and their normalization into canonical stream events
//!
//! The backend emits loosely-typed JSON with optional fields and
//! backward-compatible aliases (`processSteps` vs `processMessages`,
//! camelCase vs snake_case ids). Everything past [`normalize`] sees only
//! [`StreamEvent`].

use serde_json::Value;

use crate::{
    error::{Error, Result},
    types::{
        DecisionAction, ExecutionLogEntry, Message, MessageState, Reaction, Role, SUMMARY_MARKER,
        Step, StepDetail, StepStatus,
    },
};

/// A frame as delivered by the transport, before any interpretation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// SSE event name (`message` when the server did not set one)
    pub event: String,
    /// JSON payload
    pub data: String,
}

impl RawFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

/// Payload shared by `agent_thinking` and `agent_stream_chunk`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamChunk {
    pub message_id: String,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub in_reply_to: Option<String>,
    /// Text to append to the local body
    pub delta: Option<String>,
    /// Server-side accumulated body; wins over local concatenation
    pub accumulated: Option<String>,
    pub steps: Vec<Step>,
    /// Per-message chunk sequence number
    pub seq: Option<u64>,
    pub timestamp: Option<i64>,
}

/// Payload of `agent_stream_done`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamDone {
    pub message_id: String,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    /// Final body, if the server sends it
    pub content: Option<String>,
    pub steps: Vec<Step>,
    pub execution_log: Vec<ExecutionLogEntry>,
    pub error: Option<String>,
}

/// Canonical event shape consumed by the reconciler
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    NewMessage(Message),
    AgentThinking(StreamChunk),
    AgentStreamChunk(StreamChunk),
    AgentStreamDone(StreamDone),
    AgentDeciding {
        agent_id: String,
        agent_name: Option<String>,
        in_reply_to: Option<String>,
    },
    AgentDecision {
        agent_id: String,
        action: DecisionAction,
        reason: Option<String>,
        in_reply_to: Option<String>,
    },
    AgentSilent {
        agent_id: String,
        agent_name: Option<String>,
        in_reply_to: Option<String>,
        reason: Option<String>,
        timestamp: i64,
    },
    ExecutionLog {
        message_id: Option<String>,
        agent_id: Option<String>,
        entry: ExecutionLogEntry,
    },
    Reaction {
        message_id: String,
        reaction: Reaction,
    },
    /// The backend reported a terminal error for one message
    AgentError {
        message_id: String,
        agent_id: Option<String>,
        error: String,
    },
    /// Heartbeats and kinds this client does not know
    Unknown { kind: String },
}

impl StreamEvent {
    /// Canonical event kind name
    pub fn kind(&self) -> &str {
        match self {
            StreamEvent::NewMessage(_) => "new_message",
            StreamEvent::AgentThinking(_) => "agent_thinking",
            StreamEvent::AgentStreamChunk(_) => "agent_stream_chunk",
            StreamEvent::AgentStreamDone(_) => "agent_stream_done",
            StreamEvent::AgentDeciding { .. } => "agent_deciding",
            StreamEvent::AgentDecision { .. } => "agent_decision",
            StreamEvent::AgentSilent { .. } => "agent_silent",
            StreamEvent::ExecutionLog { .. } => "execution_log",
            StreamEvent::Reaction { .. } => "reaction",
            StreamEvent::AgentError { .. } => "agent_error",
            StreamEvent::Unknown { kind } => kind.as_str(),
        }
    }

    /// Id of the message this event targets, if it names one
    pub fn message_id(&self) -> Option<&str> {
        match self {
            StreamEvent::NewMessage(m) => Some(m.id.as_str()),
            StreamEvent::AgentThinking(c) | StreamEvent::AgentStreamChunk(c) => {
                Some(c.message_id.as_str())
            }
            StreamEvent::AgentStreamDone(d) => Some(d.message_id.as_str()),
            StreamEvent::ExecutionLog { message_id, .. } => message_id.as_deref(),
            StreamEvent::Reaction { message_id, .. } | StreamEvent::AgentError { message_id, .. } => {
                Some(message_id.as_str())
            }
            _ => None,
        }
    }
}

// --- Field access ---

const MESSAGE_ID: &[&str] = &["messageId", "message_id", "id"];
const AGENT_ID: &[&str] = &["agentId", "agent_id", "senderId", "sender_id"];
const AGENT_NAME: &[&str] = &["agentName", "agent_name", "senderName", "sender_name"];
const IN_REPLY_TO: &[&str] = &[
    "inReplyTo",
    "in_reply_to",
    "replyTo",
    "reply_to",
    "triggerMessageId",
    "trigger_message_id",
];
const STEPS: &[&str] = &[
    "processSteps",
    "process_steps",
    "processMessages",
    "process_messages",
    "processTrace",
    "process_trace",
    "steps",
];
const TIMESTAMP: &[&str] = &["timestamp", "ts", "time", "createdAt", "created_at"];

/// Alias-aware view over a JSON object
struct Fields<'a>(&'a Value);

impl<'a> Fields<'a> {
    fn get(&self, keys: &[&str]) -> Option<&'a Value> {
        keys.iter()
            .find_map(|k| self.0.get(*k).filter(|v| !v.is_null()))
    }

    fn string(&self, keys: &[&str]) -> Option<String> {
        match self.get(keys)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn require(&self, keys: &[&str], what: &str) -> Result<String> {
        self.string(keys)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::UnexpectedResponse(format!("missing {}", what)))
    }

    fn bool(&self, keys: &[&str]) -> Option<bool> {
        self.get(keys).and_then(|v| v.as_bool())
    }

    fn u64(&self, keys: &[&str]) -> Option<u64> {
        match self.get(keys)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Milliseconds since the epoch; accepts integers, floats and RFC 3339 strings
    fn timestamp(&self, keys: &[&str]) -> Option<i64> {
        match self.get(keys)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.parse::<i64>().ok().or_else(|| {
                chrono::DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.timestamp_millis())
            }),
            _ => None,
        }
    }

    fn steps(&self) -> Vec<Step> {
        match self.get(STEPS) {
            Some(Value::Array(items)) => items.iter().filter_map(normalize_step).collect(),
            _ => vec![],
        }
    }
}

// --- Normalization ---

/// Turn a raw frame into a canonical event.
///
/// The event kind comes from the SSE event name, or from the payload's
/// `type`/`event` field when the server used the default `message` event.
pub fn normalize(frame: &RawFrame) -> Result<StreamEvent> {
    let value: Value = serde_json::from_str(&frame.data)?;

    let named = !frame.event.is_empty() && frame.event != "message";
    let (kind, payload) = if named {
        (frame.event.clone(), &value)
    } else {
        let fields = Fields(&value);
        match fields.string(&["type", "event", "kind"]) {
            Some(kind) => {
                let payload = match value.get("data") {
                    Some(data @ Value::Object(_)) => data,
                    _ => &value,
                };
                (kind, payload)
            }
            // Untyped frames carrying a full message are message upserts
            None if value.get("role").is_some() => ("new_message".to_string(), &value),
            None => return Ok(StreamEvent::Unknown {
                kind: String::new(),
            }),
        }
    };

    normalize_payload(&kind, payload)
}

fn normalize_payload(kind: &str, payload: &Value) -> Result<StreamEvent> {
    let f = Fields(payload);

    let event = match kind {
        "new_message" | "message_created" | "message" => {
            let inner = match payload.get("message") {
                Some(m @ Value::Object(_)) => m,
                _ => payload,
            };
            StreamEvent::NewMessage(normalize_message(inner)?)
        }
        "agent_thinking" | "thinking" => StreamEvent::AgentThinking(normalize_chunk(&f)?),
        "agent_stream_chunk" | "stream_chunk" | "chunk" => {
            StreamEvent::AgentStreamChunk(normalize_chunk(&f)?)
        }
        "agent_stream_done" | "stream_done" | "done" => StreamEvent::AgentStreamDone(StreamDone {
            message_id: f.require(MESSAGE_ID, "message id")?,
            agent_id: f.string(AGENT_ID),
            agent_name: f.string(AGENT_NAME),
            content: f.string(&[
                "content",
                "finalContent",
                "final_content",
                "accumulated",
                "accumulatedContent",
            ]),
            steps: f.steps(),
            execution_log: match f.get(&["executionLog", "execution_log", "logs"]) {
                Some(Value::Array(items)) => items.iter().filter_map(normalize_log_entry).collect(),
                _ => vec![],
            },
            error: f.string(&["error", "errorMessage", "error_message"]),
        }),
        "agent_deciding" | "deciding" => StreamEvent::AgentDeciding {
            agent_id: f.require(AGENT_ID, "agent id")?,
            agent_name: f.string(AGENT_NAME),
            in_reply_to: f.string(IN_REPLY_TO),
        },
        "agent_decision" | "decision" => StreamEvent::AgentDecision {
            agent_id: f.require(AGENT_ID, "agent id")?,
            action: decision_action(&f)?,
            reason: f.string(&["reason", "rationale"]),
            in_reply_to: f.string(IN_REPLY_TO),
        },
        "agent_silent" | "silent" => StreamEvent::AgentSilent {
            agent_id: f.require(AGENT_ID, "agent id")?,
            agent_name: f.string(AGENT_NAME),
            in_reply_to: f
                .string(IN_REPLY_TO)
                .or_else(|| f.string(&["messageId", "message_id"])),
            reason: f.string(&["reason", "rationale"]),
            timestamp: f.timestamp(TIMESTAMP).unwrap_or(0),
        },
        "execution_log" | "log" => {
            let entry_value = match payload.get("log").or_else(|| payload.get("entry")) {
                Some(v @ Value::Object(_)) => v,
                _ => payload,
            };
            let entry = normalize_log_entry(entry_value)
                .ok_or_else(|| Error::UnexpectedResponse("execution log without text".into()))?;
            StreamEvent::ExecutionLog {
                message_id: f.string(&["messageId", "message_id"]),
                agent_id: f.string(AGENT_ID),
                entry,
            }
        }
        "reaction" | "like" | "message_liked" => StreamEvent::Reaction {
            message_id: f.require(&["messageId", "message_id", "targetId", "target_id"], "message id")?,
            reaction: Reaction {
                from_agent_id: f.require(
                    &["fromAgentId", "from_agent_id", "agentId", "agent_id", "from"],
                    "reacting agent",
                )?,
                from_agent_name: f.string(&["fromAgentName", "from_agent_name", "agentName", "agent_name"]),
                timestamp: f.timestamp(TIMESTAMP).unwrap_or(0),
            },
        },
        "agent_error" | "stream_error" | "error" => StreamEvent::AgentError {
            message_id: f.require(MESSAGE_ID, "message id")?,
            agent_id: f.string(AGENT_ID),
            error: f
                .string(&["error", "message", "errorMessage", "error_message"])
                .unwrap_or_else(|| "unknown error".to_string()),
        },
        other => StreamEvent::Unknown {
            kind: other.to_string(),
        },
    };

    Ok(event)
}

fn normalize_chunk(f: &Fields<'_>) -> Result<StreamChunk> {
    Ok(StreamChunk {
        message_id: f.require(MESSAGE_ID, "message id")?,
        agent_id: f.string(AGENT_ID),
        agent_name: f.string(AGENT_NAME),
        in_reply_to: f.string(IN_REPLY_TO),
        delta: f.string(&["delta", "chunk", "text", "content"]),
        accumulated: f.string(&[
            "accumulated",
            "accumulatedContent",
            "accumulated_content",
            "fullContent",
            "full_content",
        ]),
        steps: f.steps(),
        seq: f.u64(&["seq", "sequence", "chunkIndex", "chunk_index"]),
        timestamp: f.timestamp(TIMESTAMP),
    })
}

fn decision_action(f: &Fields<'_>) -> Result<DecisionAction> {
    if let Some(action) = f
        .string(&["decision", "action", "result"])
        .and_then(|s| DecisionAction::parse(&s))
    {
        return Ok(action);
    }
    match f.bool(&["shouldReply", "should_reply", "willReply", "will_reply"]) {
        Some(true) => Ok(DecisionAction::Reply),
        Some(false) => Ok(DecisionAction::Silent),
        None => Err(Error::UnexpectedResponse("decision without action".into())),
    }
}

/// Normalize a message object from a stream event or a history page
pub fn normalize_message(value: &Value) -> Result<Message> {
    let f = Fields(value);
    let id = f.require(MESSAGE_ID, "message id")?;

    let sender_id = f.string(AGENT_ID);
    let role = f
        .string(&["role"])
        .and_then(|r| Role::parse(&r))
        .unwrap_or(if sender_id.is_some() {
            Role::Assistant
        } else {
            Role::User
        });

    let content = f.string(&["content", "text"]).unwrap_or_default();
    let error = f.string(&["error", "errorMessage", "error_message"]);

    let state = if error.is_some() {
        MessageState::Error
    } else if f.bool(&["isStreaming", "is_streaming"]).unwrap_or(false) {
        if content.is_empty() {
            MessageState::Thinking
        } else {
            MessageState::Streaming
        }
    } else {
        MessageState::Done
    };

    let mut message = Message::new(id, role);
    message.content = content;
    message.state = state;
    message.error = error;
    message.sender_name = f.string(AGENT_NAME);
    message.sender_avatar_ref = f
        .string(&["senderAvatarRef", "sender_avatar_ref", "avatarRef", "avatar_ref"])
        .or_else(|| sender_id.clone());
    message.sender_id = sender_id;
    message.process_trace = f.steps();
    // summaries are persisted as plain user content wrapped in a marker
    message.is_summary = f
        .bool(&["isSummary", "is_summary"])
        .unwrap_or_else(|| role == Role::User && message.content.starts_with(SUMMARY_MARKER));
    message.timestamp = f.timestamp(TIMESTAMP).unwrap_or(0);
    message.client_id = f.string(&["clientId", "client_id", "tempId", "temp_id"]);
    message.in_reply_to = f.string(IN_REPLY_TO);
    message.reactions = match f.get(&["reactions", "likes"]) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                let rf = Fields(item);
                Some(Reaction {
                    from_agent_id: rf.string(&["fromAgentId", "from_agent_id", "agentId", "agent_id"])?,
                    from_agent_name: rf.string(&["fromAgentName", "from_agent_name", "agentName"]),
                    timestamp: rf.timestamp(TIMESTAMP).unwrap_or(0),
                })
            })
            .collect(),
        _ => vec![],
    };
    message.execution_log = match f.get(&["executionLog", "execution_log"]) {
        Some(Value::Array(items)) => items.iter().filter_map(normalize_log_entry).collect(),
        _ => vec![],
    };

    Ok(message)
}

/// Normalize one process step; returns `None` for unknown step kinds
pub fn normalize_step(value: &Value) -> Option<Step> {
    let f = Fields(value);
    let kind = f.string(&["type", "kind", "stepType", "step_type"])?;
    let timestamp = f.timestamp(TIMESTAMP).unwrap_or(0);
    let step_id = f.string(&[
        "stepId",
        "step_id",
        "toolCallId",
        "tool_call_id",
        "callId",
        "call_id",
        "id",
    ]);
    let status = f.string(&["status", "state"]).and_then(|s| StepStatus::parse(&s));

    let (detail, default_status) = match kind.as_str() {
        "thinking" | "think" | "reasoning" => (
            StepDetail::Thinking {
                text: f.string(&["content", "text", "thinking"]).unwrap_or_default(),
            },
            StepStatus::Running,
        ),
        "tool_call" | "toolCall" | "tool" | "tool_use" | "function_call" => {
            let result = f.get(&["result", "output", "toolResult", "tool_result"]).cloned();
            let default_status = if result.is_some() {
                StepStatus::Completed
            } else {
                StepStatus::Running
            };
            (
                StepDetail::ToolCall {
                    name: f
                        .string(&["name", "toolName", "tool_name", "tool"])
                        .unwrap_or_default(),
                    arguments: f
                        .get(&["arguments", "args", "input", "params"])
                        .cloned()
                        .unwrap_or(Value::Null),
                    result,
                    blocks: vec![],
                },
                default_status,
            )
        }
        "sub_decision" | "subDecision" | "decision" | "agent_decision" => {
            let action = f
                .string(&["decision", "action", "result"])
                .and_then(|s| DecisionAction::parse(&s))?;
            (
                StepDetail::SubDecision {
                    agent_id: f.string(AGENT_ID).unwrap_or_default(),
                    action,
                    reason: f.string(&["reason", "rationale", "content"]),
                },
                StepStatus::Completed,
            )
        }
        _ => return None,
    };

    Some(Step {
        step_id,
        timestamp,
        status: status.unwrap_or(default_status),
        detail,
    })
}

fn normalize_log_entry(value: &Value) -> Option<ExecutionLogEntry> {
    let f = Fields(value);
    let text = f.string(&["content", "text", "message"])?;
    Some(ExecutionLogEntry {
        kind: f
            .string(&["logType", "log_type", "kind", "level", "category"])
            .unwrap_or_else(|| "info".to_string()),
        text,
        timestamp: f.timestamp(TIMESTAMP).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StepKind, THINKING_PLACEHOLDER};
    use serde_json::json;

    fn frame(event: &str, data: serde_json::Value) -> RawFrame {
        RawFrame::new(event, data.to_string())
    }

    #[test]
    fn test_named_event_uses_sse_event_name() {
        let event = normalize(&frame(
            "agent_stream_chunk",
            json!({"messageId": "m1", "agentId": "a1", "delta": "Hel", "seq": 1}),
        ))
        .unwrap();
        match event {
            StreamEvent::AgentStreamChunk(chunk) => {
                assert_eq!(chunk.message_id, "m1");
                assert_eq!(chunk.agent_id.as_deref(), Some("a1"));
                assert_eq!(chunk.delta.as_deref(), Some("Hel"));
                assert_eq!(chunk.seq, Some(1));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_default_event_reads_type_and_data() {
        let event = normalize(&frame(
            "message",
            json!({"type": "agent_deciding", "data": {"agent_id": "a2", "agent_name": "Bo"}}),
        ))
        .unwrap();
        assert_eq!(
            event,
            StreamEvent::AgentDeciding {
                agent_id: "a2".into(),
                agent_name: Some("Bo".into()),
                in_reply_to: None,
            }
        );
    }

    #[test]
    fn test_step_list_aliases_are_equivalent() {
        let steps = json!([{"type": "thinking", "timestamp": 10, "content": "hmm"}]);
        let a = normalize(&frame(
            "agent_thinking",
            json!({"messageId": "m1", "processSteps": steps.clone()}),
        ))
        .unwrap();
        let b = normalize(&frame(
            "agent_thinking",
            json!({"message_id": "m1", "processMessages": steps}),
        ))
        .unwrap();
        assert_eq!(a, b);
        if let StreamEvent::AgentThinking(chunk) = a {
            assert_eq!(chunk.steps.len(), 1);
            assert_eq!(chunk.steps[0].kind(), StepKind::Thinking);
        } else {
            panic!("expected thinking event");
        }
    }

    #[test]
    fn test_tool_step_status_defaults_from_result() {
        let running = normalize_step(&json!({"type": "tool_call", "timestamp": 1, "name": "search"})).unwrap();
        assert_eq!(running.status, StepStatus::Running);

        let done = normalize_step(&json!({
            "type": "tool", "timestamp": 1, "toolName": "search", "toolCallId": "c1", "result": "ok"
        }))
        .unwrap();
        assert_eq!(done.status, StepStatus::Completed);
        assert_eq!(done.step_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_unknown_step_kind_is_dropped() {
        assert!(normalize_step(&json!({"type": "banner", "timestamp": 1})).is_none());
    }

    #[test]
    fn test_rfc3339_timestamp() {
        let step = normalize_step(&json!({
            "type": "thinking", "timestamp": "1970-01-01T00:00:01Z", "text": "x"
        }))
        .unwrap();
        assert_eq!(step.timestamp, 1000);
    }

    #[test]
    fn test_new_message_wrapped_and_streaming_flags() {
        let event = normalize(&frame(
            "new_message",
            json!({"message": {
                "id": "srv-1", "role": "user", "content": "hi", "clientId": "tmp-1"
            }}),
        ))
        .unwrap();
        match event {
            StreamEvent::NewMessage(m) => {
                assert_eq!(m.id, "srv-1");
                assert_eq!(m.role, Role::User);
                assert_eq!(m.client_id.as_deref(), Some("tmp-1"));
                assert_eq!(m.state, MessageState::Done);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let msg = normalize_message(&json!({
            "id": "m2", "senderId": "a1", "isStreaming": true, "content": ""
        }))
        .unwrap();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.state, MessageState::Thinking);
        assert_eq!(msg.sender_avatar_ref.as_deref(), Some("a1"));
    }

    #[test]
    fn test_persisted_summary_is_recognized() {
        let msg = normalize_message(&json!({
            "id": "s1", "role": "user",
            "content": "<context-summary>\nearlier turns\n</context-summary>"
        }))
        .unwrap();
        assert!(msg.is_summary);
        assert!(!msg.is_visible());

        let quoted = normalize_message(&json!({
            "id": "m3", "role": "user", "isSummary": false,
            "content": "<context-summary> is a tag"
        }))
        .unwrap();
        assert!(!quoted.is_summary);
    }

    #[test]
    fn test_decision_from_boolean() {
        let event = normalize(&frame(
            "agent_decision",
            json!({"agentId": "a1", "shouldReply": false, "reason": "nothing to add"}),
        ))
        .unwrap();
        assert!(matches!(
            event,
            StreamEvent::AgentDecision { action: DecisionAction::Silent, .. }
        ));
    }

    #[test]
    fn test_execution_log_entry() {
        let event = normalize(&frame(
            "execution_log",
            json!({"messageId": "m1", "log": {"logType": "thinking", "content": THINKING_PLACEHOLDER, "timestamp": 4}}),
        ))
        .unwrap();
        match event {
            StreamEvent::ExecutionLog { message_id, entry, .. } => {
                assert_eq!(message_id.as_deref(), Some("m1"));
                assert!(entry.is_thinking_placeholder());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_is_unknown() {
        let event = normalize(&frame("ping", json!({}))).unwrap();
        assert_eq!(event, StreamEvent::Unknown { kind: "ping".into() });
    }

    #[test]
    fn test_missing_id_is_error() {
        let err = normalize(&frame("agent_stream_chunk", json!({"delta": "x"}))).unwrap_err();
        assert!(matches!(err, Error::UnexpectedResponse(_)));
    }

    #[test]
    fn test_malformed_json_is_error() {
        let err = normalize(&RawFrame::new("agent_stream_chunk", "{not json")).unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }
}
