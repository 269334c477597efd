//! Core types for conversations

use serde::{Deserialize, Serialize};

/// Opening tag of a persisted summary
pub const SUMMARY_MARKER: &str = "<context-summary>";

/// Text the backend re-emits while token-by-token thinking is in progress.
pub const THINKING_PLACEHOLDER: &str = "思考中...";

/// Message roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    /// Parse a role string, accepting the aliases the backend uses
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "user" | "human" => Some(Role::User),
            "assistant" | "agent" | "ai" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "tool" | "tool_result" | "function" => Some(Role::Tool),
            _ => None,
        }
    }

    /// Get the role as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

/// Lifecycle state of a message.
///
/// `is_streaming`/`is_thinking` are projections of this state, never stored
/// separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Inserted optimistically by the client, not yet acknowledged
    Pending,
    /// Streaming with an empty body; only the trace is growing
    Thinking,
    /// Streaming with a non-empty body
    Streaming,
    /// Finalized, immutable
    #[default]
    Done,
    /// The backend reported a terminal error for this message
    Error,
}

impl MessageState {
    /// Whether the message may still be mutated by stream events
    pub fn is_live(&self) -> bool {
        matches!(self, MessageState::Thinking | MessageState::Streaming)
    }

    /// Whether the message has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageState::Done | MessageState::Error)
    }
}

/// Status of a single process step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Running,
    Completed,
    Error,
}

impl StepStatus {
    /// Ordering used to absorb `running -> completed|error` transitions
    pub fn rank(&self) -> u8 {
        match self {
            StepStatus::Running => 0,
            StepStatus::Completed => 1,
            StepStatus::Error => 2,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "running" | "pending" | "in_progress" | "started" => Some(StepStatus::Running),
            "completed" | "complete" | "done" | "success" | "succeeded" | "finished" => {
                Some(StepStatus::Completed)
            }
            "error" | "failed" | "failure" => Some(StepStatus::Error),
            _ => None,
        }
    }
}

/// Discriminant of a step, part of its merge key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Thinking,
    ToolCall,
    SubDecision,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Thinking => "thinking",
            StepKind::ToolCall => "tool_call",
            StepKind::SubDecision => "sub_decision",
        }
    }
}

/// What an agent decided when asked whether to reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Reply,
    Silent,
}

impl DecisionAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reply" | "respond" | "speak" | "answer" => Some(DecisionAction::Reply),
            "silent" | "skip" | "pass" | "ignore" => Some(DecisionAction::Silent),
            _ => None,
        }
    }
}

/// Typed display block parsed out of a tool result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    Video {
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    Audio {
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

impl ContentBlock {
    /// Create a text block
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Get text if this is a text block
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Kind-specific payload of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepDetail {
    Thinking {
        #[serde(default)]
        text: String,
    },
    ToolCall {
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        /// Display blocks derived from `result`
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        blocks: Vec<ContentBlock>,
    },
    SubDecision {
        agent_id: String,
        action: DecisionAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// One entry of a message's process trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Server-assigned id, preferred merge key when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(flatten)]
    pub detail: StepDetail,
}

impl Step {
    /// Create a thinking step
    pub fn thinking(timestamp: i64, text: impl Into<String>) -> Self {
        Self {
            step_id: None,
            timestamp,
            status: StepStatus::Running,
            detail: StepDetail::Thinking { text: text.into() },
        }
    }

    /// Create a running tool-call step
    pub fn tool_call(timestamp: i64, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            step_id: None,
            timestamp,
            status: StepStatus::Running,
            detail: StepDetail::ToolCall {
                name: name.into(),
                arguments,
                result: None,
                blocks: vec![],
            },
        }
    }

    /// Create a completed sub-decision step
    pub fn decision(
        timestamp: i64,
        agent_id: impl Into<String>,
        action: DecisionAction,
        reason: Option<String>,
    ) -> Self {
        Self {
            step_id: None,
            timestamp,
            status: StepStatus::Completed,
            detail: StepDetail::SubDecision {
                agent_id: agent_id.into(),
                action,
                reason,
            },
        }
    }

    /// Attach a server-assigned step id
    pub fn with_id(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Set the status
    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }

    /// Attach a tool result (no-op for other step kinds)
    pub fn with_result(mut self, value: serde_json::Value) -> Self {
        if let StepDetail::ToolCall { result, .. } = &mut self.detail {
            *result = Some(value);
        }
        self
    }

    /// The kind of this step
    pub fn kind(&self) -> StepKind {
        match self.detail {
            StepDetail::Thinking { .. } => StepKind::Thinking,
            StepDetail::ToolCall { .. } => StepKind::ToolCall,
            StepDetail::SubDecision { .. } => StepKind::SubDecision,
        }
    }
}

/// A like from an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub from_agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_agent_name: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

/// One line of an agent's execution log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    /// Log category (`thinking`, `tool_call`, `info`, ...)
    pub kind: String,
    pub text: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl ExecutionLogEntry {
    pub fn new(kind: impl Into<String>, text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            kind: kind.into(),
            text: text.into(),
            timestamp,
        }
    }

    /// Whether this is the repeatedly re-emitted "thinking..." line
    pub fn is_thinking_placeholder(&self) -> bool {
        self.kind == "thinking" && self.text == THINKING_PLACEHOLDER
    }
}

/// The unit of conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub state: MessageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Key into the avatar cache, never the avatar itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar_ref: Option<String>,
    #[serde(default)]
    pub process_trace: Vec<Step>,
    #[serde(default)]
    pub is_summary: bool,
    #[serde(default)]
    pub timestamp: i64,
    /// Client-generated id this message carried before the server assigned one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    /// Terminal execution log, persisted when the stream completes
    #[serde(default)]
    pub execution_log: Vec<ExecutionLogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    /// Create a bare message with the given id and role
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            content: String::new(),
            state: MessageState::Done,
            sender_id: None,
            sender_name: None,
            sender_avatar_ref: None,
            process_trace: vec![],
            is_summary: false,
            timestamp: 0,
            client_id: None,
            in_reply_to: None,
            reactions: vec![],
            execution_log: vec![],
            error: None,
        }
    }

    /// Create an optimistic user message
    pub fn user(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            content: text.into(),
            state: MessageState::Pending,
            timestamp: chrono::Utc::now().timestamp_millis(),
            ..Self::new(id, Role::User)
        }
    }

    /// Create a finalized assistant message
    pub fn assistant(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            content: text.into(),
            ..Self::new(id, Role::Assistant)
        }
    }

    /// Create a summary message. It goes over the wire as user content.
    pub fn summary(id: impl Into<String>, summary: &str) -> Self {
        Self {
            content: format!("{}\n{}\n</context-summary>", SUMMARY_MARKER, summary),
            is_summary: true,
            timestamp: chrono::Utc::now().timestamp_millis(),
            ..Self::new(id, Role::User)
        }
    }

    /// Set the sender; the avatar reference is keyed by sender id
    pub fn from_sender(mut self, sender_id: impl Into<String>, sender_name: Option<String>) -> Self {
        let sender_id = sender_id.into();
        self.sender_avatar_ref = Some(sender_id.clone());
        self.sender_id = Some(sender_id);
        self.sender_name = sender_name;
        self
    }

    /// Projection: streaming while thinking or producing content
    pub fn is_streaming(&self) -> bool {
        self.state.is_live()
    }

    /// Projection: thinking-only phase
    pub fn is_thinking(&self) -> bool {
        self.state == MessageState::Thinking
    }

    /// Whether this message should be rendered
    pub fn is_visible(&self) -> bool {
        !self.is_summary
    }

    /// Whether this message has a sender matching `agent_id`
    pub fn is_from(&self, agent_id: &str) -> bool {
        self.sender_id.as_deref() == Some(agent_id)
    }
}
