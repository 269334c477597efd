//! Line-oriented rendering of conversation updates

use std::collections::HashSet;

use eddy_chat::{
    AgentActivity, ChatUpdate, ConnectionStatus, RegistryCache, Resolution, store::MessageStore,
};
use eddy_wire::{
    AgentProfile, DecisionAction, Message, MessageState, Role, Step, StepDetail, StepStatus,
};

/// Truncate a string to `max` characters, appending "..." if truncated.
/// Operates on Unicode char boundaries, not bytes.
pub fn truncate_chars(s: &str, max: usize) -> String {
    let mut chars = s.chars();
    let truncated: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}

/// Display name of a message's author
pub fn sender_label(message: &Message) -> String {
    match message.role {
        Role::User => "you".to_string(),
        Role::System => "system".to_string(),
        Role::Tool => "tool".to_string(),
        Role::Assistant => message
            .sender_name
            .clone()
            .or_else(|| message.sender_id.clone())
            .unwrap_or_else(|| "assistant".to_string()),
    }
}

fn silent_reason(message: &Message) -> Option<Option<&str>> {
    message.process_trace.iter().find_map(|step| match &step.detail {
        StepDetail::SubDecision {
            action: DecisionAction::Silent,
            reason,
            ..
        } => Some(reason.as_deref()),
        _ => None,
    })
}

/// Render a finished message under the given sender name
pub fn format_message(message: &Message, who: &str) -> String {
    if message.is_summary {
        return format!("[context summary] {}", truncate_chars(&message.content, 80));
    }
    if message.state == MessageState::Error {
        return format!(
            "{}: [failed: {}] {}",
            who,
            message.error.as_deref().unwrap_or("unknown error"),
            message.content
        );
    }
    if message.content.is_empty() {
        if let Some(reason) = silent_reason(message) {
            return match reason {
                Some(reason) => format!("[{} chose not to reply: {}]", who, reason),
                None => format!("[{} chose not to reply]", who),
            };
        }
    }

    let tools: Vec<String> = message
        .process_trace
        .iter()
        .filter_map(|step| match &step.detail {
            StepDetail::ToolCall { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect();
    if tools.is_empty() {
        format!("{}: {}", who, message.content)
    } else {
        format!("{}: [used {}] {}", who, tools.join(", "), message.content)
    }
}

/// One line per process step
pub fn format_step(step: &Step) -> String {
    let status = match step.status {
        StepStatus::Running => "running",
        StepStatus::Completed => "done",
        StepStatus::Error => "error",
    };
    match &step.detail {
        StepDetail::Thinking { text } => {
            format!("thinking ({}): {}", status, truncate_chars(text, 120))
        }
        StepDetail::ToolCall {
            name,
            arguments,
            blocks,
            ..
        } => {
            let mut line = format!("tool {} ({}) {}", name, status, truncate_chars(&arguments.to_string(), 80));
            let text: Vec<&str> = blocks.iter().filter_map(|b| b.as_text()).collect();
            if !text.is_empty() {
                line.push_str(&format!(" -> {}", truncate_chars(&text.join(" "), 80)));
            } else if !blocks.is_empty() {
                line.push_str(&format!(" -> {} media block(s)", blocks.len()));
            }
            line
        }
        StepDetail::SubDecision {
            agent_id,
            action,
            reason,
        } => {
            let action = match action {
                DecisionAction::Reply => "reply",
                DecisionAction::Silent => "stay silent",
            };
            match reason {
                Some(reason) => format!("{} decided to {}: {}", agent_id, action, reason),
                None => format!("{} decided to {}", agent_id, action),
            }
        }
    }
}

pub fn format_connection(status: &ConnectionStatus) -> Option<String> {
    Some(match status {
        ConnectionStatus::Connecting { attempt: 0 } => return None,
        ConnectionStatus::Connecting { attempt } => format!("[connecting, attempt {}]", attempt + 1),
        ConnectionStatus::Open => "[connected]".to_string(),
        ConnectionStatus::Reconnecting {
            attempt,
            delay_ms,
            error,
        } => format!(
            "[connection lost ({}), retry {} in {:.1}s]",
            error,
            attempt,
            *delay_ms as f64 / 1000.0
        ),
        ConnectionStatus::GaveUp { attempts } => format!(
            "[gave up reconnecting after {} attempts; restart eddy to retry]",
            attempts
        ),
        ConnectionStatus::Closed => "[disconnected]".to_string(),
    })
}

pub fn format_activity(agent: &str, activity: &AgentActivity) -> String {
    match activity {
        AgentActivity::Deciding { .. } => format!("{} is deciding whether to reply", agent),
        AgentActivity::Decided {
            action: DecisionAction::Reply,
            ..
        } => format!("{} will reply", agent),
        AgentActivity::Decided {
            action: DecisionAction::Silent,
            reason,
        } => match reason {
            Some(reason) => format!("{} will stay silent: {}", agent, reason),
            None => format!("{} will stay silent", agent),
        },
        AgentActivity::Executing { .. } => format!("{} is replying", agent),
        AgentActivity::Finished { .. } => format!("{} finished", agent),
    }
}

/// Turns updates into printable lines, printing each message once when it
/// settles
#[derive(Default)]
pub struct Printer {
    printed: HashSet<String>,
    announced: HashSet<String>,
    profiles: Option<RegistryCache<AgentProfile>>,
}

impl Printer {
    /// Name agents through the registry when messages carry only an id
    pub fn with_profiles(mut self, profiles: RegistryCache<AgentProfile>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    /// Registry name of an agent; starts the lookup on first use
    fn agent_name(&self, agent_id: &str) -> Option<String> {
        match self.profiles.as_ref()?.resolve(agent_id) {
            Resolution::Ready(profile) => profile.name,
            Resolution::Pending | Resolution::Unavailable => None,
        }
    }

    fn label(&self, message: &Message) -> String {
        let looked_up = match (&message.sender_id, &message.sender_name) {
            (Some(id), None) if message.role == Role::Assistant => self.agent_name(id),
            _ => None,
        };
        looked_up.unwrap_or_else(|| sender_label(message))
    }

    pub fn render(&mut self, update: &ChatUpdate, store: &MessageStore) -> Vec<String> {
        match update {
            ChatUpdate::MessageAdded { message } | ChatUpdate::MessageUpdated { message } => {
                self.render_message(message)
            }
            ChatUpdate::Rekeyed {
                client_id,
                server_id,
            } => {
                if self.printed.remove(client_id) {
                    self.printed.insert(server_id.clone());
                }
                vec![]
            }
            ChatUpdate::MessagesPrepended { ids, .. } => {
                let mut lines = vec![format!("[{} older messages]", ids.len())];
                for message in ids.iter().filter_map(|id| store.get(id)) {
                    self.printed.insert(message.id.clone());
                    if message.is_visible() {
                        lines.push(format_message(message, &self.label(message)));
                    }
                }
                lines.push("[end of older messages]".to_string());
                lines
            }
            ChatUpdate::MessagesRemoved { ids } => {
                for id in ids {
                    self.printed.remove(id);
                    self.announced.remove(id);
                }
                vec![format!("[removed {} message(s)]", ids.len())]
            }
            ChatUpdate::MessagesRestored { ids } => {
                vec![format!("[restored {} message(s)]", ids.len())]
            }
            ChatUpdate::ExecutionLog { entry, .. } => {
                if entry.is_thinking_placeholder() {
                    vec![]
                } else {
                    vec![format!("  [{}] {}", entry.kind, truncate_chars(&entry.text, 120))]
                }
            }
            ChatUpdate::AgentActivity {
                agent_id,
                activity: Some(activity @ (AgentActivity::Deciding { .. } | AgentActivity::Decided { .. })),
            } => {
                let name = self.agent_name(agent_id).unwrap_or_else(|| agent_id.clone());
                vec![format!("[{}]", format_activity(&name, activity))]
            }
            ChatUpdate::AgentActivity { .. } => vec![],
            ChatUpdate::StreamingStatus {
                agent_id,
                status: Some(status),
                ..
            } => vec![format!("[{}: {}]", agent_id, status)],
            ChatUpdate::StreamingStatus { .. } => vec![],
            ChatUpdate::Connection(status) => format_connection(status).into_iter().collect(),
            ChatUpdate::SummarizationStart { tokens_before } => {
                vec![format!("[Summarizing context (~{} tokens)]", tokens_before)]
            }
            ChatUpdate::SummarizationEnd {
                tokens_before,
                tokens_after,
            } => vec![format!(
                "[Summarized: ~{} -> ~{} tokens]",
                tokens_before, tokens_after
            )],
            ChatUpdate::Error { message } => vec![format!("Error: {}", message)],
        }
    }

    fn render_message(&mut self, message: &Message) -> Vec<String> {
        // the user already sees what they typed
        if message.role == Role::User && !message.is_summary {
            return vec![];
        }
        if message.is_streaming() {
            if self.announced.insert(message.id.clone()) {
                return vec![format!("[{} is typing]", self.label(message))];
            }
            return vec![];
        }
        if message.state.is_terminal() && self.printed.insert(message.id.clone()) {
            return vec![format_message(message, &self.label(message))];
        }
        vec![]
    }
}
