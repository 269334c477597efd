//! /status, /messages and /log - read-only views of the session

use eddy_chat::{ChatSession, ConnectionStatus, store::MessageStore};

use crate::ui::{format_activity, format_step, sender_label, truncate_chars};

pub fn status_message(session: &ChatSession) -> String {
    let config = session.config();
    let store = session.store();

    let mut output = String::from("Session Info\n");
    output.push_str(&"-".repeat(40));
    output.push('\n');

    let connection = match session.connection_status() {
        ConnectionStatus::Connecting { attempt } => format!("connecting (attempt {})", attempt + 1),
        ConnectionStatus::Open => "open".to_string(),
        ConnectionStatus::Reconnecting { attempt, .. } => format!("reconnecting (attempt {})", attempt),
        ConnectionStatus::GaveUp { attempts } => format!("gave up after {} attempts", attempts),
        ConnectionStatus::Closed => "closed".to_string(),
    };
    output.push_str(&format!("Conversation: {}\n", config.conversation_id));
    output.push_str(&format!("Model:        {}\n", config.model_id));
    output.push_str(&format!("Connection:   {}\n", connection));
    let streaming = if session.handle().is_streaming() { "yes" } else { "no" };
    output.push_str(&format!("Streaming:    {}\n", streaming));
    output.push('\n');

    output.push_str(&format!(
        "Messages:     {} loaded, {} shown\n",
        store.len(),
        store.visible().count()
    ));
    let history = if session.pager().is_loading() {
        "loading"
    } else if session.pager().has_more() {
        "older messages available (/older)"
    } else {
        "fully loaded"
    };
    output.push_str(&format!("History:      {}\n", history));
    output.push_str(&format!(
        "Context:      ~{} of {} tokens (summarized up to: {})\n",
        session.active_tokens(),
        config.model_max_tokens,
        store.summary_boundary().unwrap_or("none")
    ));

    let mut agents: Vec<_> = session.reconciler().agents().iter().collect();
    agents.sort_by_key(|(id, _)| *id);
    if !agents.is_empty() {
        output.push_str("\nAgents:\n");
        for (id, state) in agents {
            let name = state.name.as_deref().unwrap_or(id);
            output.push_str(&format!("  {}\n", format_activity(name, &state.activity)));
        }
    }
    output
}

pub fn messages_message(store: &MessageStore) -> String {
    if store.is_empty() {
        return "No messages loaded".to_string();
    }
    store
        .visible()
        .map(|m| {
            let state = match m.state {
                eddy_wire::MessageState::Pending => " (sending)",
                eddy_wire::MessageState::Thinking | eddy_wire::MessageState::Streaming => " (live)",
                eddy_wire::MessageState::Error => " (failed)",
                eddy_wire::MessageState::Done => "",
            };
            format!(
                "{:<24} {}{}: {}",
                m.id,
                sender_label(m),
                state,
                truncate_chars(&m.content.replace('\n', " "), 60)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn log_message(session: &ChatSession, id: &str) -> String {
    let Some(message) = session.store().get(id) else {
        return format!("Unknown message: {}", id);
    };

    let mut output = format!("Process of {} ({})\n", message.id, sender_label(message));
    if message.process_trace.is_empty() {
        output.push_str("  no steps\n");
    }
    for step in &message.process_trace {
        output.push_str(&format!("  {}\n", format_step(step)));
    }

    let live = session.reconciler().execution_log(id);
    let entries: Vec<_> = match live {
        Some(ring) if message.is_streaming() => ring.iter().collect(),
        _ => message.execution_log.iter().collect(),
    };
    if !entries.is_empty() {
        output.push_str("Execution log:\n");
        for entry in entries {
            output.push_str(&format!("  [{}] {}\n", entry.kind, entry.text));
        }
    }
    output
}
