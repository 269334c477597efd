//! Slash commands for interactive mode

mod status;

pub use status::{log_message, messages_message, status_message};

use eddy_chat::ChatSession;

/// Result of executing a slash command
#[derive(Debug, PartialEq)]
pub enum CommandResult {
    /// Show a message to the user (not sent to the conversation)
    Message(String),
    /// Fetch the next older page of history
    LoadOlder,
    /// Abort every stream in progress
    Abort,
    /// Remove everything after a message
    Rollback(String),
    /// Replace a user message and resend
    Edit { message_id: String, text: String },
    /// Re-run the request a message answered
    Retry(String),
    /// Exit the application
    Exit,
    /// Unknown command
    Unknown(String),
}

/// Parse and execute a slash command
pub fn execute_command(input: &str, session: &ChatSession) -> Option<CommandResult> {
    let input = input.trim();

    let rest = input.strip_prefix('/')?;
    let parts: Vec<&str> = rest.splitn(2, ' ').collect();
    let command = parts[0].to_lowercase();
    let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

    Some(match command.as_str() {
        "help" | "h" | "?" => CommandResult::Message(help_message()),

        "quit" | "exit" | "q" => CommandResult::Exit,

        "older" | "o" => CommandResult::LoadOlder,

        "abort" | "a" => CommandResult::Abort,

        "status" | "s" => CommandResult::Message(status_message(session)),

        "messages" | "ls" => CommandResult::Message(messages_message(session.store())),

        "log" => match args {
            "" => usage("/log <message-id>"),
            id => CommandResult::Message(log_message(session, id)),
        },

        "rollback" | "r" => match args {
            "" => usage("/rollback <message-id>"),
            id => CommandResult::Rollback(id.to_string()),
        },

        "retry" => match args {
            "" => match last_failed(session) {
                Some(id) => CommandResult::Retry(id),
                None => CommandResult::Message("Nothing to retry".to_string()),
            },
            id => CommandResult::Retry(id.to_string()),
        },

        "edit" | "e" => match args.split_once(' ') {
            Some((id, text)) if !text.trim().is_empty() => CommandResult::Edit {
                message_id: id.to_string(),
                text: text.trim().to_string(),
            },
            _ => usage("/edit <message-id> <new text>"),
        },

        _ => CommandResult::Unknown(command),
    })
}

fn usage(text: &str) -> CommandResult {
    CommandResult::Message(format!("Usage: {}", text))
}

/// Newest message that ended in an error
fn last_failed(session: &ChatSession) -> Option<String> {
    session
        .store()
        .messages()
        .iter()
        .rev()
        .find(|m| m.state == eddy_wire::MessageState::Error)
        .map(|m| m.id.clone())
}

fn help_message() -> String {
    r#"Available commands:
  /help, /h, /?           Show this help message
  /older, /o              Load older messages
  /messages, /ls          List messages with their ids
  /log <id>               Show the process trace of a message
  /abort, /a              Stop every reply in progress
  /rollback, /r <id>      Delete everything after a message
  /edit, /e <id> <text>   Replace one of your messages and resend
  /retry [id]             Re-run the request a reply answered (default: last failed)
  /status, /s             Show connection, agents and token usage
  /quit, /exit, /q        Exit eddy

Anything else is sent to the conversation."#
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_chat::{SessionConfig, SseTransport};
    use eddy_wire::ApiClient;
    use std::sync::Arc;

    fn session() -> ChatSession {
        let client = ApiClient::new("http://localhost:9").unwrap();
        ChatSession::new(
            SessionConfig::new("c1", "gpt-4o"),
            Arc::new(SseTransport::new(client.clone())),
            Arc::new(client.clone()),
            Arc::new(client),
        )
    }

    #[test]
    fn test_plain_text_is_not_a_command() {
        assert_eq!(execute_command("hello there", &session()), None);
    }

    #[test]
    fn test_parse_commands() {
        let s = session();
        assert_eq!(execute_command("/q", &s), Some(CommandResult::Exit));
        assert_eq!(execute_command("/older", &s), Some(CommandResult::LoadOlder));
        assert_eq!(execute_command("  /abort ", &s), Some(CommandResult::Abort));
        assert_eq!(
            execute_command("/rollback m5", &s),
            Some(CommandResult::Rollback("m5".into()))
        );
        assert_eq!(
            execute_command("/edit u2 what about tuesday?", &s),
            Some(CommandResult::Edit {
                message_id: "u2".into(),
                text: "what about tuesday?".into()
            })
        );
        assert_eq!(
            execute_command("/retry a1", &s),
            Some(CommandResult::Retry("a1".into()))
        );
        assert_eq!(
            execute_command("/frobnicate", &s),
            Some(CommandResult::Unknown("frobnicate".into()))
        );
    }

    #[test]
    fn test_missing_arguments_show_usage() {
        let s = session();
        assert_eq!(
            execute_command("/edit u2", &s),
            Some(CommandResult::Message("Usage: /edit <message-id> <new text>".into()))
        );
        assert_eq!(
            execute_command("/rollback", &s),
            Some(CommandResult::Message("Usage: /rollback <message-id>".into()))
        );
        assert_eq!(
            execute_command("/retry", &s),
            Some(CommandResult::Message("Nothing to retry".into()))
        );
    }

    #[test]
    fn test_status_on_fresh_session() {
        let s = session();
        let Some(CommandResult::Message(status)) = execute_command("/status", &s) else {
            panic!("expected status text");
        };
        assert!(status.contains("Conversation: c1"));
        assert!(status.contains("Connection:   closed"));
        assert!(status.contains("Streaming:    no"));
        assert!(status.contains("summarized up to: none"));
        assert_eq!(
            execute_command("/ls", &s),
            Some(CommandResult::Message("No messages loaded".into()))
        );
    }
}
