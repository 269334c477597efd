//! Error types for eddy-chat

use thiserror::Error;

/// Result type alias using eddy-chat Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the reconciliation engine.
///
/// None of these abort a session: transport errors are retried, stream and
/// summarization errors are confined to one message or one turn.
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the wire layer
    #[error(transparent)]
    Wire(#[from] eddy_wire::Error),

    /// The push connection dropped or could not be opened
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend reported an error for one message
    #[error("Message {message_id} failed: {message}")]
    TerminalStream { message_id: String, message: String },

    /// Summarization failed; the conversation proceeds unsummarized
    #[error("Summarization error: {0}")]
    Summarization(String),

    /// A persistence call failed; `operation` names what the user attempted
    #[error("Failed to {operation}: {message}")]
    Persistence { operation: String, message: String },

    /// A generic session error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a persistence error for the named operation
    pub fn persistence(operation: impl Into<String>, source: impl std::fmt::Display) -> Self {
        Self::Persistence {
            operation: operation.into(),
            message: source.to_string(),
        }
    }

    /// Whether the error is recovered automatically without user action
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Summarization(_) => true,
            Error::Wire(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_error_names_operation() {
        let e = Error::persistence("delete message m7", "HTTP 500");
        assert_eq!(e.to_string(), "Failed to delete message m7: HTTP 500");
        assert!(!e.is_transient());
    }

    #[test]
    fn test_transient_errors() {
        assert!(Error::Transport("reset".into()).is_transient());
        assert!(Error::Summarization("timeout".into()).is_transient());
        assert!(Error::Wire(eddy_wire::Error::api(502, "bad gateway")).is_transient());
        assert!(
            !Error::TerminalStream {
                message_id: "m1".into(),
                message: "model refused".into()
            }
            .is_transient()
        );
    }
}
