//! Local token estimation
//!
//! A byte/character heuristic, no tokenizer and no network. It gatekeeps
//! auto-summarization, so it errs slightly high for CJK text and stays close
//! to provider counts for ASCII.

use eddy_wire::Message;

/// Framing overhead per message (role markers, separators)
const MESSAGE_OVERHEAD: u32 = 4;

/// ASCII characters per token for a model family
fn ascii_chars_per_token(model_id: &str) -> f64 {
    let id = model_id.to_ascii_lowercase();
    if id.contains("claude") {
        3.5
    } else if id.contains("qwen") || id.contains("deepseek") || id.contains("glm") {
        3.8
    } else {
        // gpt-*, o-series, gemini, llama and unknown models
        4.0
    }
}

/// Estimate token count for a single message.
///
/// Summary messages are counted like any user content: they go over the
/// wire as such.
pub fn estimate_message(message: &Message, model_id: &str) -> u32 {
    let mut ascii = 0usize;
    let mut wide = 0usize;
    for ch in message.content.chars() {
        if ch.is_ascii() {
            ascii += 1;
        } else {
            wide += 1;
        }
    }

    let ascii_tokens = (ascii as f64 / ascii_chars_per_token(model_id)).ceil() as u32;
    MESSAGE_OVERHEAD + ascii_tokens + wide as u32
}

/// Estimate total tokens for a sequence of messages
pub fn estimate<'a>(messages: impl IntoIterator<Item = &'a Message>, model_id: &str) -> u32 {
    messages
        .into_iter()
        .map(|m| estimate_message(m, model_id))
        .fold(0u32, |acc, n| acc.saturating_add(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_wire::{Message, Role};

    fn msg(role: Role, text: &str) -> Message {
        let mut m = Message::new("m", role);
        m.content = text.to_string();
        m
    }

    #[test]
    fn test_ascii_estimate() {
        // 400 ascii chars / 4 = 100, plus overhead
        let m = msg(Role::User, &"x".repeat(400));
        assert_eq!(estimate_message(&m, "gpt-4o"), 100 + MESSAGE_OVERHEAD);
    }

    #[test]
    fn test_cjk_counts_one_per_char() {
        let m = msg(Role::Assistant, "你好世界");
        assert_eq!(estimate_message(&m, "gpt-4o"), 4 + MESSAGE_OVERHEAD);
    }

    #[test]
    fn test_model_family_ratio() {
        let m = msg(Role::User, &"y".repeat(700));
        assert_eq!(estimate_message(&m, "claude-sonnet-4-5"), 200 + MESSAGE_OVERHEAD);
        assert_eq!(estimate_message(&m, "unknown-model"), 175 + MESSAGE_OVERHEAD);
    }

    #[test]
    fn test_summary_counts_as_user_content() {
        let summary = Message::summary("s1", "what happened so far");
        let mut user = msg(Role::User, &summary.content);
        user.id = "u1".into();
        assert_eq!(
            estimate_message(&summary, "gpt-4o"),
            estimate_message(&user, "gpt-4o")
        );
    }

    #[test]
    fn test_estimate_is_monotonic() {
        let samples = [
            msg(Role::User, ""),
            msg(Role::Assistant, "short"),
            msg(Role::System, "系统提示"),
            msg(Role::Tool, &"{\"ok\":true}".repeat(30)),
            Message::summary("s", "earlier turns"),
        ];
        let mut conversation: Vec<Message> = vec![];
        let mut previous = estimate(&conversation, "gpt-4o");
        for m in samples.iter().cycle().take(20) {
            conversation.push(m.clone());
            let next = estimate(&conversation, "gpt-4o");
            assert!(next >= previous, "estimate decreased: {} -> {}", previous, next);
            previous = next;
        }
    }

    #[test]
    fn test_empty_conversation_is_zero() {
        let empty: Vec<Message> = vec![];
        assert_eq!(estimate(&empty, "gpt-4o"), 0);
    }
}
