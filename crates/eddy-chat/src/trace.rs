//! Process trace merging
//!
//! Steps reach a message through two independent channels: inline with
//! streaming chunks, and as separate "call done" events. The two do not
//! always share an id space, so a step is keyed by its server `step_id` when
//! both sides carry one and by `(type, timestamp)` otherwise.

use std::cmp::Ordering;

use eddy_wire::{ContentBlock, Step, StepDetail, StepStatus};
use serde_json::Value;

/// Merge incoming steps into an existing trace.
///
/// Matching entries are updated in place, new ones appended, and the
/// result sorted by timestamp. The outcome does not depend on the order in
/// which the same steps arrive.
pub fn merge(existing: &[Step], incoming: &[Step]) -> Vec<Step> {
    let mut trace: Vec<Step> = existing.iter().cloned().map(with_blocks).collect();

    for step in incoming {
        let step = with_blocks(step.clone());
        match find_match(&trace, &step) {
            Some(idx) => trace[idx] = merge_step(&trace[idx], &step),
            None => trace.push(step),
        }
    }

    trace.sort_by(step_order);
    trace
}

/// Mark every still-running step as finished
pub fn close_running(trace: &mut [Step], failed: bool) {
    let terminal = if failed {
        StepStatus::Error
    } else {
        StepStatus::Completed
    };
    for step in trace.iter_mut().filter(|s| s.status == StepStatus::Running) {
        step.status = terminal;
    }
}

fn find_match(trace: &[Step], step: &Step) -> Option<usize> {
    if let Some(id) = step.step_id.as_deref() {
        if let Some(idx) = trace.iter().position(|s| s.step_id.as_deref() == Some(id)) {
            return Some(idx);
        }
    }
    trace.iter().position(|s| same_key(s, step))
}

fn same_key(a: &Step, b: &Step) -> bool {
    match (&a.step_id, &b.step_id) {
        (Some(x), Some(y)) => x == y,
        _ => a.kind() == b.kind() && a.timestamp == b.timestamp,
    }
}

fn step_order(a: &Step, b: &Step) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.kind().cmp(&b.kind()))
        .then_with(|| a.step_id.cmp(&b.step_id))
}

/// How much information a step payload carries; used to break status ties
fn richness(step: &Step) -> usize {
    match &step.detail {
        StepDetail::Thinking { text } => text.len(),
        StepDetail::ToolCall {
            name,
            arguments,
            result,
            ..
        } => {
            name.len()
                + if arguments.is_null() { 0 } else { 1 }
                + result.as_ref().map(|r| 1 + r.to_string().len()).unwrap_or(0)
        }
        StepDetail::SubDecision { reason, .. } => reason.as_ref().map(|r| r.len()).unwrap_or(0),
    }
}

/// Commutative merge of two entries with the same key
fn merge_step(a: &Step, b: &Step) -> Step {
    let a_wins = match a.status.rank().cmp(&b.status.rank()) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => match richness(a).cmp(&richness(b)) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => {
                let a_json = serde_json::to_string(a).unwrap_or_default();
                let b_json = serde_json::to_string(b).unwrap_or_default();
                a_json >= b_json
            }
        },
    };
    let (winner, other) = if a_wins { (a, b) } else { (b, a) };

    let mut merged = winner.clone();
    if merged.step_id.is_none() {
        merged.step_id = other.step_id.clone();
    }
    merged.timestamp = winner.timestamp.min(other.timestamp);

    match (&mut merged.detail, &other.detail) {
        (
            StepDetail::ToolCall {
                name,
                arguments,
                result,
                ..
            },
            StepDetail::ToolCall {
                name: other_name,
                arguments: other_arguments,
                result: other_result,
                ..
            },
        ) => {
            if name.is_empty() {
                *name = other_name.clone();
            }
            if arguments.is_null() {
                *arguments = other_arguments.clone();
            }
            if result.is_none() {
                *result = other_result.clone();
            }
        }
        (StepDetail::Thinking { text }, StepDetail::Thinking { text: other_text }) => {
            if text.is_empty() {
                *text = other_text.clone();
            }
        }
        (StepDetail::SubDecision { reason, .. }, StepDetail::SubDecision { reason: other_reason, .. }) => {
            if reason.is_none() {
                *reason = other_reason.clone();
            }
        }
        _ => {}
    }

    with_blocks(merged)
}

/// Derive display blocks from a tool result
fn with_blocks(mut step: Step) -> Step {
    if let StepDetail::ToolCall { result, blocks, .. } = &mut step.detail {
        *blocks = result.as_ref().map(parse_content_blocks).unwrap_or_default();
    }
    step
}

/// Parse a structured tool result into typed display blocks.
///
/// Accepts MCP-style `{ content: [...] }` objects, bare block arrays, JSON
/// encoded in a string, and plain text.
pub fn parse_content_blocks(value: &Value) -> Vec<ContentBlock> {
    match value {
        Value::Null => vec![],
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(inner @ (Value::Array(_) | Value::Object(_))) => parse_content_blocks(&inner),
            _ if s.is_empty() => vec![],
            _ => vec![ContentBlock::text(s.clone())],
        },
        Value::Array(items) => items.iter().flat_map(parse_block).collect(),
        Value::Object(map) => {
            if let Some(content) = map.get("content") {
                parse_content_blocks(content)
            } else if map.contains_key("type") {
                parse_block(value)
            } else {
                vec![ContentBlock::text(value.to_string())]
            }
        }
        other => vec![ContentBlock::text(other.to_string())],
    }
}

fn str_field(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match item.get(*k)? {
        Value::String(s) => Some(s.clone()),
        // `{ "image_url": { "url": ... } }`
        Value::Object(inner) => inner.get("url").and_then(|u| u.as_str()).map(String::from),
        _ => None,
    })
}

fn parse_block(item: &Value) -> Vec<ContentBlock> {
    if let Value::String(s) = item {
        return vec![ContentBlock::text(s.clone())];
    }

    let kind = item.get("type").and_then(|t| t.as_str()).unwrap_or("");
    let mime_type = str_field(item, &["mimeType", "mime_type"]);

    let block = match kind {
        "text" => ContentBlock::Text {
            text: str_field(item, &["text", "content"]).unwrap_or_default(),
        },
        "image" | "image_url" => ContentBlock::Image {
            url: str_field(item, &["url", "image_url", "uri"]),
            data: str_field(item, &["data"]),
            mime_type,
        },
        "video" | "video_url" => ContentBlock::Video {
            url: str_field(item, &["url", "video_url", "uri"]),
            mime_type,
        },
        "audio" | "audio_url" => ContentBlock::Audio {
            url: str_field(item, &["url", "audio_url", "uri"]),
            data: str_field(item, &["data"]),
            mime_type,
        },
        _ => ContentBlock::text(item.to_string()),
    };
    vec![block]
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_wire::{DecisionAction, StepKind};
    use serde_json::json;

    fn keys(trace: &[Step]) -> Vec<(StepKind, i64)> {
        trace.iter().map(|s| (s.kind(), s.timestamp)).collect()
    }

    #[test]
    fn test_status_transition_updates_in_place() {
        let running = Step::tool_call(10, "search", json!({"q": "rust"}));
        let done = Step::tool_call(10, "search", json!({"q": "rust"}))
            .with_status(StepStatus::Completed)
            .with_result(json!("3 hits"));

        let trace = merge(&[running], &[done]);
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].status, StepStatus::Completed);
    }

    #[test]
    fn test_stale_running_does_not_regress_completed() {
        let done = Step::tool_call(10, "search", json!({})).with_status(StepStatus::Completed);
        let stale = Step::tool_call(10, "search", json!({}));
        let trace = merge(&[done], &[stale]);
        assert_eq!(trace[0].status, StepStatus::Completed);
    }

    #[test]
    fn test_sorted_and_no_duplicate_keys() {
        let trace = merge(
            &[Step::thinking(30, "c"), Step::thinking(10, "a")],
            &[Step::thinking(20, "b"), Step::thinking(10, "a")],
        );
        assert_eq!(
            keys(&trace),
            vec![
                (StepKind::Thinking, 10),
                (StepKind::Thinking, 20),
                (StepKind::Thinking, 30)
            ]
        );
    }

    #[test]
    fn test_inline_step_merges_with_call_done_event() {
        // inline chunk copy lacks the id; the call-done copy carries it
        let inline = Step::tool_call(50, "fetch", json!({"url": "x"}));
        let call_done = Step::tool_call(50, "fetch", json!(null))
            .with_id("call-9")
            .with_status(StepStatus::Completed)
            .with_result(json!({"content": [{"type": "text", "text": "ok"}]}));

        let trace = merge(&[inline], &[call_done]);
        assert_eq!(trace.len(), 1);
        let step = &trace[0];
        assert_eq!(step.step_id.as_deref(), Some("call-9"));
        match &step.detail {
            StepDetail::ToolCall { arguments, blocks, .. } => {
                assert_eq!(arguments, &json!({"url": "x"}));
                assert_eq!(blocks, &vec![ContentBlock::text("ok")]);
            }
            other => panic!("unexpected detail: {:?}", other),
        }
    }

    #[test]
    fn test_distinct_step_ids_in_same_millisecond_stay_apart() {
        let a = Step::tool_call(5, "a", json!({})).with_id("s1");
        let b = Step::tool_call(5, "b", json!({})).with_id("s2");
        assert_eq!(merge(&[a], &[b]).len(), 2);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let steps = vec![
            Step::thinking(1, "Let"),
            Step::thinking(1, "Let me check"),
            Step::tool_call(2, "search", json!({"q": "tides"})),
            Step::tool_call(2, "search", json!({"q": "tides"}))
                .with_id("c1")
                .with_status(StepStatus::Completed)
                .with_result(json!("high at noon")),
            Step::decision(3, "agent-b", DecisionAction::Silent, Some("covered".into())),
            Step::thinking(4, "done"),
        ];

        let forward = steps
            .iter()
            .fold(vec![], |acc, s| merge(&acc, std::slice::from_ref(s)));

        // every rotation, plus the reverse, must converge on the same trace
        for shift in 0..steps.len() {
            let mut rotated = steps.clone();
            rotated.rotate_left(shift);
            let trace = rotated
                .iter()
                .fold(vec![], |acc, s| merge(&acc, std::slice::from_ref(s)));
            assert_eq!(trace, forward, "rotation {} diverged", shift);
        }
        let reversed = steps
            .iter()
            .rev()
            .fold(vec![], |acc, s| merge(&acc, std::slice::from_ref(s)));
        assert_eq!(reversed, forward);

        assert_eq!(forward.len(), 4);
        match &forward[0].detail {
            StepDetail::Thinking { text } => assert_eq!(text, "Let me check"),
            other => panic!("unexpected detail: {:?}", other),
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let incoming = vec![Step::thinking(1, "x"), Step::tool_call(2, "t", json!({}))];
        let once = merge(&[], &incoming);
        let twice = merge(&once, &incoming);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_close_running() {
        let mut trace = vec![
            Step::thinking(1, "x"),
            Step::tool_call(2, "t", json!({})).with_status(StepStatus::Error),
        ];
        close_running(&mut trace, false);
        assert_eq!(trace[0].status, StepStatus::Completed);
        assert_eq!(trace[1].status, StepStatus::Error);
    }

    #[test]
    fn test_parse_blocks_shapes() {
        assert_eq!(
            parse_content_blocks(&json!("plain text")),
            vec![ContentBlock::text("plain text")]
        );
        assert_eq!(
            parse_content_blocks(&json!("[{\"type\":\"text\",\"text\":\"encoded\"}]")),
            vec![ContentBlock::text("encoded")]
        );

        let blocks = parse_content_blocks(&json!({
            "content": [
                {"type": "image", "data": "iVBOR", "mimeType": "image/png"},
                {"type": "video", "url": "https://v/1.mp4"},
                {"type": "audio_url", "audio_url": {"url": "https://a/1.mp3"}}
            ]
        }));
        assert_eq!(
            blocks,
            vec![
                ContentBlock::Image {
                    url: None,
                    data: Some("iVBOR".into()),
                    mime_type: Some("image/png".into())
                },
                ContentBlock::Video {
                    url: Some("https://v/1.mp4".into()),
                    mime_type: None
                },
                ContentBlock::Audio {
                    url: Some("https://a/1.mp3".into()),
                    data: None,
                    mime_type: None
                },
            ]
        );
    }

    #[test]
    fn test_parse_blocks_is_repeatable() {
        let result = json!({"content": [{"type": "text", "text": "a"}]});
        assert_eq!(parse_content_blocks(&result), parse_content_blocks(&result));
        assert!(parse_content_blocks(&json!(null)).is_empty());
    }
}
