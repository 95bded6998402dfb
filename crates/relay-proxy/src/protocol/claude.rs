//! Claude/Anthropic messages protocol: parser + mutator.

use serde_json::{json, Value};

use super::{parse_frame_fields, render_frame, ParsedFrame, StreamParser};

pub struct ClaudeParser;

impl StreamParser for ClaudeParser {
    fn extract_text(&self, frame: &[u8]) -> ParsedFrame {
        let (event, data) = parse_frame_fields(frame);
        if event.as_deref() != Some("content_block_delta") || data.is_empty() {
            return ParsedFrame::default();
        }
        let Ok(value) = serde_json::from_str::<Value>(&data) else {
            return ParsedFrame::default();
        };
        let text = value
            .get("delta")
            .and_then(|d| d.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        ParsedFrame { text }
    }

    fn strip_marker(&self, frame: &[u8], marker: &str) -> Vec<u8> {
        let (event, data) = parse_frame_fields(frame);
        if event.as_deref() != Some("content_block_delta") || data.is_empty() {
            return frame.to_vec();
        }
        let Ok(mut value) = serde_json::from_str::<Value>(&data) else {
            return frame.to_vec();
        };

        let text = value
            .get("delta")
            .and_then(|d| d.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(text) = text else {
            return frame.to_vec();
        };
        if !text.contains(marker) {
            return frame.to_vec();
        }

        let stripped = text.replace(marker, "");
        if let Some(delta) = value.get_mut("delta").and_then(Value::as_object_mut) {
            delta.insert("text".to_string(), Value::String(stripped));
        }

        render_frame(event.as_deref(), &value.to_string())
    }

    fn redact_prefix_chars(&self, frame: &[u8], n: usize) -> Vec<u8> {
        redact_chars(frame, n, true)
    }

    fn redact_suffix_chars(&self, frame: &[u8], n: usize) -> Vec<u8> {
        redact_chars(frame, n, false)
    }

    fn is_terminal(&self, frame: &[u8]) -> bool {
        is_terminal_event(frame)
    }
}

fn redact_chars(frame: &[u8], n: usize, from_front: bool) -> Vec<u8> {
    if n == 0 {
        return frame.to_vec();
    }
    let (event, data) = parse_frame_fields(frame);
    if event.as_deref() != Some("content_block_delta") || data.is_empty() {
        return frame.to_vec();
    }
    let Ok(mut value) = serde_json::from_str::<Value>(&data) else {
        return frame.to_vec();
    };
    let Some(delta) = value.get_mut("delta").and_then(Value::as_object_mut) else {
        return frame.to_vec();
    };
    let Some(text) = delta.get("text").and_then(Value::as_str).map(str::to_string) else {
        return frame.to_vec();
    };
    let chars: Vec<char> = text.chars().collect();
    let keep = chars.len().saturating_sub(n);
    let trimmed: String = if from_front {
        chars[chars.len() - keep..].iter().collect()
    } else {
        chars[..keep].iter().collect()
    };
    delta.insert("text".to_string(), Value::String(trimmed));
    render_frame(event.as_deref(), &value.to_string())
}

/// Does this event type mark the end of an attempt? Used by the engine to
/// suppress terminal events from intermediate attempts when a continuation
/// will follow.
pub fn is_terminal_event(frame: &[u8]) -> bool {
    let (event, data) = parse_frame_fields(frame);
    match event.as_deref() {
        Some("message_stop") => true,
        Some("message_delta") => serde_json::from_str::<Value>(&data)
            .ok()
            .and_then(|v| v.get("delta").and_then(|d| d.get("stop_reason")).cloned())
            .map(|v| !v.is_null())
            .unwrap_or(false),
        _ => false,
    }
}

/// Inject the done-marker system instruction.
pub fn inject_done_marker(body: &mut Value, done_marker: &str) {
    let instruction = super::done_marker_instruction(done_marker);
    let Some(obj) = body.as_object_mut() else {
        return;
    };

    match obj.get_mut("system") {
        Some(Value::String(s)) => {
            s.push('\n');
            s.push_str(&instruction);
        }
        Some(Value::Array(blocks)) => {
            blocks.push(json!({"type": "text", "text": instruction}));
        }
        _ => {
            obj.insert("system".to_string(), Value::String(instruction));
        }
    }
}

/// Build the continuation request body.
pub fn build_continuation_body(mutated_original: &Value, collected_text: &str, done_marker: &str) -> Value {
    let directive = super::continuation_directive(done_marker);
    let mut body = mutated_original.clone();
    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        messages.push(json!({"role": "assistant", "content": collected_text}));
        messages.push(json!({"role": "user", "content": directive}));
    }
    body
}
