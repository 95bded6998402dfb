//! OpenAI-compatible chat completion protocol: parser + mutator.

use serde_json::{json, Value};

use super::{parse_frame_fields, render_frame, ParsedFrame, StreamParser};

pub struct OpenAiParser;

impl StreamParser for OpenAiParser {
    fn extract_text(&self, frame: &[u8]) -> ParsedFrame {
        let (_, data) = parse_frame_fields(frame);
        if data.is_empty() || data == "[DONE]" {
            return ParsedFrame::default();
        }
        let Ok(value) = serde_json::from_str::<Value>(&data) else {
            return ParsedFrame::default();
        };
        let text = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        ParsedFrame { text }
    }

    fn strip_marker(&self, frame: &[u8], marker: &str) -> Vec<u8> {
        let (event, data) = parse_frame_fields(frame);
        if data.is_empty() || data == "[DONE]" {
            return frame.to_vec();
        }
        let Ok(mut value) = serde_json::from_str::<Value>(&data) else {
            return frame.to_vec();
        };

        let content = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let Some(content) = content else {
            return frame.to_vec();
        };
        if !content.contains(marker) {
            return frame.to_vec();
        }

        let stripped = content.replace(marker, "");
        if let Some(delta) = value
            .get_mut("choices")
            .and_then(|c| c.get_mut(0))
            .and_then(|c| c.get_mut("delta"))
            .and_then(Value::as_object_mut)
        {
            delta.insert("content".to_string(), Value::String(stripped));
        }

        render_frame(event.as_deref(), &value.to_string())
    }

    fn redact_prefix_chars(&self, frame: &[u8], n: usize) -> Vec<u8> {
        redact_chars(frame, n, true)
    }

    fn redact_suffix_chars(&self, frame: &[u8], n: usize) -> Vec<u8> {
        redact_chars(frame, n, false)
    }
}

/// Shared prefix/suffix char trimming for `delta.content`, used when a done
/// marker spans two adjacent frames.
fn redact_chars(frame: &[u8], n: usize, from_front: bool) -> Vec<u8> {
    if n == 0 {
        return frame.to_vec();
    }
    let (event, data) = parse_frame_fields(frame);
    if data.is_empty() || data == "[DONE]" {
        return frame.to_vec();
    }
    let Ok(mut value) = serde_json::from_str::<Value>(&data) else {
        return frame.to_vec();
    };
    let Some(delta) = value
        .get_mut("choices")
        .and_then(|c| c.get_mut(0))
        .and_then(|c| c.get_mut("delta"))
        .and_then(Value::as_object_mut)
    else {
        return frame.to_vec();
    };
    let Some(content) = delta.get("content").and_then(Value::as_str).map(str::to_string) else {
        return frame.to_vec();
    };
    let chars: Vec<char> = content.chars().collect();
    let keep = chars.len().saturating_sub(n);
    let trimmed: String = if from_front {
        chars[chars.len() - keep..].iter().collect()
    } else {
        chars[..keep].iter().collect()
    };
    delta.insert("content".to_string(), Value::String(trimmed));
    render_frame(event.as_deref(), &value.to_string())
}

/// Inject the done-marker system instruction.
pub fn inject_done_marker(body: &mut Value, done_marker: &str) {
    let instruction = super::done_marker_instruction(done_marker);
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    let messages = obj
        .entry("messages")
        .or_insert_with(|| Value::Array(Vec::new()));
    let Some(arr) = messages.as_array_mut() else {
        return;
    };

    let first_is_system = arr
        .first()
        .and_then(|m| m.get("role"))
        .and_then(Value::as_str)
        == Some("system");

    if first_is_system {
        append_to_message_content(&mut arr[0], &instruction);
    } else {
        arr.insert(0, json!({"role": "system", "content": instruction}));
    }
}

/// Append text to a message's `content`, which may be a string or a
/// multimodal content-block array.
fn append_to_message_content(message: &mut Value, text: &str) {
    let Some(obj) = message.as_object_mut() else {
        return;
    };
    match obj.get_mut("content") {
        Some(Value::String(s)) => {
            s.push('\n');
            s.push_str(text);
        }
        Some(Value::Array(blocks)) => {
            blocks.push(json!({"type": "text", "text": text}));
        }
        _ => {
            obj.insert("content".to_string(), Value::String(text.to_string()));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_reads_delta_content() {
        let frame = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello \"}}]}\n\n";
        let parsed = OpenAiParser.extract_text(frame);
        assert_eq!(parsed.text, "Hello ");
    }

    #[test]
    fn extract_text_ignores_done_sentinel() {
        let frame = b"data: [DONE]\n\n";
        assert_eq!(OpenAiParser.extract_text(frame).text, "");
    }

    #[test]
    fn extract_text_tolerates_malformed_json() {
        let frame = b"data: {not json\n\n";
        assert_eq!(OpenAiParser.extract_text(frame).text, "");
    }

    #[test]
    fn strip_marker_redacts_and_reserializes() {
        let frame = b"data: {\"choices\":[{\"delta\":{\"content\":\"world [done]\"}}]}\n\n";
        let out = OpenAiParser.strip_marker(frame, "[done]");
        let out_str = String::from_utf8(out).unwrap();
        assert!(out_str.starts_with("data: "));
        assert!(!out_str.contains("[done]"));
        assert!(out_str.contains("world "));
    }

    #[test]
    fn strip_marker_passes_through_malformed_frame() {
        let frame = b"data: {not json\n\n";
        let out = OpenAiParser.strip_marker(frame, "[done]");
        assert_eq!(out, frame);
    }

    #[test]
    fn inject_prepends_system_message_when_absent() {
        let mut body = json!({"messages": [{"role": "user", "content": "hi"}]});
        inject_done_marker(&mut body, "[done]");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert!(messages[0]["content"].as_str().unwrap().contains("[done]"));
        assert_eq!(messages[1]["role"], "user");
    }

    #[test]
    fn inject_appends_to_existing_system_message() {
        let mut body = json!({"messages": [{"role": "system", "content": "be nice"}, {"role": "user", "content": "hi"}]});
        inject_done_marker(&mut body, "[done]");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        let content = messages[0]["content"].as_str().unwrap();
        assert!(content.starts_with("be nice"));
        assert!(content.contains("[done]"));
    }

    #[test]
    fn redact_suffix_chars_trims_trailing_text() {
        let frame = b"data: {\"choices\":[{\"delta\":{\"content\":\"hello [do\"}}]}\n\n";
        let out = OpenAiParser.redact_suffix_chars(frame, 3);
        let parsed = OpenAiParser.extract_text(&out);
        assert_eq!(parsed.text, "hello ");
    }

    #[test]
    fn redact_prefix_chars_trims_leading_text() {
        let frame = b"data: {\"choices\":[{\"delta\":{\"content\":\"ne] world\"}}]}\n\n";
        let out = OpenAiParser.redact_prefix_chars(frame, 3);
        let parsed = OpenAiParser.extract_text(&out);
        assert_eq!(parsed.text, " world");
    }

    #[test]
    fn continuation_body_appends_assistant_and_user_turns() {
        let original = json!({"messages": [{"role": "user", "content": "hi"}], "temperature": 0.5});
        let continued = build_continuation_body(&original, "Part one.", "[done]");
        let messages = continued["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"], "Part one.");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(continued["temperature"], 0.5);
    }
}
