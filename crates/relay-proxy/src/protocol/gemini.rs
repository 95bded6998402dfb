//! Gemini generateContent/streamGenerateContent protocol: parser + mutator.

use serde_json::{json, Value};

use super::{parse_frame_fields, render_frame, ParsedFrame, StreamParser};

pub struct GeminiParser;

impl StreamParser for GeminiParser {
    fn extract_text(&self, frame: &[u8]) -> ParsedFrame {
        let (_, data) = parse_frame_fields(frame);
        if data.is_empty() {
            return ParsedFrame::default();
        }
        let Ok(value) = serde_json::from_str::<Value>(&data) else {
            return ParsedFrame::default();
        };
        ParsedFrame {
            text: concat_parts_text(&value),
        }
    }

    fn strip_marker(&self, frame: &[u8], marker: &str) -> Vec<u8> {
        let (event, data) = parse_frame_fields(frame);
        if data.is_empty() {
            return frame.to_vec();
        }
        let Ok(mut value) = serde_json::from_str::<Value>(&data) else {
            return frame.to_vec();
        };

        if !concat_parts_text(&value).contains(marker) {
            return frame.to_vec();
        }

        if let Some(parts) = value
            .get_mut("candidates")
            .and_then(|c| c.get_mut(0))
            .and_then(|c| c.get_mut("content"))
            .and_then(|c| c.get_mut("parts"))
            .and_then(Value::as_array_mut)
        {
            for part in parts.iter_mut() {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    let stripped = text.replace(marker, "");
                    if let Some(obj) = part.as_object_mut() {
                        obj.insert("text".to_string(), Value::String(stripped));
                    }
                }
            }
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

/// Trim `n` chars from the front or back of the last text part, used when a
/// done marker spans two adjacent frames. Only the simple,
/// dominant case of a single trailing/leading text part is handled; frames
/// with no parts are returned unchanged.
fn redact_chars(frame: &[u8], n: usize, from_front: bool) -> Vec<u8> {
    if n == 0 {
        return frame.to_vec();
    }
    let (event, data) = parse_frame_fields(frame);
    if data.is_empty() {
        return frame.to_vec();
    }
    let Ok(mut value) = serde_json::from_str::<Value>(&data) else {
        return frame.to_vec();
    };
    let Some(parts) = value
        .get_mut("candidates")
        .and_then(|c| c.get_mut(0))
        .and_then(|c| c.get_mut("content"))
        .and_then(|c| c.get_mut("parts"))
        .and_then(Value::as_array_mut)
    else {
        return frame.to_vec();
    };
    let target = if from_front { parts.first_mut() } else { parts.last_mut() };
    let Some(part) = target else {
        return frame.to_vec();
    };
    let Some(text) = part.get("text").and_then(Value::as_str).map(str::to_string) else {
        return frame.to_vec();
    };
    let chars: Vec<char> = text.chars().collect();
    let keep = chars.len().saturating_sub(n);
    let trimmed: String = if from_front {
        chars[chars.len() - keep..].iter().collect()
    } else {
        chars[..keep].iter().collect()
    };
    if let Some(obj) = part.as_object_mut() {
        obj.insert("text".to_string(), Value::String(trimmed));
    }
    render_frame(event.as_deref(), &value.to_string())
}

fn concat_parts_text(value: &Value) -> String {
    value
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Inject the done-marker system instruction.
pub fn inject_done_marker(body: &mut Value, done_marker: &str) {
    let instruction = super::done_marker_instruction(done_marker);
    let Some(obj) = body.as_object_mut() else {
        return;
    };

    match obj.get_mut("systemInstruction") {
        Some(Value::Object(sys)) => {
            let parts = sys
                .entry("parts")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Some(arr) = parts.as_array_mut() {
                arr.push(json!({"text": instruction}));
            }
        }
        _ => {
            obj.insert(
                "systemInstruction".to_string(),
                json!({"parts": [{"text": instruction}]}),
            );
        }
    }
}

/// Build the continuation request body.
pub fn build_continuation_body(mutated_original: &Value, collected_text: &str, done_marker: &str) -> Value {
    let directive = super::continuation_directive(done_marker);
    let mut body = mutated_original.clone();
    if let Some(contents) = body.get_mut("contents").and_then(Value::as_array_mut) {
        contents.push(json!({"role": "model", "parts": [{"text": collected_text}]}));
        contents.push(json!({"role": "user", "parts": [{"text": directive}]}));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_concatenates_parts() {
        let frame = b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"a\"},{\"text\":\"b\"}]}}]}\n\n";
        assert_eq!(GeminiParser.extract_text(frame).text, "ab");
    }

    #[test]
    fn extract_text_tolerates_malformed_json() {
        let frame = b"data: not json\n\n";
        assert_eq!(GeminiParser.extract_text(frame).text, "");
    }

    #[test]
    fn strip_marker_removes_substring_from_part() {
        let frame = b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"answer.[done]\"}]}}]}\n\n";
        let out = GeminiParser.strip_marker(frame, "[done]");
        let out_str = String::from_utf8(out).unwrap();
        assert!(!out_str.contains("[done]"));
        assert!(out_str.contains("answer."));
    }

    #[test]
    fn inject_creates_system_instruction_when_absent() {
        let mut body = json!({"contents": []});
        inject_done_marker(&mut body, "[done]");
        let parts = body["systemInstruction"]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 1);
        assert!(parts[0]["text"].as_str().unwrap().contains("[done]"));
    }

    #[test]
    fn inject_appends_part_to_existing_instruction() {
        let mut body = json!({"systemInstruction": {"parts": [{"text": "be nice"}]}});
        inject_done_marker(&mut body, "[done]");
        let parts = body["systemInstruction"]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn redact_suffix_chars_trims_last_part() {
        let frame = b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"hi [do\"}]}}]}\n\n";
        let out = GeminiParser.redact_suffix_chars(frame, 3);
        assert_eq!(GeminiParser.extract_text(&out).text, "hi ");
    }

    #[test]
    fn redact_prefix_chars_trims_first_part() {
        let frame = b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ne] world\"}]}}]}\n\n";
        let out = GeminiParser.redact_prefix_chars(frame, 3);
        assert_eq!(GeminiParser.extract_text(&out).text, " world");
    }

    #[test]
    fn continuation_body_appends_model_and_user_turns() {
        let original = json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]});
        let continued = build_continuation_body(&original, "Part one.", "[done]");
        let contents = continued["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["text"], "Part one.");
        assert_eq!(contents[2]["role"], "user");
    }
}
