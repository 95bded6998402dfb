//! Per-protocol SSE parsers and request mutators.
//!
//! Each protocol is a stateless pair of pure functions plumbed through the
//! [`Parser`] trait; mutation is a pair of free functions per protocol
//! (`inject_done_marker`, `build_continuation_body`) since they operate on
//! owned `serde_json::Value` bodies rather than streamed bytes.

pub mod claude;
pub mod gemini;
pub mod openai;

use serde_json::Value;

/// Which upstream wire protocol a request/response pair speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    OpenAi,
    Gemini,
    Claude,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::OpenAi => "openai",
            Protocol::Gemini => "gemini",
            Protocol::Claude => "claude",
        }
    }
}

/// Result of parsing one SSE frame.
#[derive(Debug, Clone, Default)]
pub struct ParsedFrame {
    /// Incremental assistant text extracted from this frame, if any.
    pub text: String,
}

/// A stateless per-protocol stream parser.
///
/// Implementations must never panic or early-return on malformed input —
/// `strip_marker` in particular must fall back to returning the frame
/// unchanged when it cannot be parsed as the protocol's expected shape.
pub trait StreamParser {
    /// Extract incremental text from a single SSE frame. Returns an empty
    /// string for frames that carry no text (e.g. `ping`, `message_start`).
    fn extract_text(&self, frame: &[u8]) -> ParsedFrame;

    /// Return `frame` with `marker` redacted from its extracted text, if
    /// present. Frames that fail to parse are returned unchanged
    /// (tolerance principle).
    fn strip_marker(&self, frame: &[u8], marker: &str) -> Vec<u8>;

    /// Remove the first `n` chars of this frame's extracted text, used by
    /// the engine when a done marker spans two frames.
    /// Frames with no text, or that fail to parse, are returned unchanged.
    fn redact_prefix_chars(&self, frame: &[u8], n: usize) -> Vec<u8> {
        let _ = n;
        frame.to_vec()
    }

    /// Remove the last `n` chars of this frame's extracted text.
    fn redact_suffix_chars(&self, frame: &[u8], n: usize) -> Vec<u8> {
        let _ = n;
        frame.to_vec()
    }

    /// Does this frame mark the terminal close of an attempt's protocol
    /// envelope (e.g. Claude's `message_stop`)? Only Claude overrides this;
    /// the engine suppresses such frames on intermediate attempts (spec
    /// §4.6 splicing rules, Claude exception).
    fn is_terminal(&self, frame: &[u8]) -> bool {
        let _ = frame;
        false
    }
}

/// Look up the stream parser for a protocol.
pub fn parser_for(protocol: Protocol) -> Box<dyn StreamParser + Send + Sync> {
    match protocol {
        Protocol::OpenAi => Box::new(openai::OpenAiParser),
        Protocol::Gemini => Box::new(gemini::GeminiParser),
        Protocol::Claude => Box::new(claude::ClaudeParser),
    }
}

/// The literal text injected as a system/developer instruction so the
/// model knows to emit the done marker.
pub fn done_marker_instruction(done_marker: &str) -> String {
    format!(
        "When you finish your entire answer, output exactly the literal string \
         {done_marker} on its own, as the very last thing, and then stop."
    )
}

/// The literal text of the continuation directive appended on retry.
pub fn continuation_directive(done_marker: &str) -> String {
    format!(
        "Continue exactly where you left off. Do not repeat, do not apologize. \
         End with {done_marker} when complete."
    )
}

/// Inject the done-marker instruction into a request body.
pub fn inject_done_marker(protocol: Protocol, body: &mut Value, done_marker: &str) {
    match protocol {
        Protocol::OpenAi => openai::inject_done_marker(body, done_marker),
        Protocol::Gemini => gemini::inject_done_marker(body, done_marker),
        Protocol::Claude => claude::inject_done_marker(body, done_marker),
    }
}

/// Build the continuation request body for attempt `k >= 2`.
pub fn build_continuation_body(
    protocol: Protocol,
    mutated_original: &Value,
    collected_text: &str,
    done_marker: &str,
) -> Value {
    match protocol {
        Protocol::OpenAi => openai::build_continuation_body(mutated_original, collected_text, done_marker),
        Protocol::Gemini => gemini::build_continuation_body(mutated_original, collected_text, done_marker),
        Protocol::Claude => claude::build_continuation_body(mutated_original, collected_text, done_marker),
    }
}

/// Split one SSE frame's raw bytes into its `event:` name (if any) and the
/// joined value of its `data:` line(s). Malformed UTF-8 or a frame with no
/// `data:` line yields `(None, String::new())` rather than panicking —
/// callers treat that as "pass through unchanged".
pub(crate) fn parse_frame_fields(frame: &[u8]) -> (Option<String>, String) {
    let text = match std::str::from_utf8(frame) {
        Ok(t) => t,
        Err(_) => return (None, String::new()),
    };

    let mut event = None;
    let mut data_lines = Vec::new();
    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim_start());
        }
    }
    (event, data_lines.join("\n"))
}

/// Rebuild a `data: <json>\n\n` frame, optionally prefixed with an
/// `event: <name>\n` line.
pub(crate) fn render_frame(event: Option<&str>, data: &str) -> Vec<u8> {
    let mut out = String::new();
    if let Some(e) = event {
        out.push_str("event: ");
        out.push_str(e);
        out.push('\n');
    }
    out.push_str("data: ");
    out.push_str(data);
    out.push_str("\n\n");
    out.into_bytes()
}
