//! Trigger evaluator: decides whether anti-truncation is enabled for a
//! given request.

use http::HeaderMap;
use serde_json::Value;

use crate::config::RelayConfig;
use crate::protocol::Protocol;

/// Outcome of evaluating a request's anti-truncation triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enablement {
    /// Anti-truncation is active; `stripped_model` is the model name with
    /// the trigger prefix removed, if a prefix trigger fired.
    Enabled { stripped_model: Option<String> },
    /// A trigger was present but the request is not streaming.
    IgnoredNonStreaming,
    /// No trigger fired at all.
    Disabled,
}

/// Evaluate whether anti-truncation should run for this request.
///
/// `body` is the parsed JSON request body (already subject to protocol
/// framing, e.g. the Gemini `:streamGenerateContent` suffix is conveyed via
/// `is_streaming` rather than re-derived here).
pub fn evaluate(
    protocol: Protocol,
    body: &Value,
    headers: &HeaderMap,
    query: &str,
    is_streaming: bool,
    cfg: &RelayConfig,
) -> Enablement {
    let model = body.get("model").and_then(Value::as_str);

    let prefix_trigger = model.and_then(|m| {
        m.strip_prefix(cfg.model_prefix.as_str())
            .map(|stripped| stripped.to_string())
    });

    let header_trigger = headers
        .get("x-anti-truncation")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let query_trigger = query_param(query, "anti_truncation")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false);

    let any_trigger = prefix_trigger.is_some() || header_trigger || query_trigger || cfg.anti_truncation_enabled_default;

    if !any_trigger {
        return Enablement::Disabled;
    }

    if !is_streaming {
        return Enablement::IgnoredNonStreaming;
    }

    Enablement::Enabled {
        stripped_model: prefix_trigger,
    }
}

/// Extract the value of `key` from a raw (already-decoded) query string.
fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    let query = query.strip_prefix('?').unwrap_or(query);
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

/// Streaming detection per protocol.
///
/// For OpenAI and Claude this reads the `stream` body field; for Gemini it
/// is derived from the URL path suffix by the caller and passed straight
/// through here for a single call site.
pub fn is_streaming_request(protocol: Protocol, body: &Value, path_is_stream_suffixed: bool) -> bool {
    match protocol {
        Protocol::OpenAi | Protocol::Claude => {
            body.get("stream").and_then(Value::as_bool).unwrap_or(false)
        }
        Protocol::Gemini => path_is_stream_suffixed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg() -> RelayConfig {
        RelayConfig {
            upstream_openai_base_url: String::new(),
            upstream_gemini_base_url: String::new(),
            upstream_claude_base_url: String::new(),
            anti_truncation_enabled_default: false,
            max_attempts: 3,
            done_marker: "[done]".into(),
            model_prefix: "流式抗截断/".into(),
            keepalive_interval: std::time::Duration::from_secs(15),
            upstream_idle_timeout: std::time::Duration::from_secs(30),
            trust_proxy: false,
            trusted_cidrs: vec![],
            request_timeout: std::time::Duration::from_secs(300),
            connect_timeout: std::time::Duration::from_secs(10),
            max_body_bytes: 1024,
            listen_address: "0.0.0.0:8080".into(),
        }
    }

    #[test]
    fn model_prefix_trigger_strips_prefix() {
        let body = json!({"model": "流式抗截断/gpt-4o", "stream": true});
        let result = evaluate(Protocol::OpenAi, &body, &HeaderMap::new(), "", true, &cfg());
        assert_eq!(
            result,
            Enablement::Enabled {
                stripped_model: Some("gpt-4o".to_string())
            }
        );
    }

    #[test]
    fn header_trigger_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("x-anti-truncation", "TRUE".parse().unwrap());
        let body = json!({"model": "gpt-4o", "stream": true});
        let result = evaluate(Protocol::OpenAi, &body, &headers, "", true, &cfg());
        assert_eq!(result, Enablement::Enabled { stripped_model: None });
    }

    #[test]
    fn query_trigger_accepts_variants() {
        let body = json!({"model": "gpt-4o", "stream": true});
        for v in ["1", "true", "YES", "on"] {
            let q = format!("anti_truncation={v}");
            let result = evaluate(Protocol::OpenAi, &body, &HeaderMap::new(), &q, true, &cfg());
            assert_eq!(result, Enablement::Enabled { stripped_model: None });
        }
    }

    #[test]
    fn trigger_present_but_non_streaming_is_ignored() {
        let body = json!({"model": "流式抗截断/gpt-4o", "stream": false});
        let result = evaluate(Protocol::OpenAi, &body, &HeaderMap::new(), "", false, &cfg());
        assert_eq!(result, Enablement::IgnoredNonStreaming);
    }

    #[test]
    fn no_trigger_is_disabled() {
        let body = json!({"model": "gpt-4o", "stream": true});
        let result = evaluate(Protocol::OpenAi, &body, &HeaderMap::new(), "", true, &cfg());
        assert_eq!(result, Enablement::Disabled);
    }

    #[test]
    fn gemini_streaming_comes_from_path_suffix() {
        let body = json!({});
        assert!(is_streaming_request(Protocol::Gemini, &body, true));
        assert!(!is_streaming_request(Protocol::Gemini, &body, false));
    }
}
