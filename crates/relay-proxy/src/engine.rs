//! The anti-truncation engine: the streaming multi-attempt supervisor.
//!
//! `run` drives attempt 1 (already open — the caller has verified its
//! status is 2xx before handing it off) through to completion,
//! transparently issuing continuation attempts on premature close, and
//! yields [`http_body::Frame`]s suitable for `axum::body::Body`. Data
//! frames carry the spliced, marker-redacted byte stream; a single
//! trailer frame carries `X-Anti-Truncation-Max-Attempts-Reached` when
//! applicable — HTTP trailers are the mechanism that lets a signal only
//! known at stream-close time still ride on headers emitted "before the
//! first body byte", without buffering the response.
//!
//! Finding the done marker in a frame ends the *search*, not the attempt:
//! whatever is still in flight on the current attempt's chunk stream (e.g.
//! OpenAI's trailing `data: [DONE]` sentinel, always its own frame after
//! the final content delta) is drained and forwarded verbatim, in order,
//! until that attempt's stream closes on its own.

use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue};
use http_body::Frame;
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::Instrument;

use crate::protocol::{self, Protocol, StreamParser};
use crate::sse::FrameSplitter;
use crate::upstream::{AttemptHandle, Upstream};

/// Header name for the max-attempts-reached trailer.
pub const MAX_ATTEMPTS_REACHED_HEADER: &str = "x-anti-truncation-max-attempts-reached";

/// Parameters fixed for the lifetime of one anti-truncation run.
pub struct EngineParams {
    pub request_id: String,
    pub protocol: Protocol,
    pub done_marker: String,
    pub max_attempts: u32,
    pub keepalive_interval: Duration,
    pub idle_timeout: Duration,
}

/// A frame held back because its extracted text might be a prefix of the
/// done marker that completes in the next frame.
type HeldFrame = (Vec<u8>, String);

/// Drive the full multi-attempt run and produce the client-visible body
/// stream. `first_attempt` must already be a verified-2xx, already-open
/// response; `mutated_original_body` is the attempt-1 request body (with
/// the done-marker instruction already injected) used as the base for
/// building continuation bodies.
pub fn run(
    params: EngineParams,
    parser: Box<dyn StreamParser + Send + Sync>,
    mutated_original_body: Value,
    first_attempt: AttemptHandle,
    first_attempt_span: tracing::Span,
    upstream: Box<dyn Upstream>,
) -> BoxStream<'static, Result<Frame<Bytes>, Infallible>> {
    Box::pin(async_stream::stream! {
        let marker = params.done_marker.clone();
        let mut collected = String::new();
        let mut attempt_index: u32 = 1;
        let mut current = first_attempt.chunks;
        let mut current_span = first_attempt_span;
        let mut bytes_forwarded: u64 = 0;
        let mut splitter = FrameSplitter::new();
        let mut held: Option<HeldFrame> = None;
        let mut pending_terminal: Vec<Vec<u8>> = Vec::new();
        let mut marker_found = false;
        let mut max_attempts_reached = false;

        loop {
            let mut idle_armed = false;
            let mut idle_deadline = Box::pin(sleep(Duration::from_secs(365 * 24 * 3600)));
            let mut keepalive_deadline = Box::pin(sleep(params.keepalive_interval));

            loop {
                tokio::select! {
                    chunk = current.next() => {
                        match chunk {
                            Some(Ok(bytes)) => {
                                idle_armed = true;
                                idle_deadline.as_mut().reset(Instant::now() + params.idle_timeout);

                                for frame in splitter.push(&bytes) {
                                    if marker_found {
                                        // The marker already completed this attempt's
                                        // answer; everything still arriving is drained
                                        // and forwarded as-is rather than dropped.
                                        bytes_forwarded += frame.len() as u64;
                                        yield Ok(Frame::data(Bytes::from(frame)));
                                        continue;
                                    }

                                    if parser.is_terminal(&frame) {
                                        pending_terminal.push(frame);
                                        continue;
                                    }

                                    let parsed = parser.extract_text(&frame);
                                    collected.push_str(&parsed.text);

                                    let held_text = held.as_ref().map(|(_, t)| t.clone()).unwrap_or_default();
                                    let combined = format!("{held_text}{}", parsed.text);

                                    if combined.contains(marker.as_str()) {
                                        let byte_idx = combined.find(marker.as_str()).expect("just checked contains");
                                        let idx_chars = combined[..byte_idx].chars().count();
                                        let held_text_chars = held_text.chars().count();
                                        let marker_chars = marker.chars().count();

                                        // Any terminal envelope frames (e.g. Claude's
                                        // `message_stop`) buffered from earlier in this
                                        // attempt are no longer intermediate — no
                                        // continuation will follow — so release them now,
                                        // in order, ahead of the marker-bearing frame.
                                        for pending in pending_terminal.drain(..) {
                                            bytes_forwarded += pending.len() as u64;
                                            yield Ok(Frame::data(Bytes::from(pending)));
                                        }

                                        if let Some((held_raw, _)) = held.take() {
                                            if idx_chars >= held_text_chars {
                                                bytes_forwarded += held_raw.len() as u64;
                                                yield Ok(Frame::data(Bytes::from(held_raw)));
                                                let stripped = parser.strip_marker(&frame, &marker);
                                                bytes_forwarded += stripped.len() as u64;
                                                yield Ok(Frame::data(Bytes::from(stripped)));
                                            } else {
                                                let held_consumed = held_text_chars - idx_chars;
                                                let new_consumed = marker_chars.saturating_sub(held_consumed);
                                                let held_redacted = parser.redact_suffix_chars(&held_raw, held_consumed);
                                                bytes_forwarded += held_redacted.len() as u64;
                                                yield Ok(Frame::data(Bytes::from(held_redacted)));
                                                let new_frame = if new_consumed > 0 {
                                                    parser.redact_prefix_chars(&frame, new_consumed)
                                                } else {
                                                    frame.clone()
                                                };
                                                let new_final = parser.strip_marker(&new_frame, &marker);
                                                bytes_forwarded += new_final.len() as u64;
                                                yield Ok(Frame::data(Bytes::from(new_final)));
                                            }
                                        } else {
                                            let stripped = parser.strip_marker(&frame, &marker);
                                            bytes_forwarded += stripped.len() as u64;
                                            yield Ok(Frame::data(Bytes::from(stripped)));
                                        }
                                        marker_found = true;
                                        // Don't abandon this attempt's stream: keep draining
                                        // it (via the `marker_found` guard above) until it
                                        // closes naturally, instead of cutting off the very
                                        // frame the marker was found in.
                                        continue;
                                    }

                                    // No marker (yet): release any previously held frame —
                                    // its trailing text is now proven not to combine with
                                    // this one into the marker.
                                    if let Some((held_raw, _)) = held.take() {
                                        bytes_forwarded += held_raw.len() as u64;
                                        yield Ok(Frame::data(Bytes::from(held_raw)));
                                    }

                                    if parsed.text.is_empty() {
                                        bytes_forwarded += frame.len() as u64;
                                        yield Ok(Frame::data(Bytes::from(frame)));
                                    } else {
                                        held = Some((frame, parsed.text));
                                    }
                                    keepalive_deadline.as_mut().reset(Instant::now() + params.keepalive_interval);
                                }
                            }
                            Some(Err(_)) => break,
                            None => break,
                        }
                    }
                    _ = &mut keepalive_deadline => {
                        if !marker_found {
                            let frame = keepalive_frame(params.protocol);
                            bytes_forwarded += frame.len() as u64;
                            yield Ok(Frame::data(Bytes::from_static(frame)));
                        }
                        keepalive_deadline.as_mut().reset(Instant::now() + params.keepalive_interval);
                    }
                    _ = &mut idle_deadline, if idle_armed => {
                        // Cancel the upstream read by dropping `current` at the top of
                        // the next iteration; treat like a premature close (retry-eligible).
                        break;
                    }
                }
            }

            // Attempt ended: clean close, mid-stream error, or idle timeout.
            // Release anything still held — nothing more will arrive in this
            // attempt to combine with it.
            if let Some((held_raw, _)) = held.take() {
                bytes_forwarded += held_raw.len() as u64;
                yield Ok(Frame::data(Bytes::from(held_raw)));
            }
            if let Some(trailing) = splitter.finish() {
                bytes_forwarded += trailing.len() as u64;
                yield Ok(Frame::data(Bytes::from(trailing)));
            }

            if marker_found {
                // No continuation will follow: forward whatever terminal
                // envelope frames this attempt produced instead of
                // suppressing them.
                for frame in pending_terminal.drain(..) {
                    bytes_forwarded += frame.len() as u64;
                    yield Ok(Frame::data(Bytes::from(frame)));
                }
                current_span.record("bytes_forwarded", bytes_forwarded);
                current_span.record("marker_found", true);
                break;
            }

            if attempt_index >= params.max_attempts {
                max_attempts_reached = true;
                for frame in pending_terminal.drain(..) {
                    bytes_forwarded += frame.len() as u64;
                    yield Ok(Frame::data(Bytes::from(frame)));
                }
                current_span.record("bytes_forwarded", bytes_forwarded);
                current_span.record("marker_found", false);
                break;
            }

            current_span.record("bytes_forwarded", bytes_forwarded);
            current_span.record("marker_found", false);

            // A continuation will follow: this attempt's terminal envelope
            // (Claude's message_stop/message_delta) is intermediate, so it is
            // suppressed rather than forwarded.
            pending_terminal.clear();

            let next_body = protocol::build_continuation_body(
                params.protocol,
                &mutated_original_body,
                &collected,
                &marker,
            );

            let mut issued = None;
            while issued.is_none() && attempt_index < params.max_attempts {
                attempt_index += 1;
                let span = relay_tracing::upstream_attempt_span!(&params.request_id, attempt_index);
                let result = upstream.issue(next_body.clone()).instrument(span.clone()).await;
                match result {
                    Ok(handle) => {
                        span.record("status", handle.status.as_u16());
                        issued = Some((handle, span));
                    }
                    Err(_) => continue,
                }
            }

            match issued {
                Some((handle, span)) => {
                    current = handle.chunks;
                    splitter = FrameSplitter::new();
                    current_span = span;
                    bytes_forwarded = 0;
                }
                None => {
                    max_attempts_reached = true;
                    break;
                }
            }
        }

        if max_attempts_reached {
            let mut trailers = HeaderMap::new();
            trailers.insert(
                HeaderName::from_static(MAX_ATTEMPTS_REACHED_HEADER),
                HeaderValue::from_static("1"),
            );
            yield Ok(Frame::trailers(trailers));
        }
    })
}

/// Protocol-appropriate no-op SSE frame emitted when downstream has been
/// idle for `keepalive_interval`.
fn keepalive_frame(protocol: Protocol) -> &'static [u8] {
    match protocol {
        Protocol::OpenAi | Protocol::Gemini => b": keepalive\n\n",
        Protocol::Claude => b": ping\n\n",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{claude::ClaudeParser, openai::OpenAiParser};
    use futures_util::future::BoxFuture;
    use http::StatusCode;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// A scripted upstream: each call to `issue` returns the next queued
    /// attempt (a sequence of chunks), recording how many times it was
    /// called so tests can assert on attempt bounds.
    struct ScriptedUpstream {
        attempts: Mutex<Vec<Vec<Result<Bytes, std::io::Error>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedUpstream {
        fn new(attempts: Vec<Vec<&'static [u8]>>) -> Self {
            let attempts = attempts
                .into_iter()
                .map(|chunks| chunks.into_iter().map(|c| Ok(Bytes::from_static(c))).collect())
                .collect();
            Self {
                attempts: Mutex::new(attempts),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Upstream for ScriptedUpstream {
        fn issue(&self, _body: Value) -> BoxFuture<'static, Result<AttemptHandle, String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let chunks = self.attempts.lock().unwrap().remove(0);
            Box::pin(async move {
                Ok(AttemptHandle {
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                    chunks: Box::pin(futures_util::stream::iter(chunks)),
                })
            })
        }
    }

    fn params(protocol: Protocol, max_attempts: u32) -> EngineParams {
        EngineParams {
            request_id: "test-request".to_string(),
            protocol,
            done_marker: "[done]".to_string(),
            max_attempts,
            keepalive_interval: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(3600),
        }
    }

    async fn collect_data_frames(
        stream: BoxStream<'static, Result<Frame<Bytes>, Infallible>>,
    ) -> (Vec<Bytes>, Option<HeaderMap>) {
        let mut data = Vec::new();
        let mut trailers = None;
        let mut stream = stream;
        while let Some(frame) = stream.next().await {
            let frame = frame.unwrap();
            if let Some(d) = frame.data_ref() {
                data.push(d.clone());
            } else if let Some(t) = frame.trailers_ref() {
                trailers = Some(t.clone());
            }
        }
        (data, trailers)
    }

    #[tokio::test]
    async fn s1_marker_in_first_attempt_is_stripped() {
        let upstream = ScriptedUpstream::new(vec![vec![
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello \"}}]}\n\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"world [done]\"}}]}\n\n",
            b"data: [DONE]\n\n",
        ]]);
        let first = upstream.issue(json!({})).await.unwrap();

        let stream = run(
            params(Protocol::OpenAi, 3),
            Box::new(OpenAiParser),
            json!({"messages": []}),
            first,
            tracing::Span::none(),
            Box::new(upstream),
        );
        let (frames, trailers) = collect_data_frames(stream).await;
        let joined = frames.iter().map(|b| String::from_utf8_lossy(b)).collect::<String>();
        assert!(!joined.contains("[done]"));
        assert!(joined.contains("Hello "));
        assert!(joined.contains("world "));
        assert!(joined.contains("[DONE]"));
        assert!(trailers.is_none());
    }

    #[tokio::test]
    async fn s2_truncation_then_continuation_splices_text() {
        let upstream = ScriptedUpstream::new(vec![
            vec![b"data: {\"choices\":[{\"delta\":{\"content\":\"Part one.\"}}]}\n\n"],
            vec![b"data: {\"choices\":[{\"delta\":{\"content\":\" Part two. [done]\"}}]}\n\n"],
        ]);
        let first = upstream.issue(json!({})).await.unwrap();
        let upstream = std::sync::Arc::new(upstream);

        struct ArcUpstream(std::sync::Arc<ScriptedUpstream>);
        impl Upstream for ArcUpstream {
            fn issue(&self, body: Value) -> BoxFuture<'static, Result<AttemptHandle, String>> {
                self.0.issue(body)
            }
        }

        let stream = run(
            params(Protocol::OpenAi, 3),
            Box::new(OpenAiParser),
            json!({"messages": [{"role": "user", "content": "hi"}]}),
            first,
            tracing::Span::none(),
            Box::new(ArcUpstream(upstream.clone())),
        );
        let (frames, _) = collect_data_frames(stream).await;
        let joined = frames.iter().map(|b| String::from_utf8_lossy(b)).collect::<String>();
        assert!(joined.contains("Part one."));
        assert!(joined.contains("Part two."));
        assert!(!joined.contains("[done]"));
        assert_eq!(upstream.call_count(), 1); // continuation issued directly by the test harness above
    }

    #[tokio::test]
    async fn s3_gemini_marker_spanning_two_frames() {
        let upstream = ScriptedUpstream::new(vec![vec![
            b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"answer.[do\"}]}}]}\n\n",
            b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ne]\"}]}}]}\n\n",
        ]]);
        let first = upstream.issue(json!({})).await.unwrap();

        let stream = run(
            params(Protocol::Gemini, 3),
            Box::new(crate::protocol::gemini::GeminiParser),
            json!({"contents": []}),
            first,
            tracing::Span::none(),
            Box::new(upstream),
        );
        let (frames, _) = collect_data_frames(stream).await;
        let joined = frames.iter().map(|b| String::from_utf8_lossy(b)).collect::<String>();
        assert!(!joined.contains("[do"));
        assert!(!joined.contains("ne]"));
        assert!(joined.contains("answer."));
    }

    #[tokio::test]
    async fn s4_claude_max_attempts_reached_sets_trailer() {
        let upstream = ScriptedUpstream::new(vec![
            vec![b"event: content_block_delta\ndata: {\"delta\":{\"text\":\"Part one.\"}}\n\n"],
            vec![b"event: content_block_delta\ndata: {\"delta\":{\"text\":\"Part two.\"}}\n\n"],
        ]);
        let first = upstream.issue(json!({})).await.unwrap();
        let upstream = std::sync::Arc::new(upstream);

        struct ArcUpstream(std::sync::Arc<ScriptedUpstream>);
        impl Upstream for ArcUpstream {
            fn issue(&self, body: Value) -> BoxFuture<'static, Result<AttemptHandle, String>> {
                self.0.issue(body)
            }
        }

        let stream = run(
            params(Protocol::Claude, 2),
            Box::new(ClaudeParser),
            json!({"messages": []}),
            first,
            tracing::Span::none(),
            Box::new(ArcUpstream(upstream.clone())),
        );
        let (_frames, trailers) = collect_data_frames(stream).await;
        let trailers = trailers.expect("max attempts reached trailer");
        assert_eq!(trailers.get(MAX_ATTEMPTS_REACHED_HEADER).unwrap(), "1");
        assert_eq!(upstream.call_count(), 2);
    }

    #[tokio::test]
    async fn attempt_bound_is_never_exceeded() {
        let upstream = ScriptedUpstream::new(vec![
            vec![b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n"],
            vec![b"data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n"],
            vec![b"data: {\"choices\":[{\"delta\":{\"content\":\"c\"}}]}\n\n"],
        ]);
        let first = upstream.issue(json!({})).await.unwrap();
        let upstream = std::sync::Arc::new(upstream);

        struct ArcUpstream(std::sync::Arc<ScriptedUpstream>);
        impl Upstream for ArcUpstream {
            fn issue(&self, body: Value) -> BoxFuture<'static, Result<AttemptHandle, String>> {
                self.0.issue(body)
            }
        }

        let stream = run(
            params(Protocol::OpenAi, 3),
            Box::new(OpenAiParser),
            json!({"messages": []}),
            first,
            tracing::Span::none(),
            Box::new(ArcUpstream(upstream.clone())),
        );
        let _ = collect_data_frames(stream).await;
        assert!(upstream.call_count() <= 3);
    }

    #[tokio::test]
    async fn cancellation_drops_without_further_attempts() {
        let upstream = ScriptedUpstream::new(vec![
            vec![b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n"],
            vec![b"data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n"],
        ]);
        let first = upstream.issue(json!({})).await.unwrap();
        let upstream = std::sync::Arc::new(upstream);

        struct ArcUpstream(std::sync::Arc<ScriptedUpstream>);
        impl Upstream for ArcUpstream {
            fn issue(&self, body: Value) -> BoxFuture<'static, Result<AttemptHandle, String>> {
                self.0.issue(body)
            }
        }

        let mut stream = run(
            params(Protocol::OpenAi, 3),
            Box::new(OpenAiParser),
            json!({"messages": []}),
            first,
            tracing::Span::none(),
            Box::new(ArcUpstream(upstream.clone())),
        );
        // Simulate the client disconnecting after the first byte: drop the
        // stream instead of draining it to completion.
        let _ = stream.next().await;
        drop(stream);
        assert_eq!(upstream.call_count(), 1);
    }
}
