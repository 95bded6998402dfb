//! Span builder helpers for relay request instrumentation.

/// Span for one inbound client request, from route entry to response close.
#[macro_export]
macro_rules! relay_request_span {
    ($request_id:expr, $protocol:expr, $path:expr) => {
        tracing::info_span!(
            "relay_request",
            request_id = %$request_id,
            protocol = %$protocol,
            path = %$path,
            anti_truncation = tracing::field::Empty,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}

/// Span for a single upstream attempt within an anti-truncation run.
#[macro_export]
macro_rules! upstream_attempt_span {
    ($request_id:expr, $attempt:expr) => {
        tracing::info_span!(
            "upstream_attempt",
            request_id = %$request_id,
            attempt = $attempt,
            status = tracing::field::Empty,
            bytes_forwarded = tracing::field::Empty,
            marker_found = tracing::field::Empty,
        )
    };
}
