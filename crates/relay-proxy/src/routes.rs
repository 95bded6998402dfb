//! Route handlers: one thin adapter per upstream wire protocol,
//! binding a URL to a [`Protocol`], then dispatching through the shared
//! trigger/mutation/engine pipeline every protocol shares.
//!
//! Gemini's path shape (`/v1/models/{model}:generateContent`) glues a
//! literal action suffix onto the end of a dynamic segment, which the
//! router cannot express as a named param — so the Gemini routes take the
//! whole trailing path as a wildcard and parse the suffix by hand.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body::Frame;
use http_body_util::StreamBody;
use serde_json::Value;
use tracing::Instrument;

use crate::config::RelayConfig;
use crate::correlation::{self, REQUEST_ID_HEADER};
use crate::engine::{self, EngineParams};
use crate::error::{error_response, RelayError};
use crate::headers as header_pipeline;
use crate::headers::HOP_BY_HOP_HEADERS;
use crate::protocol::{self, Protocol};
use crate::trigger::{self, Enablement};
use crate::upstream::{AttemptHandle, ReqwestUpstream, Upstream};

/// Shared application state, built once in `main::run`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub client: reqwest::Client,
    /// The relay's own listening port, used for `X-Forwarded-Port` —
    /// distinct from `peer_addr`'s ephemeral source port.
    pub listen_port: Option<u16>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/chat/completions", post(handle_openai))
        .route("/v1/messages", post(handle_claude))
        .route("/v1/models/{*rest}", post(handle_gemini))
        .route("/v1beta/models/{*rest}", post(handle_gemini))
        .fallback(handle_not_found)
        .with_state(Arc::new(state))
}

async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn handle_not_found() -> Response {
    error_response(&RelayError::NotFound, "unknown")
}

async fn handle_openai(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let base = state.config.upstream_openai_base_url.clone();
    handle(state, Protocol::OpenAi, base, "/v1/chat/completions", peer_addr, request, false).await
}

async fn handle_claude(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let base = state.config.upstream_claude_base_url.clone();
    handle(state, Protocol::Claude, base, "/v1/messages", peer_addr, request, false).await
}

async fn handle_gemini(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let base = state.config.upstream_gemini_base_url.clone();
    let path = request.uri().path().to_string();
    let is_stream_suffixed = path.ends_with(":streamGenerateContent");
    handle(state, Protocol::Gemini, base, &path, peer_addr, request, is_stream_suffixed).await
}

/// Entry point shared by all three protocol handlers: opens the
/// request-scoped span the teacher's `proxy_request_span!` idiom uses, runs
/// the pipeline inside it, then records the fields only known once the
/// response is built (status, latency, whether the engine engaged).
#[allow(clippy::too_many_arguments)]
async fn handle(
    state: Arc<AppState>,
    protocol: Protocol,
    upstream_base: String,
    upstream_path: &str,
    peer_addr: SocketAddr,
    request: Request,
    gemini_stream_suffixed: bool,
) -> Response {
    let request_id = correlation::generate_id();
    let span = relay_tracing::relay_request_span!(&request_id, protocol.as_str(), upstream_path);
    let start = std::time::Instant::now();

    async move {
        let response = handle_inner(
            state,
            protocol,
            upstream_base,
            upstream_path,
            peer_addr,
            request,
            gemini_stream_suffixed,
            &request_id,
        )
        .await;

        let current = tracing::Span::current();
        current.record("status", response.status().as_u16());
        current.record("latency_ms", start.elapsed().as_millis() as u64);
        if response.headers().contains_key("x-anti-truncation") {
            current.record("anti_truncation", "enabled");
        }
        response
    }
    .instrument(span)
    .await
}

/// Shared per-request pipeline: read the body, evaluate triggers, mutate
/// the request, and either pass it straight through or hand it to the
/// anti-truncation engine.
#[allow(clippy::too_many_arguments)]
async fn handle_inner(
    state: Arc<AppState>,
    protocol: Protocol,
    upstream_base: String,
    upstream_path: &str,
    peer_addr: SocketAddr,
    request: Request,
    gemini_stream_suffixed: bool,
    request_id: &str,
) -> Response {
    let (parts, body) = request.into_parts();
    let inbound_headers = parts.headers;
    let query = parts.uri.query().map(|q| format!("?{q}")).unwrap_or_default();

    let body_bytes = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(b) => b,
        Err(_) => return error_response(&RelayError::PayloadTooLarge, request_id),
    };

    let mut body: Value = match serde_json::from_slice(&body_bytes) {
        Ok(v) => v,
        Err(e) => return error_response(&RelayError::BadRequest(e.to_string()), request_id),
    };

    let is_streaming = trigger::is_streaming_request(protocol, &body, gemini_stream_suffixed);
    let enablement = trigger::evaluate(protocol, &body, &inbound_headers, &query, is_streaming, &state.config);

    let client_ip = header_pipeline::resolve_client_ip(peer_addr.ip(), &inbound_headers, &state.config);
    let scheme = inbound_headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("https")
        .to_string();
    let host = inbound_headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut upstream_headers = header_pipeline::build_upstream_headers(
        &inbound_headers,
        client_ip,
        &scheme,
        &host,
        state.listen_port,
    );
    upstream_headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let upstream_url = format!("{upstream_base}{upstream_path}{query}");

    match enablement {
        Enablement::Disabled => {
            pass_through(&state, &upstream_url, upstream_headers, body_bytes, request_id).await
        }
        Enablement::IgnoredNonStreaming => {
            let mut response =
                pass_through(&state, &upstream_url, upstream_headers, body_bytes, request_id).await;
            response
                .headers_mut()
                .insert("x-anti-truncation-ignored", HeaderValue::from_static("non-streaming"));
            response
        }
        Enablement::Enabled { stripped_model } => {
            if let Some(model) = stripped_model {
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("model".to_string(), Value::String(model));
                }
            }
            protocol::inject_done_marker(protocol, &mut body, &state.config.done_marker);

            let upstream = ReqwestUpstream::new(state.client.clone(), upstream_url, upstream_headers);
            let attempt_span = relay_tracing::upstream_attempt_span!(request_id, 1u32);
            let first = match upstream.issue(body.clone()).instrument(attempt_span.clone()).await {
                Ok(handle) => {
                    attempt_span.record("status", handle.status.as_u16());
                    handle
                }
                Err(e) => return error_response(&RelayError::UpstreamConnect(e), request_id),
            };

            if !first.status.is_success() {
                return forward_attempt_verbatim(first, request_id);
            }

            let content_type = first.headers.get(http::header::CONTENT_TYPE).cloned();
            let parser = protocol::parser_for(protocol);
            let engine_params = EngineParams {
                request_id: request_id.to_string(),
                protocol,
                done_marker: state.config.done_marker.clone(),
                max_attempts: state.config.max_attempts,
                keepalive_interval: state.config.keepalive_interval,
                idle_timeout: state.config.upstream_idle_timeout,
            };
            let body_stream = engine::run(engine_params, parser, body, first, attempt_span, Box::new(upstream));
            build_streaming_response(body_stream, request_id, content_type)
        }
    }
}

/// Issue one request directly and relay the upstream response byte for
/// byte — used whenever anti-truncation is not in play, streaming or not.
async fn pass_through(
    state: &AppState,
    upstream_url: &str,
    upstream_headers: HeaderMap,
    body_bytes: Bytes,
    request_id: &str,
) -> Response {
    let mut builder = state.client.post(upstream_url).body(body_bytes);
    for (name, value) in upstream_headers.iter() {
        builder = builder.header(name, value);
    }
    let resp = match builder.send().await {
        Ok(r) => r,
        Err(e) if e.is_timeout() => return error_response(&RelayError::UpstreamTimeout, request_id),
        Err(e) => return error_response(&RelayError::UpstreamConnect(e.to_string()), request_id),
    };
    relay_reqwest_response(resp, request_id)
}

fn relay_reqwest_response(resp: reqwest::Response, request_id: &str) -> Response {
    let status = resp.status();
    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in resp.headers().iter() {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str().to_lowercase().as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder.header(REQUEST_ID_HEADER, request_id);
    let body = axum::body::Body::from_stream(resp.bytes_stream());
    builder
        .body(body)
        .unwrap_or_else(|_| error_response(&RelayError::Internal("failed to build response".into()), request_id))
}

/// Forward an already-open, non-2xx first attempt verbatim — anti-truncation
/// never engages on a rejected request.
fn forward_attempt_verbatim(first: AttemptHandle, request_id: &str) -> Response {
    let mut builder = Response::builder().status(first.status.as_u16());
    for (name, value) in first.headers.iter() {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str().to_lowercase().as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder.header(REQUEST_ID_HEADER, request_id);
    let body = axum::body::Body::from_stream(first.chunks);
    builder
        .body(body)
        .unwrap_or_else(|_| error_response(&RelayError::Internal("failed to build response".into()), request_id))
}

/// Build the client-visible response for an anti-truncation-engaged
/// request. `X-Anti-Truncation-Max-Attempts-Reached` is declared as a
/// trailer up front — its value is only known once the stream closes.
fn build_streaming_response(
    body_stream: futures_util::stream::BoxStream<'static, Result<Frame<Bytes>, std::convert::Infallible>>,
    request_id: &str,
    content_type: Option<HeaderValue>,
) -> Response {
    let body = axum::body::Body::new(StreamBody::new(body_stream));
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(REQUEST_ID_HEADER, request_id)
        .header("x-anti-truncation", "enabled")
        .header("trailer", engine::MAX_ATTEMPTS_REACHED_HEADER);
    builder = builder.header(
        http::header::CONTENT_TYPE,
        content_type.unwrap_or_else(|| HeaderValue::from_static("text/event-stream")),
    );
    builder
        .body(body)
        .unwrap_or_else(|_| error_response(&RelayError::Internal("failed to build response".into()), request_id))
}
