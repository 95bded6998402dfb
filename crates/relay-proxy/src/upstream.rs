//! The upstream HTTP transport abstraction the engine drives attempts through.
//!
//! `Upstream::issue` is the only seam between the anti-truncation engine and
//! a real network connection — it exists so `engine::run` can be driven in
//! tests against an in-memory fake without spinning up a server. Production
//! code only ever constructs [`ReqwestUpstream`].

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use http::{HeaderMap, StatusCode};
use serde_json::Value;

/// One streaming upstream response: status/headers available immediately,
/// body bytes arriving incrementally.
pub struct AttemptHandle {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub chunks: BoxStream<'static, Result<Bytes, std::io::Error>>,
}

/// Issues one streaming HTTP attempt per call, given the JSON request body
/// for that attempt. Implementations own whatever is fixed across attempts
/// (URL, auth headers, client) and vary only the body.
pub trait Upstream: Send + Sync {
    fn issue(&self, body: Value) -> BoxFuture<'static, Result<AttemptHandle, String>>;
}

/// Production [`Upstream`] backed by a shared `reqwest::Client`.
pub struct ReqwestUpstream {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
}

impl ReqwestUpstream {
    pub fn new(client: reqwest::Client, url: String, headers: HeaderMap) -> Self {
        Self { client, url, headers }
    }
}

impl Upstream for ReqwestUpstream {
    fn issue(&self, body: Value) -> BoxFuture<'static, Result<AttemptHandle, String>> {
        let client = self.client.clone();
        let url = self.url.clone();
        let headers = self.headers.clone();
        Box::pin(async move {
            let payload = serde_json::to_vec(&body).map_err(|e| e.to_string())?;
            let mut builder = client.post(&url).body(payload);
            for (name, value) in headers.iter() {
                builder = builder.header(name, value);
            }
            let resp = builder.send().await.map_err(|e| e.to_string())?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let chunks = resp
                .bytes_stream()
                .map(|r| r.map_err(|e| std::io::Error::other(e.to_string())));
            Ok(AttemptHandle {
                status,
                headers,
                chunks: Box::pin(chunks),
            })
        })
    }
}
