//! Configuration types and loading logic.
//!
//! Every field is sourced from an environment variable; there is no config
//! file. `Env::raw()` maps env var names onto struct fields verbatim via
//! `#[serde(rename)]`, the way `cc-proxy`'s `ProxyConfig::load` layers
//! `figment` providers, just without the TOML layer this relay doesn't need.

use std::time::Duration;

use figment::providers::Env;
use figment::Figment;
use ipnet::IpNet;
use serde::Deserialize;

/// Raw, unvalidated shape of the environment. Every field name matches the
/// external env var name exactly.
#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(rename = "UPSTREAM_OPENAI_BASE_URL")]
    upstream_openai_base_url: String,
    #[serde(rename = "UPSTREAM_GEMINI_BASE_URL")]
    upstream_gemini_base_url: String,
    #[serde(rename = "UPSTREAM_CLAUDE_BASE_URL")]
    upstream_claude_base_url: String,

    #[serde(rename = "ANTI_TRUNCATION_ENABLED_DEFAULT", default)]
    anti_truncation_enabled_default: bool,
    #[serde(rename = "ANTI_TRUNCATION_MAX_ATTEMPTS", default = "default_max_attempts")]
    anti_truncation_max_attempts: u32,
    #[serde(rename = "ANTI_TRUNCATION_DONE_MARKER", default = "default_done_marker")]
    anti_truncation_done_marker: String,
    #[serde(rename = "ANTI_TRUNCATION_MODEL_PREFIX", default = "default_model_prefix")]
    anti_truncation_model_prefix: String,
    #[serde(
        rename = "ANTI_TRUNCATION_KEEPALIVE_INTERVAL_SECONDS",
        default = "default_keepalive_interval_secs"
    )]
    anti_truncation_keepalive_interval_seconds: u64,
    #[serde(
        rename = "ANTI_TRUNCATION_UPSTREAM_IDLE_TIMEOUT_SECONDS",
        default = "default_idle_timeout_secs"
    )]
    anti_truncation_upstream_idle_timeout_seconds: u64,

    #[serde(rename = "TRUST_PROXY_HEADERS", default)]
    trust_proxy_headers: bool,
    #[serde(rename = "TRUSTED_PROXY_CIDRS", default = "default_trusted_cidrs")]
    trusted_proxy_cidrs: String,

    #[serde(rename = "UPSTREAM_TIMEOUT_SECONDS", default = "default_request_timeout_secs")]
    upstream_timeout_seconds: u64,
    #[serde(
        rename = "UPSTREAM_CONNECT_TIMEOUT_SECONDS",
        default = "default_connect_timeout_secs"
    )]
    upstream_connect_timeout_seconds: u64,
    #[serde(rename = "MAX_BODY_SIZE_MB", default = "default_max_body_size_mb")]
    max_body_size_mb: u64,

    #[serde(rename = "RELAY_LISTEN_ADDRESS", default = "default_listen_address")]
    relay_listen_address: String,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_done_marker() -> String {
    "[done]".to_string()
}
fn default_model_prefix() -> String {
    "流式抗截断/".to_string()
}
fn default_keepalive_interval_secs() -> u64 {
    15
}
fn default_idle_timeout_secs() -> u64 {
    30
}
fn default_trusted_cidrs() -> String {
    "127.0.0.0/8,::1/128,10.0.0.0/8,172.16.0.0/12,192.168.0.0/16".to_string()
}
fn default_request_timeout_secs() -> u64 {
    300
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_max_body_size_mb() -> u64 {
    20
}
fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

/// Immutable, process-wide relay configuration. Built once at startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub upstream_openai_base_url: String,
    pub upstream_gemini_base_url: String,
    pub upstream_claude_base_url: String,

    pub anti_truncation_enabled_default: bool,
    pub max_attempts: u32,
    pub done_marker: String,
    pub model_prefix: String,
    pub keepalive_interval: Duration,
    pub upstream_idle_timeout: Duration,

    pub trust_proxy: bool,
    pub trusted_cidrs: Vec<IpNet>,

    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_body_bytes: usize,

    pub listen_address: String,
}

impl RelayConfig {
    /// Load configuration from the process environment and validate it.
    pub fn load() -> anyhow::Result<Self> {
        let raw: RawConfig = Figment::new().merge(Env::raw()).extract()?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(
            raw.anti_truncation_max_attempts >= 1,
            "ANTI_TRUNCATION_MAX_ATTEMPTS must be >= 1"
        );
        anyhow::ensure!(
            !raw.anti_truncation_done_marker.is_empty(),
            "ANTI_TRUNCATION_DONE_MARKER must be non-empty"
        );
        anyhow::ensure!(
            !raw.anti_truncation_model_prefix.is_empty(),
            "ANTI_TRUNCATION_MODEL_PREFIX must be non-empty"
        );
        anyhow::ensure!(raw.max_body_size_mb > 0, "MAX_BODY_SIZE_MB must be > 0");

        let trusted_cidrs = raw
            .trusted_proxy_cidrs
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<IpNet>().map_err(|e| anyhow::anyhow!("invalid CIDR {s:?}: {e}")))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            upstream_openai_base_url: raw.upstream_openai_base_url,
            upstream_gemini_base_url: raw.upstream_gemini_base_url,
            upstream_claude_base_url: raw.upstream_claude_base_url,

            anti_truncation_enabled_default: raw.anti_truncation_enabled_default,
            max_attempts: raw.anti_truncation_max_attempts,
            done_marker: raw.anti_truncation_done_marker,
            model_prefix: raw.anti_truncation_model_prefix,
            keepalive_interval: Duration::from_secs(raw.anti_truncation_keepalive_interval_seconds),
            upstream_idle_timeout: Duration::from_secs(
                raw.anti_truncation_upstream_idle_timeout_seconds,
            ),

            trust_proxy: raw.trust_proxy_headers,
            trusted_cidrs,

            request_timeout: Duration::from_secs(raw.upstream_timeout_seconds),
            connect_timeout: Duration::from_secs(raw.upstream_connect_timeout_seconds),
            max_body_bytes: (raw.max_body_size_mb * 1024 * 1024) as usize,

            listen_address: raw.relay_listen_address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_raw() -> RawConfig {
        RawConfig {
            upstream_openai_base_url: "https://api.openai.com".into(),
            upstream_gemini_base_url: "https://generativelanguage.googleapis.com".into(),
            upstream_claude_base_url: "https://api.anthropic.com".into(),
            anti_truncation_enabled_default: false,
            anti_truncation_max_attempts: default_max_attempts(),
            anti_truncation_done_marker: default_done_marker(),
            anti_truncation_model_prefix: default_model_prefix(),
            anti_truncation_keepalive_interval_seconds: default_keepalive_interval_secs(),
            anti_truncation_upstream_idle_timeout_seconds: default_idle_timeout_secs(),
            trust_proxy_headers: false,
            trusted_proxy_cidrs: default_trusted_cidrs(),
            upstream_timeout_seconds: default_request_timeout_secs(),
            upstream_connect_timeout_seconds: default_connect_timeout_secs(),
            max_body_size_mb: default_max_body_size_mb(),
            relay_listen_address: default_listen_address(),
        }
    }

    #[test]
    fn defaults_parse_trusted_cidrs() {
        let cfg = RelayConfig::from_raw(base_raw()).expect("valid config");
        assert_eq!(cfg.trusted_cidrs.len(), 5);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.done_marker, "[done]");
    }

    #[test]
    fn rejects_zero_max_attempts() {
        let mut raw = base_raw();
        raw.anti_truncation_max_attempts = 0;
        assert!(RelayConfig::from_raw(raw).is_err());
    }

    #[test]
    fn rejects_empty_done_marker() {
        let mut raw = base_raw();
        raw.anti_truncation_done_marker = String::new();
        assert!(RelayConfig::from_raw(raw).is_err());
    }

    #[test]
    fn rejects_invalid_cidr() {
        let mut raw = base_raw();
        raw.trusted_proxy_cidrs = "not-a-cidr".into();
        assert!(RelayConfig::from_raw(raw).is_err());
    }

    #[test]
    fn max_body_bytes_converts_mb_to_bytes() {
        let mut raw = base_raw();
        raw.max_body_size_mb = 5;
        let cfg = RelayConfig::from_raw(raw).expect("valid config");
        assert_eq!(cfg.max_body_bytes, 5 * 1024 * 1024);
    }
}
