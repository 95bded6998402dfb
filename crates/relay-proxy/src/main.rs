//! relay-proxy: protocol-preserving anti-truncation relay for OpenAI,
//! Gemini, and Claude streaming APIs.

mod config;
mod correlation;
mod engine;
mod error;
mod headers;
mod protocol;
mod routes;
mod server;
mod sse;
mod trigger;
mod upstream;

use std::time::Duration;

use config::RelayConfig;
use relay_tracing::TracingConfig;
use routes::AppState;

fn main() -> anyhow::Result<()> {
    let config = RelayConfig::load()?;
    let tracing_config = tracing_config_from_env();

    // Build the tokio runtime first — the OTLP gRPC exporter needs a
    // reactor context before it can be initialized.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let _tracing_guard = relay_tracing::init_tracing(&tracing_config);

        tracing::info!(
            listen_address = %config.listen_address,
            max_attempts = config.max_attempts,
            anti_truncation_enabled_default = config.anti_truncation_enabled_default,
            "Starting relay-proxy"
        );

        run(config).await
    })
}

fn tracing_config_from_env() -> TracingConfig {
    let mut cfg = TracingConfig::default();
    if let Ok(v) = std::env::var("SERVICE_NAME") {
        cfg.service_name = v;
    }
    if let Ok(v) = std::env::var("OTLP_ENDPOINT") {
        cfg.otlp_endpoint = Some(v);
    }
    if let Ok(v) = std::env::var("OTLP_PROTOCOL") {
        if v.eq_ignore_ascii_case("http") {
            cfg.protocol = relay_tracing::OtlpProtocol::Http;
        }
    }
    if let Ok(v) = std::env::var("LOG_LEVEL") {
        cfg.log_level = v;
    }
    cfg
}

async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .connect_timeout(config.connect_timeout)
        .build()?;

    let listen_port = config
        .listen_address
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse::<u16>().ok());

    let state = AppState {
        config: std::sync::Arc::new(config),
        client,
        listen_port,
    };

    server::run(state).await
}
