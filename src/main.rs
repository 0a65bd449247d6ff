use std::net::SocketAddr;
use std::time::Duration;

use ipnet::IpNet;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse::<u64>().ok()
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse::<usize>().ok()
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_bool(name: &str) -> anyhow::Result<Option<bool>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    let s = raw.trim();
    if s.is_empty() {
        return Ok(None);
    }

    let normalized = s.to_ascii_lowercase();
    let value = match normalized.as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            return Err(anyhow::anyhow!(
                "invalid boolean value for {name}: {raw:?} (expected true/false)"
            ));
        }
    };

    Ok(Some(value))
}

fn parse_trusted_proxy_cidrs(raw: &str) -> anyhow::Result<Vec<IpNet>> {
    let mut out = Vec::new();
    for part in raw.split(',') {
        for token in part.split_whitespace() {
            let net = token.parse::<IpNet>().map_err(|e| {
                anyhow::anyhow!("invalid CIDR in TRUSTED_PROXY_CIDRS: {token:?}: {e}")
            })?;
            out.push(net);
        }
    }
    Ok(out)
}

fn config_from_env() -> anyhow::Result<chat_gateway::AppConfig> {
    let mut cfg = chat_gateway::AppConfig::default();

    if let Some(value) = env_usize("MAX_REQUEST_BYTES") {
        cfg.max_request_bytes = value;
    }
    cfg.backend_url = env_string("BACKEND_URL");
    if let Some(value) = env_usize("RATE_LIMIT_MAX_REQUESTS") {
        cfg.rate_limit_max_requests = value;
    }
    if let Some(secs) = env_u64("RATE_LIMIT_WINDOW_SECS") {
        cfg.rate_limit_window = Duration::from_secs(secs);
    }
    if let Some(value) = env_usize("RATE_LIMIT_SHARDS") {
        cfg.rate_limit_shards = value;
    }
    if let Some(ms) = env_u64("BACKEND_CONNECT_TIMEOUT_MS") {
        cfg.backend_connect_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = env_u64("BACKEND_TIMEOUT_MS") {
        cfg.backend_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = env_u64("BACKEND_STREAM_IDLE_TIMEOUT_MS") {
        cfg.backend_stream_idle_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = env_u64("ECHO_CHUNK_DELAY_MS") {
        cfg.echo_chunk_delay = Duration::from_millis(ms);
    }

    if let Some(trust) = env_bool("TRUST_PROXY_HEADERS")? {
        cfg.trust_proxy_headers = trust;
    }
    if cfg.trust_proxy_headers {
        if let Some(raw) = env_string("TRUSTED_PROXY_CIDRS") {
            cfg.trusted_proxy_cidrs = parse_trusted_proxy_cidrs(&raw)?;
        }
    }

    Ok(cfg)
}

fn listen_addr() -> anyhow::Result<SocketAddr> {
    if let Some(addr) = env_string("LISTEN_ADDR") {
        return Ok(addr.parse()?);
    }
    let port = env_string("PORT")
        .map(|raw| raw.parse::<u16>())
        .transpose()?
        .unwrap_or(8080);
    Ok(SocketAddr::from(([0, 0, 0, 0], port)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let listen = listen_addr()?;
    let state = chat_gateway::AppState::new(config_from_env()?)?;
    let config = state.config();
    tracing::info!(
        mode = state.mode(),
        backend_url = ?config.backend_url,
        rate_limit_max_requests = config.rate_limit_max_requests,
        rate_limit_window_secs = config.rate_limit_window.as_secs(),
        "gateway configured"
    );
    let app = chat_gateway::app(state);

    let listener = TcpListener::bind(listen).await?;
    tracing::info!(%listen, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
