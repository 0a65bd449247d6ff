use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::{Body, Bytes};
use axum::extract::rejection::{BytesRejection, FailedToBufferBody};
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub mod backend;
pub mod correlation;
pub mod error;
pub mod generate;
pub mod rate_limit;
pub mod stream;
pub mod types;
pub mod validate;

use crate::backend::{Backend, HttpBackend};
use crate::correlation::{CorrelationId, IdSource, RandomIdSource, REQUEST_ID_HEADER};
use crate::error::{GatewayError, ValidationError};
use crate::generate::{EchoGenerator, ForwardingGenerator, FragmentStream, Generator};
use crate::rate_limit::{Clock, RateDecision, RateLimiter, SystemClock};
use crate::stream::ChunkEnvelope;
use crate::types::{ChatCompletionRequest, ChatCompletionResponse, Usage};

#[derive(Clone)]
pub struct AppState {
    config: AppConfig,
    limiter: Arc<RateLimiter>,
    generator: Arc<Generator>,
    ids: Arc<dyn IdSource>,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub max_request_bytes: usize,
    /// Full URL of the upstream chat completions endpoint. Unset means echo mode.
    pub backend_url: Option<String>,
    pub rate_limit_max_requests: usize,
    pub rate_limit_window: Duration,
    pub rate_limit_shards: usize,
    pub backend_connect_timeout: Duration,
    pub backend_timeout: Duration,
    pub backend_stream_idle_timeout: Duration,
    pub echo_chunk_delay: Duration,
    pub trust_proxy_headers: bool,
    pub trusted_proxy_cidrs: Vec<IpNet>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_request_bytes: 1_048_576,
            backend_url: None,
            rate_limit_max_requests: 5,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_shards: 16,
            backend_connect_timeout: Duration::from_millis(2_000),
            backend_timeout: Duration::from_millis(10_000),
            backend_stream_idle_timeout: Duration::from_millis(30_000),
            echo_chunk_delay: Duration::from_millis(50),
            trust_proxy_headers: false,
            trusted_proxy_cidrs: Vec::new(),
        }
    }
}

impl AppState {
    /// Builds the shared state. The generator is chosen here, once: forwarding
    /// when `backend_url` is set, echo otherwise.
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let generator = match config.backend_url.as_deref() {
            Some(url) => {
                let backend = HttpBackend::new(url, &config)?;
                Generator::Forwarding(ForwardingGenerator::new(Arc::new(backend)))
            }
            None => Generator::Echo(EchoGenerator::new(config.echo_chunk_delay)),
        };
        let limiter = Self::build_limiter(&config, Arc::new(SystemClock));

        Ok(Self {
            config,
            limiter: Arc::new(limiter),
            generator: Arc::new(generator),
            ids: Arc::new(RandomIdSource),
        })
    }

    /// Replaces the generator with one that forwards to `backend`.
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.generator = Arc::new(Generator::Forwarding(ForwardingGenerator::new(backend)));
        self
    }

    /// Rebuilds the rate limiter on top of `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.limiter = Arc::new(Self::build_limiter(&self.config, clock));
        self
    }

    pub fn with_id_source(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = ids;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn mode(&self) -> &'static str {
        self.generator.mode()
    }

    fn build_limiter(config: &AppConfig, clock: Arc<dyn Clock>) -> RateLimiter {
        RateLimiter::new(
            config.rate_limit_max_requests,
            config.rate_limit_window,
            config.rate_limit_shards,
            clock,
        )
    }
}

pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.config.max_request_bytes;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn chat_completions(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            return GatewayError::from(body_rejection_error(rejection)).into_response();
        }
    };

    let request = match validate::validate(&body) {
        Ok(request) => request,
        Err(err) => {
            let err = GatewayError::from(err);
            err.log(None);
            return err.into_response();
        }
    };

    let client = client_identifier(&state.config, &headers, &connect_info);
    if let RateDecision::Limited { retry_after } = state.limiter.check(&client) {
        tracing::info!(
            client = %client,
            retry_after_ms = retry_after.as_millis() as u64,
            "client exceeded rate limit"
        );
        return GatewayError::RateLimited { retry_after }.into_response();
    }

    let inbound_id = correlation::request_id_header(&headers);
    let id = correlation::resolve(inbound_id.as_deref(), state.ids.as_ref());

    let mut resp = match respond(&state, request, &id).await {
        Ok(resp) => resp,
        Err(err) => {
            err.log(Some(id.as_str()));
            err.into_response()
        }
    };
    if let Ok(value) = HeaderValue::from_str(id.as_str()) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    resp
}

async fn respond(
    state: &AppState,
    request: ChatCompletionRequest,
    id: &CorrelationId,
) -> Result<Response, GatewayError> {
    let cancel = CancellationToken::new();
    let created = unix_timestamp();
    tracing::info!(
        request_id = %id,
        mode = state.mode(),
        stream = request.stream,
        messages = request.messages.len(),
        "generating completion"
    );
    let fragments = state.generator.generate(&request, id, &cancel).await?;

    if request.stream {
        let envelope = ChunkEnvelope {
            id: id.clone(),
            created,
            model: request.model,
        };
        let frames = stream::encode(fragments, envelope, Some(cancel.drop_guard()));
        return Ok(event_stream_response(frames));
    }

    let _cancel_on_drop = cancel.drop_guard();
    let content = collect_content(fragments).await?;
    let usage = Usage::from_text(request.last_user_content().unwrap_or_default(), &content);
    let completion =
        ChatCompletionResponse::new(id.to_string(), created, request.model, content, usage);
    let body = serde_json::to_vec(&completion)?;

    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response())
}

/// Joins the fragments of a non-streamed reply into its full content.
async fn collect_content(mut fragments: FragmentStream) -> Result<String, GatewayError> {
    let mut content = String::new();
    while let Some(fragment) = fragments.next().await {
        content.push_str(fragment?.text());
    }
    Ok(content)
}

fn event_stream_response<S>(frames: S) -> Response
where
    S: futures_util::Stream<Item = Result<Bytes, std::convert::Infallible>> + Send + 'static,
{
    let mut resp = Response::new(Body::from_stream(frames));
    *resp.status_mut() = StatusCode::OK;
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    resp.headers_mut().insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    resp
}

fn body_rejection_error(rejection: BytesRejection) -> ValidationError {
    match rejection {
        BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_)) => {
            ValidationError::new("request_too_large", "request body too large")
        }
        _ => ValidationError::new("invalid_body", "failed to read request body"),
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

fn parse_leftmost_x_forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let raw = headers.get("x-forwarded-for")?.to_str().ok()?;
    let first = raw.split(',').next()?.trim();
    if first.is_empty() {
        return None;
    }
    if let Ok(ip) = first.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(addr) = first.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    None
}

fn is_trusted_proxy(peer_ip: IpAddr, trusted: &[IpNet]) -> bool {
    trusted.iter().any(|net| net.contains(&peer_ip))
}

/// The key a client's rate window is tracked under: its address, as seen
/// directly or through a trusted proxy.
fn client_identifier(
    config: &AppConfig,
    headers: &HeaderMap,
    connect_info: &Option<ConnectInfo<SocketAddr>>,
) -> String {
    let Some(peer_ip) = connect_info.as_ref().map(|ConnectInfo(addr)| addr.ip()) else {
        return "unknown".to_string();
    };

    if !config.trust_proxy_headers || !is_trusted_proxy(peer_ip, &config.trusted_proxy_cidrs) {
        return peer_ip.to_string();
    }

    parse_leftmost_x_forwarded_for(headers)
        .unwrap_or(peer_ip)
        .to_string()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAiErrorResponse {
    pub error: OpenAiError,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAiError {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

pub fn openai_error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    param: Option<&str>,
    code: Option<&str>,
) -> Response {
    let body = OpenAiErrorResponse {
        error: OpenAiError {
            message: message.to_string(),
            error_type: error_type.to_string(),
            param: param.map(ToString::to_string),
            code: code.map(ToString::to_string),
        },
    };
    (status, Json(body)).into_response()
}
