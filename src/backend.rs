//! The remote inference service the forwarding generator talks to.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::correlation::{CorrelationId, REQUEST_ID_HEADER};
use crate::types::ChatCompletionRequest;
use crate::AppConfig;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned status {0}")]
    Status(StatusCode),
    #[error("backend sent an undecodable body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("backend response carried no message content")]
    MissingContent,
    #[error("backend reported an error: {0}")]
    Upstream(String),
    #[error("backend timed out")]
    Timeout,
    #[error("backend sent an event line longer than {0} bytes")]
    Oversized(usize),
    #[error("backend call cancelled")]
    Cancelled,
}

pub type TokenStream = BoxStream<'static, Result<String, BackendError>>;

pub enum BackendReply {
    Complete(String),
    Stream(TokenStream),
}

impl std::fmt::Debug for BackendReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendReply::Complete(text) => f.debug_tuple("Complete").field(text).finish(),
            BackendReply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Sends the request upstream. Streams are requested when `request.stream`
    /// is set; implementations should give up once `cancel` fires.
    async fn invoke(
        &self,
        request: &ChatCompletionRequest,
        id: &CorrelationId,
        cancel: CancellationToken,
    ) -> Result<BackendReply, BackendError>;
}

/// OpenAI-compatible backend reached over HTTP.
#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: Client,
    url: String,
    timeout: Duration,
    stream_idle_timeout: Duration,
    max_line_bytes: usize,
}

impl HttpBackend {
    pub fn new(url: impl Into<String>, config: &AppConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.backend_connect_timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            timeout: config.backend_timeout,
            stream_idle_timeout: config.backend_stream_idle_timeout,
            max_line_bytes: config.max_request_bytes,
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn invoke(
        &self,
        request: &ChatCompletionRequest,
        id: &CorrelationId,
        cancel: CancellationToken,
    ) -> Result<BackendReply, BackendError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let req = self
            .client
            .post(&self.url)
            .header(REQUEST_ID_HEADER, id.as_str())
            .json(request);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            res = tokio::time::timeout_at(deadline, req.send()) => match res {
                Err(_) => return Err(BackendError::Timeout),
                Ok(res) => res?,
            },
        };

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status(status));
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));

        if request.stream && is_event_stream {
            let body = response.bytes_stream().boxed();
            let tokens = sse_tokens(body, self.stream_idle_timeout, self.max_line_bytes)
                .take_until(cancel.cancelled_owned())
                .boxed();
            return Ok(BackendReply::Stream(tokens));
        }

        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            res = tokio::time::timeout_at(deadline, response.bytes()) => match res {
                Err(_) => return Err(BackendError::Timeout),
                Ok(res) => res?,
            },
        };
        let payload: Value = serde_json::from_slice(&body)?;
        message_content(&payload).map(BackendReply::Complete)
    }
}

fn message_content(payload: &Value) -> Result<String, BackendError> {
    payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or(BackendError::MissingContent)
}

struct SseReader {
    body: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    buf: Vec<u8>,
    pending: VecDeque<Result<String, BackendError>>,
    idle_timeout: Duration,
    max_line_bytes: usize,
    finished: bool,
}

impl SseReader {
    /// Consumes every complete line in the buffer.
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.handle_line(&line);
            if self.finished {
                return;
            }
        }
    }

    fn handle_line(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            self.finished = true;
            return;
        }

        match serde_json::from_str::<Value>(data) {
            Ok(event) => {
                if let Some(err) = event.get("error") {
                    let message = err
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string();
                    self.pending.push_back(Err(BackendError::Upstream(message)));
                    self.finished = true;
                    return;
                }
                if let Some(content) = event
                    .pointer("/choices/0/delta/content")
                    .and_then(Value::as_str)
                    .filter(|content| !content.is_empty())
                {
                    self.pending.push_back(Ok(content.to_string()));
                }
            }
            Err(err) => {
                self.pending.push_back(Err(BackendError::Decode(err)));
                self.finished = true;
            }
        }
    }
}

/// Turns an upstream event-stream body into the sequence of delta contents.
fn sse_tokens(
    body: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    idle_timeout: Duration,
    max_line_bytes: usize,
) -> TokenStream {
    let reader = SseReader {
        body,
        buf: Vec::new(),
        pending: VecDeque::new(),
        idle_timeout,
        max_line_bytes,
        finished: false,
    };

    stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(item) = reader.pending.pop_front() {
                return Some((item, reader));
            }
            if reader.finished {
                return None;
            }

            match tokio::time::timeout(reader.idle_timeout, reader.body.next()).await {
                Err(_) => {
                    reader.finished = true;
                    reader.pending.push_back(Err(BackendError::Timeout));
                }
                Ok(Some(Err(err))) => {
                    reader.finished = true;
                    reader.pending.push_back(Err(BackendError::Transport(err)));
                }
                Ok(Some(Ok(chunk))) => {
                    reader.buf.extend_from_slice(&chunk);
                    reader.drain_lines();
                    // Whatever is left is an unterminated line.
                    if !reader.finished && reader.buf.len() > reader.max_line_bytes {
                        reader.finished = true;
                        reader.buf.clear();
                        let err = BackendError::Oversized(reader.max_line_bytes);
                        reader.pending.push_back(Err(err));
                    }
                }
                Ok(None) => {
                    // A final line may lack its newline.
                    if !reader.buf.is_empty() {
                        let rest = std::mem::take(&mut reader.buf);
                        reader.handle_line(&rest);
                    }
                    reader.finished = true;
                }
            }
        }
    })
    .boxed()
}
