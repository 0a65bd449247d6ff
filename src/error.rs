use std::time::Duration;

use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::backend::BackendError;
use crate::{openai_error_response, OpenAiError, OpenAiErrorResponse};

/// A request the gateway refuses to process because of its shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
    pub param: Option<String>,
}

impl ValidationError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            param: None,
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    /// Unreadable bodies are a 400; well-formed JSON that breaks the schema is a 422.
    pub fn status(&self) -> StatusCode {
        match self.code {
            "invalid_json" | "invalid_body" => StatusCode::BAD_REQUEST,
            "request_too_large" => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("too many requests")]
    RateLimited { retry_after: Duration },
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("failed to encode response: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<BackendError> for GatewayError {
    fn from(err: BackendError) -> Self {
        GatewayError::BackendUnavailable(err.to_string())
    }
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(err) => err.status(),
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Encoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "invalid_request_error",
            GatewayError::RateLimited { .. } => "rate_limit_error",
            _ => "server_error",
        }
    }

    fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(err) => err.code,
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::BackendUnavailable(_) => "backend_unavailable",
            GatewayError::Encoding(_) => "encoding_failure",
        }
    }

    fn public_message(&self) -> String {
        match self {
            GatewayError::RateLimited { .. } => {
                "Too many requests. Please try again later.".to_string()
            }
            // serde errors describe our own types; keep them in the logs.
            GatewayError::Encoding(_) => "internal error while encoding response".to_string(),
            other => other.to_string(),
        }
    }

    pub fn to_body(&self) -> OpenAiErrorResponse {
        let param = match self {
            GatewayError::Validation(err) => err.param.clone(),
            _ => None,
        };
        OpenAiErrorResponse {
            error: OpenAiError {
                message: self.public_message(),
                error_type: self.error_type().to_string(),
                param,
                code: Some(self.code().to_string()),
            },
        }
    }

    /// Emits the error at the level its cause deserves.
    pub fn log(&self, request_id: Option<&str>) {
        match self {
            GatewayError::Validation(err) => {
                tracing::debug!(request_id = ?request_id, code = err.code, error = %err, "rejected invalid request");
            }
            GatewayError::RateLimited { retry_after } => {
                tracing::info!(request_id = ?request_id, retry_after_ms = retry_after.as_millis() as u64, "rejected rate limited request");
            }
            GatewayError::BackendUnavailable(reason) => {
                tracing::warn!(request_id = ?request_id, reason = %reason, "backend call failed");
            }
            GatewayError::Encoding(err) => {
                tracing::error!(request_id = ?request_id, error = %err, "failed to encode response");
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = self.to_body();
        let mut resp = openai_error_response(
            self.status(),
            &body.error.error_type,
            &body.error.message,
            body.error.param.as_deref(),
            body.error.code.as_deref(),
        );
        if let GatewayError::RateLimited { retry_after } = self {
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            resp.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        resp
    }
}
