use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BackendReply};
use crate::correlation::CorrelationId;
use crate::error::{GatewayError, ValidationError};
use crate::types::ChatCompletionRequest;

pub const ECHO_PREFIX: &str = "Echo: ";

/// One unit of generated content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fragment {
    /// The whole reply at once.
    Message(String),
    /// The next piece of a reply that arrives incrementally.
    Delta(String),
}

impl Fragment {
    pub fn text(&self) -> &str {
        match self {
            Fragment::Message(text) | Fragment::Delta(text) => text,
        }
    }
}

pub type FragmentStream = BoxStream<'static, Result<Fragment, GatewayError>>;

/// Response producer, fixed at startup by whether a backend is configured.
pub enum Generator {
    Echo(EchoGenerator),
    Forwarding(ForwardingGenerator),
}

impl Generator {
    pub fn mode(&self) -> &'static str {
        match self {
            Generator::Echo(_) => "echo",
            Generator::Forwarding(_) => "forwarding",
        }
    }

    pub async fn generate(
        &self,
        request: &ChatCompletionRequest,
        id: &CorrelationId,
        cancel: &CancellationToken,
    ) -> Result<FragmentStream, GatewayError> {
        match self {
            Generator::Echo(echo) => echo.generate(request, cancel),
            Generator::Forwarding(forwarding) => forwarding.generate(request, id, cancel).await,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct EchoGenerator {
    chunk_delay: Duration,
}

impl EchoGenerator {
    pub fn new(chunk_delay: Duration) -> Self {
        Self { chunk_delay }
    }

    pub fn reply(request: &ChatCompletionRequest) -> Result<String, GatewayError> {
        let prompt = request.last_user_content().ok_or_else(|| {
            ValidationError::new("no_user_message", "No user message found").with_param("messages")
        })?;
        Ok(format!("{ECHO_PREFIX}{prompt}"))
    }

    pub fn generate(
        &self,
        request: &ChatCompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<FragmentStream, GatewayError> {
        let reply = Self::reply(request)?;

        if !request.stream {
            return Ok(stream::iter([Ok::<_, GatewayError>(Fragment::Message(reply))]).boxed());
        }

        let delay = self.chunk_delay;
        let pieces = stream::iter(split_pieces(&reply).into_iter().enumerate())
            .then(move |(idx, piece)| async move {
                if idx > 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, GatewayError>(Fragment::Delta(piece))
            })
            .take_until(cancel.clone().cancelled_owned());
        Ok(pieces.boxed())
    }
}

/// Splits text into word-sized pieces. Each piece keeps the whitespace that
/// preceded its word, so the pieces concatenate back to the input.
pub fn split_pieces(text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut in_word = false;

    for ch in text.chars() {
        if ch.is_whitespace() {
            if in_word {
                pieces.push(std::mem::take(&mut current));
                in_word = false;
            }
        } else {
            in_word = true;
        }
        current.push(ch);
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[derive(Clone)]
pub struct ForwardingGenerator {
    backend: Arc<dyn Backend>,
}

impl ForwardingGenerator {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub async fn generate(
        &self,
        request: &ChatCompletionRequest,
        id: &CorrelationId,
        cancel: &CancellationToken,
    ) -> Result<FragmentStream, GatewayError> {
        let reply = self.backend.invoke(request, id, cancel.clone()).await?;

        tracing::debug!(
            request_id = %id,
            streaming = matches!(reply, BackendReply::Stream(_)),
            "backend replied"
        );

        let fragments = match reply {
            BackendReply::Complete(text) => {
                stream::iter([Ok::<_, GatewayError>(Fragment::Message(text))]).boxed()
            }
            BackendReply::Stream(tokens) => tokens
                .map(|token| token.map(Fragment::Delta).map_err(GatewayError::from))
                .take_until(cancel.clone().cancelled_owned())
                .boxed(),
        };
        Ok(fragments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use serde_json::Map;

    use crate::backend::BackendError;
    use crate::correlation::{resolve, RandomIdSource};
    use crate::types::{ChatMessage, Role};

    fn request(stream: bool, messages: &[(Role, &str)]) -> ChatCompletionRequest {
        ChatCompletionRequest {
            messages: messages
                .iter()
                .map(|(role, content)| ChatMessage {
                    role: *role,
                    content: content.to_string(),
                })
                .collect(),
            stream,
            model: None,
            extra: Map::new(),
        }
    }

    fn id() -> CorrelationId {
        resolve(None, &RandomIdSource)
    }

    async fn collect(fragments: FragmentStream) -> Vec<Fragment> {
        fragments.map(|f| f.unwrap()).collect().await
    }

    #[test]
    fn split_pieces_round_trips_whitespace() {
        let text = "Echo:  hello\tbrave new\nworld ";
        let pieces = split_pieces(text);
        assert_eq!(
            pieces,
            vec!["Echo:", "  hello", "\tbrave", " new", "\nworld", " "]
        );
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn split_pieces_handles_leading_whitespace_and_empty_input() {
        assert_eq!(split_pieces("  hi there"), vec!["  hi", " there"]);
        assert!(split_pieces("").is_empty());
    }

    #[tokio::test]
    async fn echo_replies_to_last_user_message() {
        let echo = EchoGenerator::default();
        let req = request(
            false,
            &[
                (Role::System, "sys"),
                (Role::User, "first"),
                (Role::Assistant, "answer"),
                (Role::User, "second"),
            ],
        );

        let got = collect(echo.generate(&req, &CancellationToken::new()).unwrap()).await;
        assert_eq!(got, vec![Fragment::Message("Echo: second".to_string())]);
    }

    #[tokio::test]
    async fn echo_streams_more_than_one_piece() {
        let echo = EchoGenerator::default();
        let req = request(true, &[(Role::User, "hello there")]);

        let got = collect(echo.generate(&req, &CancellationToken::new()).unwrap()).await;
        assert_eq!(
            got,
            vec![
                Fragment::Delta("Echo:".to_string()),
                Fragment::Delta(" hello".to_string()),
                Fragment::Delta(" there".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn echo_stream_stops_when_cancelled() {
        let echo = EchoGenerator::new(Duration::from_millis(20));
        let req = request(true, &[(Role::User, "a b c d e f g h")]);
        let cancel = CancellationToken::new();

        let mut fragments = echo.generate(&req, &cancel).unwrap();
        assert!(fragments.next().await.is_some());
        cancel.cancel();
        assert!(fragments.next().await.is_none());
    }

    #[tokio::test]
    async fn echo_without_user_message_is_a_validation_error() {
        let echo = EchoGenerator::default();
        let req = request(false, &[(Role::System, "only system")]);

        let err = echo
            .generate(&req, &CancellationToken::new())
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::Validation(ref e) if e.code == "no_user_message"));
    }

    struct FixedBackend(Result<Vec<&'static str>, ()>, bool);

    #[async_trait]
    impl Backend for FixedBackend {
        async fn invoke(
            &self,
            _request: &ChatCompletionRequest,
            _id: &CorrelationId,
            _cancel: CancellationToken,
        ) -> Result<BackendReply, BackendError> {
            match (&self.0, self.1) {
                (Err(()), _) => Err(BackendError::Status(reqwest::StatusCode::BAD_GATEWAY)),
                (Ok(parts), false) => Ok(BackendReply::Complete(parts.concat())),
                (Ok(parts), true) => {
                    let tokens: Vec<Result<String, BackendError>> =
                        parts.iter().map(|p| Ok(p.to_string())).collect();
                    Ok(BackendReply::Stream(stream::iter(tokens).boxed()))
                }
            }
        }
    }

    #[tokio::test]
    async fn forwarding_keeps_backend_content() {
        let backend = FixedBackend(Ok(vec!["a", "b"]), false);
        let forwarding = ForwardingGenerator::new(Arc::new(backend));
        let got = collect(
            forwarding
                .generate(&request(false, &[(Role::User, "x")]), &id(), &CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(got, vec![Fragment::Message("ab".to_string())]);

        let backend = FixedBackend(Ok(vec!["a", "b"]), true);
        let forwarding = ForwardingGenerator::new(Arc::new(backend));
        let got = collect(
            forwarding
                .generate(&request(true, &[(Role::User, "x")]), &id(), &CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(
            got,
            vec![Fragment::Delta("a".to_string()), Fragment::Delta("b".to_string())]
        );
    }

    #[tokio::test]
    async fn forwarding_failure_is_not_replaced_by_echo() {
        let generator = Generator::Forwarding(ForwardingGenerator::new(Arc::new(FixedBackend(
            Err(()),
            false,
        ))));
        let err = generator
            .generate(&request(false, &[(Role::User, "x")]), &id(), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::BackendUnavailable(_)));
        assert_eq!(generator.mode(), "forwarding");
    }
}
