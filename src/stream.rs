//! Event-stream framing for streamed completions.

use std::convert::Infallible;

use axum::body::Bytes;
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use serde::Serialize;
use tokio_util::sync::DropGuard;

use crate::correlation::CorrelationId;
use crate::error::GatewayError;
use crate::generate::{Fragment, FragmentStream};
use crate::types::{ChatCompletionChunk, ChunkChoice, Delta, Role};

pub const DONE_RECORD: &[u8] = b"data: [DONE]\n\n";

const FALLBACK_ERROR_RECORD: &[u8] =
    b"data: {\"error\":{\"message\":\"internal error\",\"type\":\"server_error\"}}\n\n";

/// Fields repeated on every chunk of one stream.
#[derive(Clone, Debug)]
pub struct ChunkEnvelope {
    pub id: CorrelationId,
    pub created: u64,
    pub model: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Content,
    Done,
    End,
}

// The guard is declared first so cancellation fires before the fragment
// source is torn down.
struct Encoder {
    _cancel_on_drop: Option<DropGuard>,
    fragments: FragmentStream,
    envelope: ChunkEnvelope,
    seq: u64,
    role_sent: bool,
    phase: Phase,
}

impl Drop for Encoder {
    fn drop(&mut self) {
        if self.phase != Phase::End {
            tracing::debug!(
                request_id = %self.envelope.id,
                frames_sent = self.seq,
                "stream dropped before completion; cancelling generation"
            );
        }
    }
}

impl Encoder {
    fn chunk(&self, delta: Delta, finish_reason: Option<&'static str>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.envelope.id.to_string(),
            object: "chat.completion.chunk",
            created: self.envelope.created,
            model: self.envelope.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    fn record(&mut self, payload: &impl Serialize) -> Result<Bytes, serde_json::Error> {
        let json = serde_json::to_string(payload)?;
        let frame = format!("id: {}\ndata: {json}\n\n", self.seq);
        self.seq += 1;
        Ok(Bytes::from(frame))
    }

    fn content_record(&mut self, fragment: Fragment) -> Bytes {
        let role = (!self.role_sent).then_some(Role::Assistant);
        self.role_sent = true;
        let chunk = self.chunk(
            Delta {
                role,
                content: Some(match fragment {
                    Fragment::Message(text) | Fragment::Delta(text) => text,
                }),
            },
            None,
        );
        self.record(&chunk)
            .unwrap_or_else(|err| self.abort(GatewayError::Encoding(err)))
    }

    fn finish_record(&mut self) -> Bytes {
        self.phase = Phase::Done;
        let chunk = self.chunk(Delta::default(), Some("stop"));
        self.record(&chunk)
            .unwrap_or_else(|err| self.abort(GatewayError::Encoding(err)))
    }

    /// Ends the content phase with an error record; `[DONE]` still follows.
    fn abort(&mut self, err: GatewayError) -> Bytes {
        err.log(Some(self.envelope.id.as_str()));
        self.phase = Phase::Done;
        self.record(&err.to_body())
            .unwrap_or_else(|_| Bytes::from_static(FALLBACK_ERROR_RECORD))
    }

    async fn next_frame(&mut self) -> Option<Bytes> {
        match self.phase {
            Phase::Content => Some(match self.fragments.next().await {
                Some(Ok(fragment)) => self.content_record(fragment),
                Some(Err(err)) => self.abort(err),
                None => self.finish_record(),
            }),
            Phase::Done => {
                self.phase = Phase::End;
                Some(Bytes::from_static(DONE_RECORD))
            }
            Phase::End => None,
        }
    }
}

/// Frames `fragments` as `data:` records: one chunk per fragment, a closing
/// chunk with `finish_reason: "stop"`, then `data: [DONE]`.
///
/// A fragment is pulled only when the previous frame has been taken, so a
/// slow reader pauses generation. Dropping the returned stream drops
/// `cancel_on_drop`, which signals the generator to stop.
pub fn encode(
    fragments: FragmentStream,
    envelope: ChunkEnvelope,
    cancel_on_drop: Option<DropGuard>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let encoder = Encoder {
        _cancel_on_drop: cancel_on_drop,
        fragments,
        envelope,
        seq: 0,
        role_sent: false,
        phase: Phase::Content,
    };

    stream::unfold(encoder, |mut encoder| async move {
        let frame = encoder.next_frame().await?;
        Some((Ok(frame), encoder))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    use crate::correlation::{resolve, RandomIdSource};

    fn envelope() -> ChunkEnvelope {
        ChunkEnvelope {
            id: resolve(Some("chunk-id"), &RandomIdSource),
            created: 1_700_000_000,
            model: None,
        }
    }

    async fn frames(fragments: Vec<Result<Fragment, GatewayError>>) -> Vec<String> {
        encode(stream::iter(fragments).boxed(), envelope(), None)
            .map(|frame| String::from_utf8(frame.unwrap().to_vec()).unwrap())
            .collect()
            .await
    }

    fn data_of(frame: &str) -> Value {
        let data = frame
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .unwrap();
        serde_json::from_str(data).unwrap()
    }

    #[tokio::test]
    async fn frames_every_fragment_then_stop_then_done() {
        let got = frames(vec![
            Ok(Fragment::Delta("Echo:".to_string())),
            Ok(Fragment::Delta(" hi".to_string())),
        ])
        .await;

        assert_eq!(got.len(), 4);
        assert!(got[0].starts_with("id: 0\ndata: "));
        assert!(got[2].starts_with("id: 2\ndata: "));
        assert!(got.iter().all(|frame| frame.ends_with("\n\n")));

        assert_eq!(
            data_of(&got[0]),
            json!({
                "id": "chunk-id",
                "object": "chat.completion.chunk",
                "created": 1_700_000_000u64,
                "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Echo:"}, "finish_reason": null}]
            })
        );
        assert_eq!(data_of(&got[1])["choices"][0]["delta"], json!({"content": " hi"}));
        assert_eq!(data_of(&got[2])["choices"][0]["delta"], json!({}));
        assert_eq!(data_of(&got[2])["choices"][0]["finish_reason"], json!("stop"));
        assert_eq!(got[3], "data: [DONE]\n\n");

        for frame in &got[..3] {
            assert_eq!(data_of(frame)["id"], json!("chunk-id"));
        }
    }

    #[tokio::test]
    async fn empty_generation_still_terminates() {
        let got = frames(Vec::new()).await;
        assert_eq!(got.len(), 2);
        assert_eq!(data_of(&got[0])["choices"][0]["finish_reason"], json!("stop"));
        assert_eq!(got[1], "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn mid_stream_failure_emits_error_record_and_done() {
        let got = frames(vec![
            Ok(Fragment::Delta("partial".to_string())),
            Err(GatewayError::BackendUnavailable("connection reset".to_string())),
            Ok(Fragment::Delta("never sent".to_string())),
        ])
        .await;

        assert_eq!(got.len(), 3);
        let error = data_of(&got[1]);
        assert_eq!(error["error"]["code"], json!("backend_unavailable"));
        assert_eq!(got[2], "data: [DONE]\n\n");
        assert!(!got.concat().contains("never sent"));
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_token() {
        let cancel = CancellationToken::new();
        let fragments = stream::iter(vec![
            Ok(Fragment::Delta("a".to_string())),
            Ok(Fragment::Delta("b".to_string())),
        ])
        .boxed();

        let mut encoded = Box::pin(encode(
            fragments,
            envelope(),
            Some(cancel.clone().drop_guard()),
        ));
        assert!(encoded.next().await.is_some());
        assert!(!cancel.is_cancelled());

        drop(encoded);
        assert!(cancel.is_cancelled());
    }
}
