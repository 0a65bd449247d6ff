//! Wire shapes of the OpenAI-compatible chat completion endpoint.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// A validated request. Fields the gateway does not interpret are kept in
/// `extra` and serialized back out when the request is forwarded.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    pub fn last_user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Clone, Debug, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: &'static str,
}

/// Character counts of prompt and reply; no tokenizer is involved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn from_text(prompt: &str, completion: &str) -> Self {
        let prompt_tokens = prompt.chars().count();
        let completion_tokens = completion.chars().count();
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

impl ChatCompletionResponse {
    pub fn new(
        id: String,
        created: u64,
        model: Option<String>,
        content: String,
        usage: Usage,
    ) -> Self {
        Self {
            id,
            object: "chat.completion",
            created,
            model,
            choices: vec![Choice {
                index: 0,
                message: ChatMessage {
                    role: Role::Assistant,
                    content,
                },
                finish_reason: "stop",
            }],
            usage,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<&'static str>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_user_content_skips_trailing_assistant_turns() {
        let request = ChatCompletionRequest {
            messages: vec![
                ChatMessage {
                    role: Role::User,
                    content: "first".to_string(),
                },
                ChatMessage {
                    role: Role::User,
                    content: "second".to_string(),
                },
                ChatMessage {
                    role: Role::Assistant,
                    content: "reply".to_string(),
                },
            ],
            stream: false,
            model: None,
            extra: Map::new(),
        };

        assert_eq!(request.last_user_content(), Some("second"));
    }

    #[test]
    fn request_serializes_extra_fields_inline() {
        let mut extra = Map::new();
        extra.insert("temperature".to_string(), json!(0.2));
        let request = ChatCompletionRequest {
            messages: vec![ChatMessage {
                role: Role::User,
                content: "hi".to_string(),
            }],
            stream: true,
            model: Some("m".to_string()),
            extra,
        };

        let got = serde_json::to_value(&request).unwrap();
        assert_eq!(
            got,
            json!({
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true,
                "model": "m",
                "temperature": 0.2
            })
        );
    }

    #[test]
    fn first_delta_omits_absent_fields() {
        let delta = Delta {
            role: None,
            content: Some("x".to_string()),
        };
        assert_eq!(serde_json::to_value(&delta).unwrap(), json!({"content": "x"}));
        assert_eq!(serde_json::to_value(Delta::default()).unwrap(), json!({}));
    }

    #[test]
    fn usage_counts_characters() {
        let usage = Usage::from_text("héllo", "Echo: héllo");
        assert_eq!(usage.prompt_tokens, 5);
        assert_eq!(usage.completion_tokens, 11);
        assert_eq!(usage.total_tokens, 16);
    }
}
