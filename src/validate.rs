use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::types::{ChatCompletionRequest, ChatMessage, Role};

/// Parses a raw request body into a [`ChatCompletionRequest`].
///
/// Unknown top-level fields are accepted and preserved. The request must hold
/// at least one user message, since that is what gets echoed or answered.
pub fn validate(raw: &[u8]) -> Result<ChatCompletionRequest, ValidationError> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|_| ValidationError::new("invalid_json", "invalid JSON body"))?;

    let Value::Object(mut body) = value else {
        return Err(ValidationError::new(
            "invalid_body",
            "request body must be a JSON object",
        ));
    };

    let messages = parse_messages(body.remove("messages"))?;

    let stream = match body.remove("stream") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(stream)) => stream,
        Some(_) => {
            return Err(
                ValidationError::new("invalid_type", "stream must be a boolean")
                    .with_param("stream"),
            );
        }
    };

    let model = match body.remove("model") {
        None | Some(Value::Null) => None,
        Some(Value::String(model)) => Some(model),
        Some(_) => {
            return Err(
                ValidationError::new("invalid_type", "model must be a string").with_param("model"),
            );
        }
    };

    if !messages.iter().any(|message| message.role == Role::User) {
        return Err(
            ValidationError::new("no_user_message", "No user message found")
                .with_param("messages"),
        );
    }

    Ok(ChatCompletionRequest {
        messages,
        stream,
        model,
        extra: body,
    })
}

fn parse_messages(raw: Option<Value>) -> Result<Vec<ChatMessage>, ValidationError> {
    let items = match raw {
        None | Some(Value::Null) => {
            return Err(
                ValidationError::new("missing_messages", "missing required field: messages")
                    .with_param("messages"),
            );
        }
        Some(Value::Array(items)) => items,
        Some(_) => {
            return Err(
                ValidationError::new("invalid_messages", "messages must be an array")
                    .with_param("messages"),
            );
        }
    };

    if items.is_empty() {
        return Err(
            ValidationError::new("empty_messages", "messages list cannot be empty")
                .with_param("messages"),
        );
    }

    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| parse_message(idx, item))
        .collect()
}

fn parse_message(idx: usize, item: Value) -> Result<ChatMessage, ValidationError> {
    let Value::Object(mut fields) = item else {
        return Err(
            ValidationError::new("invalid_message", "each message must be an object")
                .with_param(format!("messages[{idx}]")),
        );
    };

    let role = string_field(&mut fields, "role")
        .as_deref()
        .and_then(Role::parse)
        .ok_or_else(|| {
            ValidationError::new(
                "invalid_role",
                "role must be one of: system, user, assistant",
            )
            .with_param(format!("messages[{idx}].role"))
        })?;

    let content = string_field(&mut fields, "content")
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| {
            ValidationError::new("empty_content", "content cannot be empty")
                .with_param(format!("messages[{idx}].content"))
        })?;

    Ok(ChatMessage { role, content })
}

fn string_field(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    match fields.remove(key) {
        Some(Value::String(value)) => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_of(raw: &str) -> &'static str {
        validate(raw.as_bytes()).unwrap_err().code
    }

    #[test]
    fn accepts_minimal_request_with_defaults() {
        let got = validate(br#"{"messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        assert_eq!(got.messages.len(), 1);
        assert!(!got.stream);
        assert_eq!(got.model, None);
        assert!(got.extra.is_empty());
    }

    #[test]
    fn keeps_unknown_fields_for_forwarding() {
        let got = validate(
            br#"{"model":"m","stream":true,"temperature":0.5,"user":"abc",
                "messages":[{"role":"system","content":"be brief"},{"role":"user","content":"hi"}]}"#,
        )
        .unwrap();
        assert!(got.stream);
        assert_eq!(got.model.as_deref(), Some("m"));
        assert_eq!(got.extra.len(), 2);
        assert!(got.extra.contains_key("temperature"));
        assert!(got.extra.contains_key("user"));
    }

    #[test]
    fn null_stream_defaults_to_false() {
        let got =
            validate(br#"{"stream":null,"messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        assert!(!got.stream);
    }

    #[test]
    fn rejects_unparseable_bodies() {
        assert_eq!(code_of("{not json"), "invalid_json");
        assert_eq!(code_of("[1,2]"), "invalid_body");
    }

    #[test]
    fn rejects_missing_or_empty_messages() {
        assert_eq!(code_of("{}"), "missing_messages");
        assert_eq!(code_of(r#"{"messages":"hi"}"#), "invalid_messages");
        assert_eq!(code_of(r#"{"messages":[]}"#), "empty_messages");
    }

    #[test]
    fn rejects_blank_or_missing_content() {
        let err = validate(br#"{"messages":[{"role":"user"}]}"#).unwrap_err();
        assert_eq!(err.code, "empty_content");
        assert_eq!(err.param.as_deref(), Some("messages[0].content"));

        assert_eq!(
            code_of(r#"{"messages":[{"role":"user","content":"   "}]}"#),
            "empty_content"
        );
        assert_eq!(
            code_of(r#"{"messages":[{"role":"user","content":42}]}"#),
            "empty_content"
        );
    }

    #[test]
    fn rejects_unknown_roles() {
        let err = validate(
            br#"{"messages":[{"role":"user","content":"a"},{"role":"tool","content":"b"}]}"#,
        )
        .unwrap_err();
        assert_eq!(err.code, "invalid_role");
        assert_eq!(err.param.as_deref(), Some("messages[1].role"));
    }

    #[test]
    fn rejects_non_boolean_stream_and_non_string_model() {
        assert_eq!(
            code_of(r#"{"stream":"yes","messages":[{"role":"user","content":"a"}]}"#),
            "invalid_type"
        );
        assert_eq!(
            code_of(r#"{"model":7,"messages":[{"role":"user","content":"a"}]}"#),
            "invalid_type"
        );
    }

    #[test]
    fn rejects_conversation_without_user_message() {
        assert_eq!(
            code_of(
                r#"{"messages":[{"role":"system","content":"a"},{"role":"assistant","content":"b"}]}"#
            ),
            "no_user_message"
        );
    }
}
