use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// One turn of a chat conversation.
///
/// Field order is part of the serialized conversation key and must stay `role`, `content`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Compact JSON encoding of a conversation (`[{"role":"user","content":"..."}]`).
///
/// This string identifies a conversation prefix in the tamper log, so it must stay
/// byte-stable: no whitespace between tokens and fields in declaration order.
pub fn serialize_conversation(messages: &[ChatMessage]) -> serde_json::Result<String> {
    serde_json::to_string(messages)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
        }
    }
}

/// A single `chat.completion.chunk` as delivered by the upstream provider.
///
/// The raw JSON is kept so the chunk can be relayed downstream in the provider's own shape.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamChunk {
    raw: Value,
}

impl UpstreamChunk {
    pub fn from_value(raw: Value) -> Self {
        Self { raw }
    }

    pub fn parse(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data).map(Self::from_value)
    }

    pub fn content_delta(content: impl Into<String>) -> Self {
        Self::from_value(json!({
            "object": "chat.completion.chunk",
            "choices": [{
                "index": 0,
                "delta": { "content": content.into() },
                "finish_reason": null,
            }],
        }))
    }

    pub fn finished(reason: FinishReason) -> Self {
        Self::from_value(json!({
            "object": "chat.completion.chunk",
            "choices": [{
                "index": 0,
                "delta": {},
                "finish_reason": reason.as_str(),
            }],
        }))
    }

    pub fn as_value(&self) -> &Value {
        &self.raw
    }

    pub fn into_value(self) -> Value {
        self.raw
    }

    fn first_choice(&self) -> Option<&Map<String, Value>> {
        self.raw
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(Value::as_object)
    }

    /// Incremental assistant text, if this chunk carries any.
    pub fn content(&self) -> Option<&str> {
        self.first_choice()
            .and_then(|choice| choice.get("delta"))
            .and_then(|delta| delta.get("content"))
            .and_then(Value::as_str)
            .filter(|content| !content.is_empty())
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.first_choice()
            .and_then(|choice| choice.get("finish_reason"))
            .and_then(Value::as_str)
    }

    /// Turns this chunk into the budget-truncation marker: `finish_reason` becomes `length`
    /// and the delta loses its content, since that content was never paid for.
    pub fn truncate(&mut self) {
        let Some(obj) = self.raw.as_object_mut() else {
            self.raw = Self::finished(FinishReason::Length).raw;
            return;
        };

        let choices = obj
            .entry("choices")
            .or_insert_with(|| Value::Array(Vec::new()));
        if !choices.is_array() {
            *choices = Value::Array(Vec::new());
        }
        let Some(choices) = choices.as_array_mut() else {
            return;
        };
        if choices.is_empty() {
            choices.push(json!({ "index": 0 }));
        }
        if let Some(choice) = choices.first_mut().and_then(Value::as_object_mut) {
            choice.insert("delta".to_string(), Value::Object(Map::new()));
            choice.insert(
                "finish_reason".to_string(),
                Value::String(FinishReason::Length.as_str().to_string()),
            );
        }
    }

    pub fn to_sse_frame(&self) -> Bytes {
        Bytes::from(format!("data: {}\n\n", self.raw))
    }
}
