use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    Length,
    ToolUse,
    EndTurn,
    ContentFilter,
    Other,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// A chat turn. Sampling parameters are fixed per client (see `ChatParams`)
/// and are therefore not part of the request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub max_output_tokens: Option<u32>,
    pub stop_sequences: Option<Vec<String>>,
    pub request_id: Option<String>,
}

impl ChatRequest {
    pub fn from_user(content: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::user(content)],
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatResponse {
    pub provider: String,
    pub model: String,
    pub text: String,
    pub usage_prompt: u32,
    pub usage_completion: u32,
    pub stop_reason: Option<StopReason>,
    pub provider_request_id: Option<String>,
    pub created_at_ms: i64,
    pub latency_ms: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_json_lowercase() {
        let json = r#"{"role":"assistant","content":"ok"}"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.role, Role::Assistant);
        let back = serde_json::to_string(&msg).unwrap();
        assert!(back.contains("\"assistant\""));
    }

    #[test]
    fn from_user_builds_single_message() {
        let req = ChatRequest::from_user("hello");
        assert_eq!(req.messages, vec![ChatMessage::user("hello")]);
        assert!(req.max_output_tokens.is_none());
        assert!(req.request_id.is_none());
    }

    #[test]
    fn stop_reason_snake_case() {
        let s = serde_json::to_string(&StopReason::ContentFilter).unwrap();
        assert_eq!(s, "\"content_filter\"");
    }
}
