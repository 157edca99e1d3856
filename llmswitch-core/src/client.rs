use std::time::{Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::StreamExt;

use crate::config::LlmType;
use crate::error::CoreResult;
use crate::model::{ChatRequest, ChatResponse};
use crate::stream::{BoxStreamEv, StreamEvent};

/// Sampling parameters every client is built with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChatParams {
    pub temperature: f32,
    pub streaming: bool,
}

impl ChatParams {
    pub const FIXED: ChatParams = ChatParams {
        temperature: 0.2,
        streaming: true,
    };
}

impl Default for ChatParams {
    fn default() -> Self {
        Self::FIXED
    }
}

/// A constructed chat-model client. Owned by the caller; nothing is shared
/// between two clients built from the same configuration.
#[async_trait]
pub trait ChatClient: Send + Sync {
    fn llm_type(&self) -> LlmType;

    /// Model identifier the client talks to (deployment name for Azure).
    fn model(&self) -> &str;

    fn params(&self) -> ChatParams;

    /// Start a streaming completion. Errors before the first byte are
    /// returned directly; later failures arrive as `StreamEvent::Error`.
    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<BoxStreamEv>;

    /// Drive `chat_stream` to completion and fold it into one response.
    async fn chat(&self, req: ChatRequest) -> CoreResult<ChatResponse> {
        let started = Instant::now();
        let mut stream = self.chat_stream(req).await?;

        let mut resp = ChatResponse {
            provider: self.llm_type().to_string(),
            model: self.model().to_string(),
            text: String::new(),
            usage_prompt: 0,
            usage_completion: 0,
            stop_reason: None,
            provider_request_id: None,
            created_at_ms: now_ms(),
            latency_ms: 0,
        };
        while let Some(ev) = stream.next().await {
            match ev {
                StreamEvent::RequestId(id) => resp.provider_request_id = Some(id),
                StreamEvent::DeltaText(t) => resp.text.push_str(&t),
                StreamEvent::Usage { prompt, completion } => {
                    if let Some(p) = prompt {
                        resp.usage_prompt = p;
                    }
                    if let Some(c) = completion {
                        resp.usage_completion = c;
                    }
                }
                StreamEvent::Stop { reason } => {
                    resp.stop_reason = reason;
                    break;
                }
                StreamEvent::Error(e) => return Err(e),
            }
        }
        resp.latency_ms = started.elapsed().as_millis() as u32;
        Ok(resp)
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
