use std::collections::VecDeque;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span};
use tracing_futures::Instrument;

use crate::client::{ChatClient, ChatParams};
use crate::config::{LlmType, OpenAiSettings};
use crate::error::{CoreResult, LlmError};
use crate::http_client::{HttpClient, RequestCtx, SseLine, SseStream};
use crate::model::{ChatMessage, ChatRequest, StopReason};
use crate::normalizer::normalize_chat;
use crate::stream::{BoxStreamEv, StreamEvent, with_request_id};

#[derive(Debug, Clone)]
pub struct OpenAI {
    http: HttpClient,
    api_key: Option<SecretString>,
    base: String,
    model: String,
    params: ChatParams,
}

impl OpenAI {
    pub fn new(http: HttpClient, api_key: Option<SecretString>, base: String, model: String) -> Self {
        Self {
            http,
            api_key,
            base,
            model,
            params: ChatParams::FIXED,
        }
    }

    pub fn from_settings(http: HttpClient, s: &OpenAiSettings) -> Self {
        Self::new(http, s.api_key.clone(), s.base_url.clone(), s.model.clone())
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        OpenAI::new(
            HttpClient::new_default().unwrap(),
            Some(SecretString::from("test-key")),
            server_base.to_string(),
            "gpt-3.5-turbo".into(),
        )
    }

    fn headers(&self) -> Vec<(String, String)> {
        // No key configured: send the request anyway and let the endpoint reject it.
        match &self.api_key {
            Some(key) => vec![(
                "Authorization".to_string(),
                format!("Bearer {}", key.expose_secret()),
            )],
            None => vec![],
        }
    }
}

#[async_trait]
impl ChatClient for OpenAI {
    fn llm_type(&self) -> LlmType {
        LlmType::OpenAI
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn params(&self) -> ChatParams {
        self.params
    }

    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<BoxStreamEv> {
        let req = normalize_chat(req);
        let payload = OAChatReq::new(Some(&self.model), &req, self.params);
        let ctx = RequestCtx {
            request_id: req.request_id.as_deref(),
        };
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let url = format!("{}/v1/chat/completions", self.base.trim_end_matches('/'));

        let span = info_span!("llm.chat_stream", llm.provider = "openai", llm.model = %self.model);
        let resp = self
            .http
            .post_sse_lines("openai", &url, &payload, &hdrs, &ctx)
            .instrument(span.clone())
            .await?;
        debug!(
            parent: &span,
            latency.ms = resp.latency_ms,
            llm.req_id = ?resp.provider_request_id,
            "stream opened"
        );
        Ok(with_request_id(resp.provider_request_id, sse_events("openai", resp.body))
            .instrument(span)
            .boxed())
    }
}

// ---- Wire structs shared by OpenAI-compatible endpoints ----

#[derive(Serialize)]
pub(crate) struct OAChatReq<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

impl<'a> OAChatReq<'a> {
    pub(crate) fn new(model: Option<&'a str>, req: &'a ChatRequest, params: ChatParams) -> Self {
        Self {
            model,
            messages: &req.messages,
            temperature: params.temperature,
            stream: params.streaming,
            max_tokens: req.max_output_tokens,
            stop: req.stop_sequences.as_deref(),
        }
    }
}

#[derive(Deserialize)]
struct OAChunk {
    #[serde(default)]
    choices: Vec<OAChunkChoice>,
    #[serde(default)]
    usage: Option<OAUsage>,
    #[serde(default)]
    error: Option<OAStreamError>,
}

#[derive(Deserialize)]
struct OAChunkChoice {
    #[serde(default)]
    delta: Option<OADelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OADelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OAUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct OAStreamError {
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

fn map_finish(s: Option<&str>) -> Option<StopReason> {
    match s {
        Some("stop") => Some(StopReason::Stop),
        Some("length") => Some(StopReason::Length),
        Some("content_filter") => Some(StopReason::ContentFilter),
        Some("tool_calls") | Some("function_call") => Some(StopReason::ToolUse),
        Some(_) => Some(StopReason::Other),
        None => None,
    }
}

struct SseState {
    provider: &'static str,
    lines: SseStream,
    pending: VecDeque<StreamEvent>,
    stop: Option<StopReason>,
    done: bool,
}

impl SseState {
    fn finish(&mut self, ev: StreamEvent) {
        self.done = true;
        self.pending.push_back(ev);
    }

    fn on_line(&mut self, line: &str) {
        let line = line.trim_end();
        // Blank separators, comments, `event:` and `id:` fields carry nothing we use.
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            let reason = self.stop;
            self.finish(StreamEvent::Stop { reason });
            return;
        }

        let chunk: OAChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                self.finish(StreamEvent::Error(LlmError::Protocol(format!(
                    "bad {} stream chunk: {e}",
                    self.provider
                ))));
                return;
            }
        };
        if let Some(err) = chunk.error {
            let code = match err.code {
                Some(serde_json::Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => "stream".to_string(),
            };
            self.finish(StreamEvent::Error(LlmError::ProviderError {
                provider: self.provider.to_string(),
                code,
                message: err.message,
            }));
            return;
        }
        // Azure sends a leading chunk with only prompt filter results and no choices.
        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(text) = choice.delta.and_then(|d| d.content)
                && !text.is_empty()
            {
                self.pending.push_back(StreamEvent::DeltaText(text));
            }
            if let Some(reason) = map_finish(choice.finish_reason.as_deref()) {
                self.stop = Some(reason);
            }
        }
        if let Some(u) = chunk.usage {
            self.pending.push_back(StreamEvent::Usage {
                prompt: Some(u.prompt_tokens),
                completion: Some(u.completion_tokens),
            });
        }
    }
}

/// Turn an OpenAI-style SSE line stream into `StreamEvent`s. Ends with
/// `Stop` at `data: [DONE]`, or with `Error`; a body that ends without
/// `[DONE]` was cut off and yields `Protocol`.
pub(crate) fn sse_events(provider: &'static str, lines: SseStream) -> BoxStreamEv {
    let state = SseState {
        provider,
        lines,
        pending: VecDeque::new(),
        stop: None,
        done: false,
    };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(ev) = st.pending.pop_front() {
                return Some((ev, st));
            }
            if st.done {
                return None;
            }
            match st.lines.next().await {
                Some(Ok(SseLine { line })) => st.on_line(&line),
                Some(Err(e)) => st.finish(StreamEvent::Error(e)),
                None => st.finish(StreamEvent::Error(LlmError::Protocol(format!(
                    "{} stream ended before [DONE]",
                    st.provider
                )))),
            }
        }
    })
    .boxed()
}
