pub mod event_stream;
pub mod runtime;
pub mod sigv4;

use std::collections::VecDeque;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{StreamExt, stream};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info_span};
use tracing_futures::Instrument;

use crate::client::{ChatClient, ChatParams};
use crate::config::{BedrockSettings, LlmType};
use crate::error::{CoreResult, LlmError};
use crate::http_client::{ByteStream, RequestCtx};
use crate::model::{ChatMessage, ChatRequest, Role, StopReason};
use crate::normalizer::normalize_chat;
use crate::stream::{BoxStreamEv, StreamEvent, with_request_id};

pub use event_stream::{EventStreamDecoder, Message};
pub use runtime::BedrockRuntime;

/// Request/response dialect, picked from the model id's vendor prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Anthropic,
    Amazon,
    Meta,
}

impl ModelFamily {
    /// `anthropic.claude-v2` → Anthropic. Cross-region inference prefixes
    /// (`us.`, `eu.`, `apac.`) are skipped.
    pub fn of(model_id: &str) -> CoreResult<Self> {
        let mut parts = model_id.split('.');
        let mut vendor = parts.next().unwrap_or_default();
        if matches!(vendor, "us" | "eu" | "apac") {
            vendor = parts.next().unwrap_or_default();
        }
        match vendor {
            "anthropic" => Ok(ModelFamily::Anthropic),
            "amazon" => Ok(ModelFamily::Amazon),
            "meta" => Ok(ModelFamily::Meta),
            _ => Err(LlmError::Validation(format!(
                "unsupported bedrock model family for '{model_id}'"
            ))),
        }
    }

    fn body(self, req: &ChatRequest, params: ChatParams, max_tokens: u32) -> Value {
        let stops = req.stop_sequences.clone().unwrap_or_default();
        match self {
            ModelFamily::Anthropic => {
                let mut body = json!({
                    "prompt": turn_prompt(&req.messages, "\n\nHuman:", "\n\nAssistant:"),
                    "max_tokens_to_sample": max_tokens,
                    "temperature": params.temperature,
                });
                if !stops.is_empty() {
                    body["stop_sequences"] = json!(stops);
                }
                body
            }
            ModelFamily::Amazon => json!({
                "inputText": turn_prompt(&req.messages, "\n\nUser:", "\n\nBot:"),
                "textGenerationConfig": {
                    "temperature": params.temperature,
                    "maxTokenCount": max_tokens,
                    "stopSequences": stops,
                },
            }),
            ModelFamily::Meta => json!({
                "prompt": llama_prompt(&req.messages),
                "temperature": params.temperature,
                "max_gen_len": max_tokens,
            }),
        }
    }

    fn text_key(self) -> &'static str {
        match self {
            ModelFamily::Anthropic => "completion",
            ModelFamily::Amazon => "outputText",
            ModelFamily::Meta => "generation",
        }
    }

    fn stop_key(self) -> &'static str {
        match self {
            ModelFamily::Anthropic | ModelFamily::Meta => "stop_reason",
            ModelFamily::Amazon => "completionReason",
        }
    }

    fn map_stop(self, raw: &str) -> StopReason {
        match (self, raw) {
            (ModelFamily::Anthropic, "stop_sequence") => StopReason::Stop,
            (ModelFamily::Anthropic, "end_turn") => StopReason::EndTurn,
            (ModelFamily::Anthropic, "max_tokens") => StopReason::Length,
            (ModelFamily::Amazon, "FINISH") => StopReason::Stop,
            (ModelFamily::Amazon, "LENGTH") => StopReason::Length,
            (ModelFamily::Amazon, "CONTENT_FILTERED") => StopReason::ContentFilter,
            (ModelFamily::Meta, "stop") => StopReason::Stop,
            (ModelFamily::Meta, "length") => StopReason::Length,
            _ => StopReason::Other,
        }
    }
}

/// Alternating-turn prompt used by Claude text completions and Titan.
/// System text is emitted verbatim; the prompt always ends on the
/// assistant marker.
fn turn_prompt(messages: &[ChatMessage], human: &str, assistant: &str) -> String {
    let mut prompt = String::new();
    for m in messages {
        match m.role {
            Role::System => prompt.push_str(&m.content),
            Role::User => {
                prompt.push_str(human);
                prompt.push(' ');
                prompt.push_str(&m.content);
            }
            Role::Assistant => {
                prompt.push_str(assistant);
                prompt.push(' ');
                prompt.push_str(&m.content);
            }
        }
    }
    if messages.last().map(|m| m.role) != Some(Role::Assistant) {
        prompt.push_str(assistant);
    }
    prompt
}

fn llama_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| match m.role {
            Role::System => format!("<<SYS>> {} <</SYS>>", m.content),
            Role::User => format!("[INST] {} [/INST]", m.content),
            Role::Assistant => m.content.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Chat client on top of a `BedrockRuntime`.
#[derive(Debug, Clone)]
pub struct BedrockChat {
    runtime: BedrockRuntime,
    model_id: String,
    max_tokens: u32,
    params: ChatParams,
}

impl BedrockChat {
    pub fn new(runtime: BedrockRuntime, model_id: String, max_tokens: u32) -> Self {
        Self {
            runtime,
            model_id,
            max_tokens,
            params: ChatParams::FIXED,
        }
    }

    pub fn from_settings(runtime: BedrockRuntime, s: &BedrockSettings) -> Self {
        Self::new(runtime, s.model_id.clone(), s.max_tokens)
    }
}

#[async_trait]
impl ChatClient for BedrockChat {
    fn llm_type(&self) -> LlmType {
        LlmType::Bedrock
    }

    fn model(&self) -> &str {
        &self.model_id
    }

    fn params(&self) -> ChatParams {
        self.params
    }

    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<BoxStreamEv> {
        let family = ModelFamily::of(&self.model_id)?;
        let req = normalize_chat(req);
        let max_tokens = req.max_output_tokens.unwrap_or(self.max_tokens);
        let body = serde_json::to_vec(&family.body(&req, self.params, max_tokens))
            .map_err(|e| LlmError::Other(e.into()))?;
        let ctx = RequestCtx {
            request_id: req.request_id.as_deref(),
        };

        let span = info_span!(
            "llm.chat_stream",
            llm.provider = "bedrock",
            llm.model = %self.model_id,
            aws.region = self.runtime.region().unwrap_or_default()
        );
        let resp = self
            .runtime
            .invoke_with_response_stream(&self.model_id, body, &ctx)
            .instrument(span.clone())
            .await?;
        debug!(
            parent: &span,
            latency.ms = resp.latency_ms,
            llm.req_id = ?resp.provider_request_id,
            "stream opened"
        );
        Ok(with_request_id(resp.provider_request_id, bedrock_events(family, resp.body))
            .instrument(span)
            .boxed())
    }
}

#[derive(Deserialize)]
struct ChunkPayload {
    bytes: String,
}

#[derive(Deserialize)]
struct ExceptionPayload {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvocationMetrics {
    input_token_count: Option<u32>,
    output_token_count: Option<u32>,
}

fn exception_error(kind: &str, payload: &[u8]) -> LlmError {
    let message = serde_json::from_slice::<ExceptionPayload>(payload)
        .map(|p| p.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(payload).into_owned());
    let provider = "bedrock".to_string();
    match kind {
        "throttlingException" => LlmError::RateLimited {
            provider,
            retry_after: None,
        },
        "serviceUnavailableException" | "internalServerException" => {
            LlmError::ProviderUnavailable { provider }
        }
        _ => LlmError::ProviderError {
            provider,
            code: kind.to_string(),
            message,
        },
    }
}

struct BedrockState {
    family: ModelFamily,
    body: ByteStream,
    decoder: EventStreamDecoder,
    pending: VecDeque<StreamEvent>,
    stop: Option<StopReason>,
    done: bool,
}

impl BedrockState {
    fn finish(&mut self, ev: StreamEvent) {
        self.done = true;
        self.pending.push_back(ev);
    }

    /// Drain every complete frame currently buffered.
    fn drain_frames(&mut self) {
        while !self.done {
            match self.decoder.next_message() {
                Ok(Some(msg)) => self.on_message(msg),
                Ok(None) => return,
                Err(e) => self.finish(StreamEvent::Error(e)),
            }
        }
    }

    fn on_message(&mut self, msg: Message) {
        match msg.header_str(":message-type") {
            Some("exception") | Some("error") => {
                let kind = msg
                    .header_str(":exception-type")
                    .or_else(|| msg.header_str(":error-code"))
                    .unwrap_or("exception")
                    .to_string();
                self.finish(StreamEvent::Error(exception_error(&kind, &msg.payload)));
            }
            Some("event") if msg.header_str(":event-type") == Some("chunk") => {
                if let Err(e) = self.on_chunk(&msg.payload) {
                    self.finish(StreamEvent::Error(e));
                }
            }
            _ => {}
        }
    }

    fn on_chunk(&mut self, payload: &[u8]) -> CoreResult<()> {
        let wrapper: ChunkPayload = serde_json::from_slice(payload)
            .map_err(|e| LlmError::Protocol(format!("bad bedrock chunk envelope: {e}")))?;
        let raw = BASE64
            .decode(wrapper.bytes.as_bytes())
            .map_err(|e| LlmError::Protocol(format!("bad bedrock chunk encoding: {e}")))?;
        let chunk: Value = serde_json::from_slice(&raw)
            .map_err(|e| LlmError::Protocol(format!("bad bedrock chunk body: {e}")))?;

        if let Some(text) = chunk.get(self.family.text_key()).and_then(Value::as_str)
            && !text.is_empty()
        {
            self.pending.push_back(StreamEvent::DeltaText(text.to_string()));
        }
        if let Some(reason) = chunk.get(self.family.stop_key()).and_then(Value::as_str) {
            self.stop = Some(self.family.map_stop(reason));
        }
        if let Some(metrics) = chunk.get("amazon-bedrock-invocationMetrics")
            && let Ok(m) = serde_json::from_value::<InvocationMetrics>(metrics.clone())
        {
            self.pending.push_back(StreamEvent::Usage {
                prompt: m.input_token_count,
                completion: m.output_token_count,
            });
        }
        Ok(())
    }
}

fn bedrock_events(family: ModelFamily, body: ByteStream) -> BoxStreamEv {
    let state = BedrockState {
        family,
        body,
        decoder: EventStreamDecoder::new(),
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
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    st.decoder.push(&bytes);
                    st.drain_frames();
                }
                Some(Err(e)) => st.finish(StreamEvent::Error(e)),
                None if st.decoder.buffered() > 0 => st.finish(StreamEvent::Error(
                    LlmError::Protocol("bedrock event stream truncated".into()),
                )),
                None => {
                    let reason = st.stop;
                    st.finish(StreamEvent::Stop { reason });
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::HttpClient;
    use crate::telemetry::{KEY_PROVIDER, KEY_REGION, SPAN_CHAT_STREAM, test_span};
    use event_stream::encode_message;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use secrecy::SecretString;

    fn chunk(body: Value) -> Vec<u8> {
        let envelope = json!({ "bytes": BASE64.encode(body.to_string()) });
        encode_message(
            &[
                (":event-type", "chunk"),
                (":content-type", "application/json"),
                (":message-type", "event"),
            ],
            envelope.to_string().as_bytes(),
        )
    }

    fn chat_for(server: &MockServer, model_id: &str) -> BedrockChat {
        let runtime = BedrockRuntime::new(
            HttpClient::new_default().unwrap(),
            Some("us-east-1".into()),
            Some(SecretString::from("AKID")),
            Some(SecretString::from("secret")),
            Some(server.base_url()),
        );
        BedrockChat::new(runtime, model_id.into(), 256)
    }

    #[test]
    fn family_from_model_id() {
        assert_eq!(ModelFamily::of("anthropic.claude-v2").unwrap(), ModelFamily::Anthropic);
        assert_eq!(ModelFamily::of("amazon.titan-text-express-v1").unwrap(), ModelFamily::Amazon);
        assert_eq!(ModelFamily::of("meta.llama2-13b-chat-v1").unwrap(), ModelFamily::Meta);
        assert_eq!(
            ModelFamily::of("us.anthropic.claude-3-haiku-20240307-v1:0").unwrap(),
            ModelFamily::Anthropic
        );
        assert!(matches!(ModelFamily::of("cohere.command-text-v14"), Err(LlmError::Validation(_))));
    }

    #[test]
    fn anthropic_prompt_alternates_turns() {
        let msgs = vec![
            ChatMessage::system("Be brief."),
            ChatMessage::user("Hi"),
            ChatMessage {
                role: Role::Assistant,
                content: "Hello".into(),
            },
            ChatMessage::user("Bye"),
        ];
        assert_eq!(
            turn_prompt(&msgs, "\n\nHuman:", "\n\nAssistant:"),
            "Be brief.\n\nHuman: Hi\n\nAssistant: Hello\n\nHuman: Bye\n\nAssistant:"
        );
    }

    #[test]
    fn anthropic_body_carries_fixed_temperature() {
        let req = ChatRequest::from_user("Hi");
        let body = ModelFamily::Anthropic.body(&req, ChatParams::FIXED, 300);
        assert_eq!(body["max_tokens_to_sample"], json!(300));
        assert!((body["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
        assert!(body.get("stop_sequences").is_none());
        assert_eq!(body["prompt"], json!("\n\nHuman: Hi\n\nAssistant:"));
    }

    #[test]
    fn titan_and_llama_bodies() {
        let req = ChatRequest {
            messages: vec![ChatMessage::user("Hi")],
            stop_sequences: Some(vec!["User:".into()]),
            ..ChatRequest::default()
        };
        let titan = ModelFamily::Amazon.body(&req, ChatParams::FIXED, 100);
        assert_eq!(titan["textGenerationConfig"]["maxTokenCount"], json!(100));
        assert_eq!(titan["textGenerationConfig"]["stopSequences"], json!(["User:"]));
        assert_eq!(titan["inputText"], json!("\n\nUser: Hi\n\nBot:"));

        let llama = ModelFamily::Meta.body(&req, ChatParams::FIXED, 100);
        assert_eq!(llama["prompt"], json!("[INST] Hi [/INST]"));
        assert_eq!(llama["max_gen_len"], json!(100));
    }

    #[tokio::test]
    async fn streams_anthropic_completion() {
        let server = MockServer::start();
        let mut wire = chunk(json!({"completion": " Hello", "stop_reason": null}));
        wire.extend(chunk(json!({
            "completion": " world",
            "stop_reason": "stop_sequence",
            "amazon-bedrock-invocationMetrics": {"inputTokenCount": 12, "outputTokenCount": 3}
        })));
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/model/anthropic.claude-v2/invoke-with-response-stream")
                .header_exists("authorization")
                .header_exists("x-amz-date")
                .header("accept", "application/vnd.amazon.eventstream")
                .json_body_partial(r#"{"max_tokens_to_sample":256}"#);
            then.status(200)
                .header("content-type", "application/vnd.amazon.eventstream")
                .header("x-amzn-requestid", "req-1")
                .body(wire.clone());
        });

        let client = chat_for(&server, "anthropic.claude-v2");
        let resp = client.chat(ChatRequest::from_user("Hi")).await.expect("chat ok");
        assert_eq!(resp.text, " Hello world");
        assert_eq!(resp.stop_reason, Some(StopReason::Stop));
        assert_eq!(resp.usage_prompt, 12);
        assert_eq!(resp.usage_completion, 3);
        assert_eq!(resp.provider, "bedrock");
        assert_eq!(resp.model, "anthropic.claude-v2");
        assert_eq!(resp.provider_request_id.as_deref(), Some("req-1"));
        m.assert();
    }

    #[tokio::test]
    async fn exception_frame_becomes_error() {
        let server = MockServer::start();
        let mut wire = chunk(json!({"completion": "partial"}));
        wire.extend(encode_message(
            &[
                (":exception-type", "validationException"),
                (":content-type", "application/json"),
                (":message-type", "exception"),
            ],
            br#"{"message":"bad input"}"#,
        ));
        let _m = server.mock(|when, then| {
            when.method(POST);
            then.status(200).body(wire.clone());
        });

        let client = chat_for(&server, "anthropic.claude-v2");
        let events: Vec<StreamEvent> = client
            .chat_stream(ChatRequest::from_user("Hi"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_text_delta(), Some("partial"));
        match &events[1] {
            StreamEvent::Error(LlmError::ProviderError { code, message, .. }) => {
                assert_eq!(code, "validationException");
                assert_eq!(message, "bad input");
            }
            other => panic!("expected ProviderError, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn throttling_exception_maps_to_rate_limited() {
        let server = MockServer::start();
        let wire = encode_message(
            &[
                (":exception-type", "throttlingException"),
                (":message-type", "exception"),
            ],
            br#"{"message":"slow down"}"#,
        );
        let _m = server.mock(|when, then| {
            when.method(POST);
            then.status(200).body(wire.clone());
        });
        let client = chat_for(&server, "anthropic.claude-v2");
        let err = client.chat(ChatRequest::from_user("Hi")).await.unwrap_err();
        assert!(matches!(err, LlmError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn truncated_body_is_protocol_error() {
        let server = MockServer::start();
        let wire = chunk(json!({"completion": "x"}));
        let cut = wire[..wire.len() - 3].to_vec();
        let _m = server.mock(|when, then| {
            when.method(POST);
            then.status(200).body(cut.clone());
        });
        let client = chat_for(&server, "anthropic.claude-v2");
        let err = client.chat(ChatRequest::from_user("Hi")).await.unwrap_err();
        assert!(matches!(err, LlmError::Protocol(_)));
    }

    #[tokio::test]
    async fn titan_stream_uses_output_text() {
        let server = MockServer::start();
        let wire = chunk(json!({"outputText": "Hi from Titan", "completionReason": "FINISH"}));
        let _m = server.mock(|when, then| {
            when.method(POST)
                .path("/model/amazon.titan-text-express-v1/invoke-with-response-stream");
            then.status(200).body(wire.clone());
        });
        let client = chat_for(&server, "amazon.titan-text-express-v1");
        let resp = client.chat(ChatRequest::from_user("Hi")).await.expect("chat ok");
        assert_eq!(resp.text, "Hi from Titan");
        assert_eq!(resp.stop_reason, Some(StopReason::Stop));
    }

    #[tokio::test]
    async fn chat_stream_span_carries_region() {
        let store = test_span::install_capture();
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST);
            then.status(200)
                .body(chunk(json!({"completion": "ok", "stop_reason": "stop_sequence"})));
        });
        let client = chat_for(&server, "anthropic.claude-v2");
        client.chat(ChatRequest::from_user("Hi")).await.expect("chat ok");

        let fields = store.fields_of(SPAN_CHAT_STREAM).expect("llm.chat_stream span");
        assert_eq!(fields.get(KEY_PROVIDER).map(String::as_str), Some("bedrock"));
        assert_eq!(fields.get(KEY_REGION).map(String::as_str), Some("us-east-1"));
    }

    #[tokio::test]
    async fn unknown_family_fails_before_sending() {
        let server = MockServer::start();
        let client = chat_for(&server, "cohere.command-text-v14");
        let err = client.chat(ChatRequest::from_user("Hi")).await.unwrap_err();
        assert!(matches!(err, LlmError::Validation(_)));
    }
}
