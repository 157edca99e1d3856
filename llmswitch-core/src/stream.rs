//! Streaming primitives exposed by llmswitch.
//!
//! Contract:
//! - A `RequestId` event, when the provider returned one, comes first.
//! - Clients may emit 0..n `DeltaText` events and `Usage` updates.
//! - The stream **must** terminate with exactly one terminal event: `Stop` or `Error`.
//! - After a terminal event, no further events are emitted.
//!
//! `StreamEvent` does not derive `Clone` / `PartialEq` because `Error` carries
//! `LlmError`.

/// What the caller receives incrementally.
#[non_exhaustive]
#[derive(Debug)]
pub enum StreamEvent {
    /// Request id the provider assigned (`x-request-id`, `apim-request-id`,
    /// `x-amzn-requestid`).
    RequestId(String),
    /// Partial assistant text (delta). Empty string is allowed but should be rare.
    DeltaText(String),
    /// Token usage, when the provider reports it.
    Usage {
        prompt: Option<u32>,
        completion: Option<u32>,
    },
    /// Provider has decided to stop (with reason).
    Stop {
        reason: Option<crate::model::StopReason>,
    },
    /// Transport/parse error surfaced mid-stream; stream ends after this.
    Error(crate::error::LlmError),
}

impl StreamEvent {
    /// Returns true if this event terminates the stream (`Stop` or `Error`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stop { .. } | Self::Error(_))
    }

    /// Convenience accessor for `DeltaText` contents.
    pub fn as_text_delta(&self) -> Option<&str> {
        match self {
            Self::DeltaText(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Boxed stream of streaming events. Every chat client returns this.
pub type BoxStreamEv = futures::stream::BoxStream<'static, StreamEvent>;

/// Prefix `events` with the provider's request id, if any.
pub(crate) fn with_request_id(id: Option<String>, events: BoxStreamEv) -> BoxStreamEv {
    use futures::StreamExt;
    futures::stream::iter(id.map(StreamEvent::RequestId))
        .chain(events)
        .boxed()
}
