use thiserror::Error;

/// Core error type for llmswitch.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Raised while reading configuration, e.g. an unsupported `LLM_TYPE`.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limited by provider {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("provider unavailable: {provider}")]
    ProviderUnavailable { provider: String },

    #[error("upstream error from {provider}: {code} {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    /// Malformed response framing (SSE payloads, AWS event-stream frames).
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, LlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_display_keeps_message() {
        let err = LlmError::Configuration("LLM type not found".into());
        assert_eq!(err.to_string(), "configuration error: LLM type not found");
    }

    #[test]
    fn anyhow_converts_into_other() {
        let err: LlmError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, LlmError::Other(_)));
    }
}
