//! Azure-hosted OpenAI deployments.
//!
//! Same wire format as the OpenAI endpoint; the model is implied by the
//! deployment in the URL, authentication uses the `api-key` header and every
//! request carries an `api-version` query parameter.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info_span};
use tracing_futures::Instrument;

use crate::client::{ChatClient, ChatParams};
use crate::config::{AzureSettings, ENV_OPENAI_BASE_URL, ENV_OPENAI_ENGINE, LlmType};
use crate::error::{CoreResult, LlmError};
use crate::http_client::{HttpClient, RequestCtx};
use crate::model::ChatRequest;
use crate::normalizer::normalize_chat;
use crate::providers::openai::{OAChatReq, sse_events};
use crate::stream::{BoxStreamEv, with_request_id};

#[derive(Debug, Clone)]
pub struct AzureOpenAI {
    http: HttpClient,
    api_key: Option<SecretString>,
    base: Option<String>,
    api_version: String,
    deployment: Option<String>,
    params: ChatParams,
}

impl AzureOpenAI {
    pub fn new(
        http: HttpClient,
        api_key: Option<SecretString>,
        base: Option<String>,
        api_version: String,
        deployment: Option<String>,
    ) -> Self {
        Self {
            http,
            api_key,
            base,
            api_version,
            deployment,
            params: ChatParams::FIXED,
        }
    }

    pub fn from_settings(http: HttpClient, s: &AzureSettings) -> Self {
        Self::new(
            http,
            s.api_key.clone(),
            s.base_url.clone(),
            s.api_version.clone(),
            s.deployment.clone(),
        )
    }

    /// Completions URL. Base URL and deployment are only required here, at
    /// use time.
    fn endpoint(&self) -> CoreResult<String> {
        let base = self.base.as_deref().ok_or_else(|| {
            LlmError::Validation(format!("azure base url is not set ({ENV_OPENAI_BASE_URL})"))
        })?;
        let deployment = self.deployment.as_deref().ok_or_else(|| {
            LlmError::Validation(format!("azure deployment is not set ({ENV_OPENAI_ENGINE})"))
        })?;
        let mut url = Url::parse(base)
            .map_err(|e| LlmError::Validation(format!("invalid azure base url '{base}': {e}")))?;
        url.path_segments_mut()
            .map_err(|_| LlmError::Validation(format!("azure base url '{base}' cannot take a path")))?
            .pop_if_empty()
            .extend(["openai", "deployments", deployment, "chat", "completions"]);
        url.query_pairs_mut().append_pair("api-version", &self.api_version);
        Ok(url.into())
    }
}

#[async_trait]
impl ChatClient for AzureOpenAI {
    fn llm_type(&self) -> LlmType {
        LlmType::Azure
    }

    fn model(&self) -> &str {
        self.deployment.as_deref().unwrap_or_default()
    }

    fn params(&self) -> ChatParams {
        self.params
    }

    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<BoxStreamEv> {
        let url = self.endpoint()?;
        let req = normalize_chat(req);
        let payload = OAChatReq::new(None, &req, self.params);
        let ctx = RequestCtx {
            request_id: req.request_id.as_deref(),
        };
        let key = self
            .api_key
            .as_ref()
            .map(|k| k.expose_secret().to_string());
        let hdrs: Vec<(&str, &str)> = key.iter().map(|k| ("api-key", k.as_str())).collect();

        let span = info_span!("llm.chat_stream", llm.provider = "azure", llm.model = %self.model());
        let resp = self
            .http
            .post_sse_lines("azure", &url, &payload, &hdrs, &ctx)
            .instrument(span.clone())
            .await?;
        debug!(
            parent: &span,
            latency.ms = resp.latency_ms,
            llm.req_id = ?resp.provider_request_id,
            "stream opened"
        );
        Ok(with_request_id(resp.provider_request_id, sse_events("azure", resp.body))
            .instrument(span)
            .boxed())
    }
}
