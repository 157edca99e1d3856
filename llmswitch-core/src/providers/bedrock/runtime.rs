use chrono::Utc;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use super::sigv4::{self, SignableRequest, SigningParams};
use crate::config::{BedrockSettings, ENV_AWS_ACCESS_KEY, ENV_AWS_REGION, ENV_AWS_SECRET_KEY};
use crate::error::{CoreResult, LlmError};
use crate::http_client::{ByteStream, HttpClient, RequestCtx, StreamingResponse};

const SIGNING_SERVICE: &str = "bedrock";
const EVENT_STREAM_CONTENT_TYPE: &str = "application/vnd.amazon.eventstream";

/// Regional Bedrock runtime service client. Holds the credentials and knows
/// how to sign and send model invocations; it is the prerequisite for
/// `BedrockChat`.
#[derive(Debug, Clone)]
pub struct BedrockRuntime {
    http: HttpClient,
    region: Option<String>,
    access_key: Option<SecretString>,
    secret_key: Option<SecretString>,
    endpoint: Option<String>,
}

impl BedrockRuntime {
    pub fn new(
        http: HttpClient,
        region: Option<String>,
        access_key: Option<SecretString>,
        secret_key: Option<SecretString>,
        endpoint: Option<String>,
    ) -> Self {
        Self {
            http,
            region,
            access_key,
            secret_key,
            endpoint,
        }
    }

    pub fn from_settings(http: HttpClient, s: &BedrockSettings) -> Self {
        Self::new(
            http,
            s.region.clone(),
            s.access_key.clone(),
            s.secret_key.clone(),
            s.endpoint.clone(),
        )
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    fn require_region(&self) -> CoreResult<&str> {
        self.region
            .as_deref()
            .ok_or_else(|| LlmError::Validation(format!("aws region is not set ({ENV_AWS_REGION})")))
    }

    /// Base URL of the runtime API.
    pub fn endpoint(&self) -> CoreResult<String> {
        match &self.endpoint {
            Some(e) => Ok(e.trim_end_matches('/').to_string()),
            None => Ok(format!(
                "https://bedrock-runtime.{}.amazonaws.com",
                self.require_region()?
            )),
        }
    }

    fn credentials(&self) -> CoreResult<(&SecretString, &SecretString)> {
        let access = self.access_key.as_ref().ok_or_else(|| {
            LlmError::Validation(format!("aws access key is not set ({ENV_AWS_ACCESS_KEY})"))
        })?;
        let secret = self.secret_key.as_ref().ok_or_else(|| {
            LlmError::Validation(format!("aws secret key is not set ({ENV_AWS_SECRET_KEY})"))
        })?;
        Ok((access, secret))
    }

    /// POST `/model/{model_id}/invoke-with-response-stream`, signed with
    /// SigV4. The response body is an AWS event stream.
    pub async fn invoke_with_response_stream(
        &self,
        model_id: &str,
        body: Vec<u8>,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<StreamingResponse<ByteStream>> {
        let region = self.require_region()?;
        let (access, secret) = self.credentials()?;
        let endpoint = self.endpoint()?;

        let path = format!(
            "/model/{}/invoke-with-response-stream",
            sigv4::uri_encode(model_id)
        );
        let url = format!("{endpoint}{path}");
        let parsed = Url::parse(&url)
            .map_err(|e| LlmError::Validation(format!("invalid bedrock endpoint '{endpoint}': {e}")))?;
        let host = match (parsed.host_str(), parsed.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            (None, _) => {
                return Err(LlmError::Validation(format!(
                    "bedrock endpoint '{endpoint}' has no host"
                )));
            }
        };

        let base_headers: [(&str, &str); 2] = [
            ("content-type", "application/json"),
            ("accept", EVENT_STREAM_CONTENT_TYPE),
        ];
        let method = http::Method::POST;
        let signed = sigv4::sign(
            &SignableRequest {
                method: &method,
                host: &host,
                path: parsed.path(),
                headers: &base_headers,
                body: &body,
            },
            &SigningParams {
                access_key: access.expose_secret(),
                secret_key: secret.expose_secret(),
                region,
                service: SIGNING_SERVICE,
                time: Utc::now(),
            },
        )?;
        debug!(llm.model = model_id, aws.region = region, "signed bedrock invocation");

        let mut headers: Vec<(&str, &str)> = base_headers.to_vec();
        headers.extend(signed.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        self.http
            .post_stream("bedrock", parsed.as_str(), body, &headers, ctx)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(region: Option<&str>, endpoint: Option<&str>, creds: bool) -> BedrockRuntime {
        BedrockRuntime::new(
            HttpClient::new_default().unwrap(),
            region.map(str::to_string),
            creds.then(|| SecretString::from("AKID")),
            creds.then(|| SecretString::from("secret")),
            endpoint.map(str::to_string),
        )
    }

    #[test]
    fn regional_endpoint() {
        let rt = runtime(Some("us-west-2"), None, true);
        assert_eq!(
            rt.endpoint().unwrap(),
            "https://bedrock-runtime.us-west-2.amazonaws.com"
        );
        assert_eq!(rt.region(), Some("us-west-2"));
    }

    #[test]
    fn endpoint_override_wins() {
        let rt = runtime(Some("us-west-2"), Some("http://localhost:4566/"), true);
        assert_eq!(rt.endpoint().unwrap(), "http://localhost:4566");
    }

    #[tokio::test]
    async fn missing_region_fails_at_use_time() {
        let rt = runtime(None, None, true);
        let err = rt
            .invoke_with_response_stream("anthropic.claude-v2", vec![], &RequestCtx::default())
            .await
            .err()
            .expect("error");
        match err {
            LlmError::Validation(msg) => assert!(msg.contains("AWS_REGION")),
            other => panic!("expected Validation, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_credentials_fail_at_use_time() {
        let rt = runtime(Some("us-east-1"), None, false);
        let err = rt
            .invoke_with_response_stream("anthropic.claude-v2", vec![], &RequestCtx::default())
            .await
            .err()
            .expect("error");
        match err {
            LlmError::Validation(msg) => assert!(msg.contains("AWS_ACCESS_KEY")),
            other => panic!("expected Validation, got: {:?}", other),
        }
    }
}
