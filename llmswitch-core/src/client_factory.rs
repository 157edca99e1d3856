use tracing::{field, info, info_span};

use crate::client::ChatClient;
use crate::config::{Config, ProviderSettings};
use crate::error::CoreResult;
use crate::http_client::HttpClient;
use crate::providers::azure::AzureOpenAI;
use crate::providers::bedrock::{BedrockChat, BedrockRuntime};
use crate::providers::openai::OpenAI;

/// Build the chat client selected by `cfg.llm`.
///
/// Every call returns a fresh, independently owned client. Missing
/// credentials are not checked here; they surface on the first request.
pub fn get_client(cfg: &Config) -> CoreResult<Box<dyn ChatClient>> {
    let llm_type = cfg.llm.llm_type();
    let span = info_span!(
        "llm.client",
        llm.provider = %llm_type,
        llm.model = field::Empty
    );
    let _enter = span.enter();

    let http = HttpClient::new(&cfg.http)?;
    let client: Box<dyn ChatClient> = match &cfg.llm {
        ProviderSettings::OpenAI(s) => Box::new(OpenAI::from_settings(http, s)),
        ProviderSettings::Azure(s) => Box::new(AzureOpenAI::from_settings(http, s)),
        ProviderSettings::Bedrock(s) => {
            let runtime = BedrockRuntime::from_settings(http, s);
            Box::new(BedrockChat::from_settings(runtime, s))
        }
    };
    span.record("llm.model", client.model());
    info!("chat client ready");
    Ok(client)
}

/// `Config::from_env` followed by `get_client`.
pub fn get_client_from_env() -> CoreResult<Box<dyn ChatClient>> {
    get_client(&Config::from_env()?)
}
