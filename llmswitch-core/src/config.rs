use std::{fmt, fs, path::Path, str::FromStr};

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::error::{CoreResult, LlmError};

pub const ENV_LLM_TYPE: &str = "LLM_TYPE";
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
/// Read by the Vertex path, which is currently disabled.
pub const ENV_VERTEX_PROJECT_ID: &str = "VERTEX_PROJECT_ID";
pub const ENV_OPENAI_VERSION: &str = "OPENAI_VERSION";
pub const ENV_OPENAI_BASE_URL: &str = "OPENAI_BASE_URL";
pub const ENV_OPENAI_ENGINE: &str = "OPENAI_ENGINE";
pub const ENV_AWS_ACCESS_KEY: &str = "AWS_ACCESS_KEY";
pub const ENV_AWS_SECRET_KEY: &str = "AWS_SECRET_KEY";
pub const ENV_AWS_REGION: &str = "AWS_REGION";
pub const ENV_AWS_MODEL_ID: &str = "AWS_MODEL_ID";

pub const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_AZURE_API_VERSION: &str = "2023-05-15";
pub const DEFAULT_BEDROCK_MODEL_ID: &str = "anthropic.claude-v2";
pub const DEFAULT_BEDROCK_MAX_TOKENS: u32 = 256;

/// Supported provider keys. Variants are kept in the same order as their
/// string forms sort, which is the order used in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LlmType {
    #[serde(rename = "azure")]
    Azure,
    #[serde(rename = "bedrock")]
    Bedrock,
    #[default]
    #[serde(rename = "openai")]
    OpenAI,
}

impl LlmType {
    pub const ALL: [LlmType; 3] = [LlmType::Azure, LlmType::Bedrock, LlmType::OpenAI];

    pub fn as_str(self) -> &'static str {
        match self {
            LlmType::Azure => "azure",
            LlmType::Bedrock => "bedrock",
            LlmType::OpenAI => "openai",
        }
    }

    fn not_found_message() -> String {
        let keys: Vec<&str> = Self::ALL.iter().map(|t| t.as_str()).collect();
        format!(
            "LLM type not found. Please set {ENV_LLM_TYPE} to one of: {}.",
            keys.join(", ")
        )
    }
}

impl fmt::Display for LlmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LlmType {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| LlmError::Configuration(Self::not_found_message()))
    }
}

fn de_secret<'de, D>(d: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(d)?.map(SecretString::from))
}

fn default_openai_base() -> String {
    DEFAULT_OPENAI_BASE.to_string()
}
fn default_openai_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}
fn default_api_version() -> String {
    DEFAULT_AZURE_API_VERSION.to_string()
}
fn default_model_id() -> String {
    DEFAULT_BEDROCK_MODEL_ID.to_string()
}
fn default_max_tokens() -> u32 {
    DEFAULT_BEDROCK_MAX_TOKENS
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiSettings {
    #[serde(default, deserialize_with = "de_secret")]
    pub api_key: Option<SecretString>,
    #[serde(default = "default_openai_base")]
    pub base_url: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_openai_base(),
            model: default_openai_model(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AzureSettings {
    #[serde(default, deserialize_with = "de_secret")]
    pub api_key: Option<SecretString>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Deployment (engine) name.
    #[serde(default)]
    pub deployment: Option<String>,
}

impl Default for AzureSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            api_version: default_api_version(),
            deployment: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BedrockSettings {
    #[serde(default, deserialize_with = "de_secret")]
    pub access_key: Option<SecretString>,
    #[serde(default, deserialize_with = "de_secret")]
    pub secret_key: Option<SecretString>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Overrides `https://bedrock-runtime.{region}.amazonaws.com`.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for BedrockSettings {
    fn default() -> Self {
        Self {
            access_key: None,
            secret_key: None,
            region: None,
            model_id: default_model_id(),
            endpoint: None,
            max_tokens: default_max_tokens(),
        }
    }
}

/// Per-provider inputs, tagged by provider key.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "llm_type")]
pub enum ProviderSettings {
    #[serde(rename = "azure")]
    Azure(AzureSettings),
    #[serde(rename = "bedrock")]
    Bedrock(BedrockSettings),
    #[serde(rename = "openai")]
    OpenAI(OpenAiSettings),
}

impl ProviderSettings {
    pub fn llm_type(&self) -> LlmType {
        match self {
            ProviderSettings::Azure(_) => LlmType::Azure,
            ProviderSettings::Bedrock(_) => LlmType::Bedrock,
            ProviderSettings::OpenAI(_) => LlmType::OpenAI,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds (default 60000ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}

/// Process-wide LLM configuration. Build it once at startup and hand it by
/// reference to whatever needs a chat client.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub llm: ProviderSettings,
    /// HTTP client configuration (timeouts, pooling). Missing in older configs → defaults.
    #[serde(default)]
    pub http: HttpCfg,
}

impl Config {
    /// Read the process environment once.
    pub fn from_env() -> CoreResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Only the variables belonging
    /// to the selected provider are consulted; defaults apply to unset
    /// variables only. Credentials are not validated here.
    pub fn from_lookup<F>(lookup: F) -> CoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let llm_type = match lookup(ENV_LLM_TYPE) {
            Some(raw) => raw.parse::<LlmType>()?,
            None => LlmType::default(),
        };
        let secret = |key: &str| lookup(key).map(SecretString::from);

        let llm = match llm_type {
            LlmType::OpenAI => ProviderSettings::OpenAI(OpenAiSettings {
                api_key: secret(ENV_OPENAI_API_KEY),
                ..OpenAiSettings::default()
            }),
            LlmType::Azure => ProviderSettings::Azure(AzureSettings {
                api_key: secret(ENV_OPENAI_API_KEY),
                base_url: lookup(ENV_OPENAI_BASE_URL),
                api_version: lookup(ENV_OPENAI_VERSION).unwrap_or_else(default_api_version),
                deployment: lookup(ENV_OPENAI_ENGINE),
            }),
            LlmType::Bedrock => ProviderSettings::Bedrock(BedrockSettings {
                access_key: secret(ENV_AWS_ACCESS_KEY),
                secret_key: secret(ENV_AWS_SECRET_KEY),
                region: lookup(ENV_AWS_REGION),
                model_id: lookup(ENV_AWS_MODEL_ID).unwrap_or_else(default_model_id),
                ..BedrockSettings::default()
            }),
        };
        debug!(llm.provider = %llm_type, "llm configuration read from environment");

        Ok(Self {
            llm,
            http: HttpCfg::default(),
        })
    }

    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| LlmError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| LlmError::Other(e.into()))?
            }
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| LlmError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| LlmError::Other(e.into()))
                .or_else(|_| toml::from_str::<Self>(s).map_err(|e| LlmError::Other(e.into())))?,
        };
        Ok(cfg)
    }
}
