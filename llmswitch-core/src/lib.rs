pub mod client;
pub mod client_factory;
pub mod config;
pub mod error;
pub mod http_client;
pub mod model;
pub mod normalizer;
pub mod providers;
pub mod stream;
pub mod telemetry;

pub use client::{ChatClient, ChatParams};
pub use client_factory::{get_client, get_client_from_env};
pub use config::{Config, LlmType, ProviderSettings};
pub use error::{CoreResult, LlmError};
