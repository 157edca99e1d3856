pub mod azure;
pub mod bedrock;
pub mod openai;
