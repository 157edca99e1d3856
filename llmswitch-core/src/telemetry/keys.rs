/// Span field and span names used by the clients.
/// Keep these stable; changing them is a breaking change for dashboards.
pub const KEY_PROVIDER: &str = "llm.provider";
pub const KEY_MODEL: &str = "llm.model";
pub const KEY_REGION: &str = "aws.region";

pub const SPAN_CLIENT: &str = "llm.client";
pub const SPAN_CHAT_STREAM: &str = "llm.chat_stream";
