//! Tracing conventions shared by every chat client.
//!
//! Nothing here installs a subscriber; binaries pick their own
//! (`llmswitch` uses `tracing_subscriber::fmt` with an `EnvFilter`).

pub mod keys;
#[cfg(test)]
pub mod test_span;

pub use keys::*;
