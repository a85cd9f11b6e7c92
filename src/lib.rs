//! Web Chat Relay
//!
//! Exposes a browser-driven chat session (a userscript watching the page and
//! reporting the answer text as it grows) as an OpenAI-compatible
//! `/v1/chat/completions` endpoint:
//! - Quiescence-based completion detection for producers with no "done" signal
//! - Strict FIFO serialization of consumers over a single producer
//! - Streaming (SSE deltas) and aggregate responses
//! - Producer disconnect and silence handling

pub mod config;
pub mod error;
pub mod relay;
pub mod server;

// Re-exports for convenience
pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use relay::{RelayCore, RelayHandle};
