//! Voicebridge - Real-Time Voice Agent Library
//!
//! Bridges a telephony carrier's media-stream WebSocket to a cloud
//! speech/LLM stack:
//! - Carrier protocol adapter (JSON media frames over WS)
//! - Per-call session state machine with barge-in handling
//! - Streaming STT → LLM → TTS turn pipeline with ordered PCM delivery
//! - Persona + knowledge-base store with keyword retrieval
//! - Outbound-call trigger and admin endpoints
//!
//! # Example
//!
//! ```ignore
//! use voicebridge::config::Settings;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::from_env();
//!     voicebridge::server::start(settings).await
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod config;
pub mod voice;
pub mod agent;
pub mod knowledge;
pub mod carrier;
pub mod session;
pub mod pipeline;
pub mod server;

// Re-export commonly used types for convenience
pub use agent::LlmClient;
pub use carrier::CarrierEvent;
pub use config::Settings;
pub use knowledge::KnowledgeStore;
pub use session::{Session, SessionRegistry};
pub use voice::{SttClient, TtsClient};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Truncate a string to at most `max_chars` characters for logging,
/// never splitting a multi-byte character.
pub fn truncate_safe(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}
