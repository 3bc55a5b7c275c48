//! LLM access and prompt assembly.

pub mod llm;
pub mod prompt;

pub use llm::LlmClient;
