//! Voice processing: audio codec plus the cloud STT/TTS clients.

pub mod audio;
pub mod stt;
pub mod tts;

pub use stt::SttClient;
pub use tts::{Synthesis, TtsClient};
