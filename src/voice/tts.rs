//! Cloud TTS client
//!
//! Posts text to the provider and parses the returned WAV into raw
//! 16-bit LE mono PCM. The provider answers at its own rate (commonly
//! 24 kHz) regardless of the requested one, so the result carries the
//! header's actual sample rate and the caller resamples.

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::TtsConfig;
use crate::voice::audio;

const TTS_TIMEOUT: Duration = Duration::from_secs(30);

/// Legacy OpenAI-style voice ids mapped onto provider voices. Unknown
/// ids fall back to the configured default voice.
static VOICE_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("alloy", "meera"),
        ("echo", "arvind"),
        ("fable", "maitreyi"),
        ("onyx", "amol"),
        ("nova", "pavithra"),
        ("shimmer", "misha"),
    ])
});

/// Known provider voice ids, used to pass native ids through untouched.
const PROVIDER_VOICES: &[&str] =
    &["meera", "pavithra", "maitreyi", "arvind", "amol", "amartya", "misha", "vian"];

/// A synthesized fragment: PCM plus the rate it was produced at.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    voice: &'a str,
    sample_rate: u32,
}

pub struct TtsClient {
    client: Client,
    api_key: String,
    url: String,
    default_voice: String,
}

impl TtsClient {
    pub fn new(config: &TtsConfig) -> Option<Self> {
        let api_key = config.api_key.clone()?;
        let url = config.url.clone()?;
        Some(Self {
            client: Client::new(),
            api_key,
            url: url.trim_end_matches('/').to_string(),
            default_voice: config.default_voice.clone(),
        })
    }

    /// Synthesize text. `voice` may be a provider id, a legacy alias, or
    /// `None` for the default voice. Empty text is rejected.
    pub async fn synthesize(
        &self,
        text: &str,
        voice: Option<&str>,
        target_sample_rate: u32,
    ) -> Result<Synthesis> {
        if text.trim().is_empty() {
            bail!("Cannot synthesize empty text");
        }

        let voice = self.resolve_voice(voice);
        debug!("TTS synthesizing with {}: \"{}\"", voice, crate::truncate_safe(text, 80));

        let request = SpeechRequest { text, voice, sample_rate: target_sample_rate };

        let response = self
            .client
            .post(&self.url)
            .header("api-subscription-key", &self.api_key)
            .json(&request)
            .timeout(TTS_TIMEOUT)
            .send()
            .await
            .context("Failed to reach TTS provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("TTS API error ({}): {}", status, crate::truncate_safe(&body, 300));
        }

        let wav_bytes = response.bytes().await.context("Failed to read TTS response")?;
        let (pcm, sample_rate) = audio::wav_to_pcm(&wav_bytes)?;

        info!(
            "TTS produced {} bytes ({:.1}s at {} Hz)",
            pcm.len(),
            pcm.len() as f64 / 2.0 / sample_rate as f64,
            sample_rate
        );

        Ok(Synthesis { pcm, sample_rate })
    }

    /// Map a requested voice id to a provider voice.
    fn resolve_voice<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        let Some(requested) = requested.map(str::trim).filter(|v| !v.is_empty()) else {
            return &self.default_voice;
        };
        if PROVIDER_VOICES.contains(&requested) {
            return requested;
        }
        if let Some(mapped) = VOICE_ALIASES.get(requested) {
            return mapped;
        }
        warn!("Unknown voice \"{}\", falling back to {}", requested, self.default_voice);
        &self.default_voice
    }
}
