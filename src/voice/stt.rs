//! Cloud STT client
//!
//! Wraps PCM in WAV and posts it to the provider. Returns `None` for
//! anything that should simply skip the turn: empty input, provider
//! errors, empty transcripts. Retry policy belongs to the caller.

use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SttConfig;
use crate::voice::audio;

const STT_TIMEOUT: Duration = Duration::from_secs(30);

/// Phrases the provider produces from pure silence or line noise.
const FILLER_TRANSCRIPTS: &[&str] = &[
    "thank you",
    "thank you.",
    "thanks for watching",
    "thanks for watching.",
    "you",
    "you.",
    "bye",
    "bye.",
    "hmm",
    "uh",
    "...",
];

pub struct SttClient {
    client: Client,
    api_key: String,
    url: String,
}

impl SttClient {
    pub fn new(config: &SttConfig) -> Option<Self> {
        let api_key = config.api_key.clone()?;
        let url = config.url.clone()?;
        Some(Self { client: Client::new(), api_key, url })
    }

    /// Transcribe 16-bit LE mono PCM. `language` defaults to "en".
    pub async fn transcribe(
        &self,
        pcm: &[u8],
        sample_rate: u32,
        language: Option<&str>,
    ) -> Option<String> {
        if pcm.is_empty() {
            return None;
        }

        let wav = match audio::pcm_to_wav(pcm, sample_rate) {
            Ok(wav) => wav,
            Err(e) => {
                warn!("STT WAV framing failed: {}", e);
                return None;
            }
        };

        debug!(
            "STT request: {} bytes ({:.1}s at {} Hz)",
            wav.len(),
            pcm.len() as f64 / 2.0 / sample_rate as f64,
            sample_rate
        );

        match self.request(wav, language.unwrap_or("en")).await {
            Ok(Some(text)) => {
                info!("Transcribed: \"{}\"", crate::truncate_safe(&text, 120));
                Some(text)
            }
            Ok(None) => {
                debug!("Empty transcript");
                None
            }
            Err(e) => {
                warn!("STT error: {}", e);
                None
            }
        }
    }

    async fn request(&self, wav: Vec<u8>, language: &str) -> Result<Option<String>> {
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("language_code", language.to_string());

        let response = self
            .client
            .post(&self.url)
            .header("api-subscription-key", &self.api_key)
            .multipart(form)
            .timeout(STT_TIMEOUT)
            .send()
            .await
            .context("Failed to reach STT provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("STT API error ({}): {}", status, crate::truncate_safe(&body, 300));
        }

        let body: serde_json::Value =
            response.json().await.context("Failed to parse STT response")?;

        let transcript = extract_transcript(&body)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .filter(|t| !is_filler_transcript(t));

        Ok(transcript)
    }
}

/// Pull the top alternative's transcript out of a provider response.
///
/// Handles both a flat `transcript` field and the nested
/// `results.channels[0].alternatives[0].transcript` shape.
fn extract_transcript(body: &serde_json::Value) -> Option<&str> {
    if let Some(t) = body.get("transcript").and_then(|t| t.as_str()) {
        return Some(t);
    }
    body.get("results")
        .and_then(|r| r.get("channels"))
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|ch| ch.get("alternatives"))
        .and_then(|a| a.as_array())
        .and_then(|arr| arr.first())
        .and_then(|alt| alt.get("transcript"))
        .and_then(|t| t.as_str())
}

fn is_filler_transcript(transcript: &str) -> bool {
    let lower = transcript.to_lowercase();
    FILLER_TRANSCRIPTS.iter().any(|f| lower == *f)
}
