//! Carrier media-stream wire protocol
//!
//! The carrier speaks JSON frames over the WebSocket, each tagged by an
//! `event` field. Inbound parsing is tolerant: the stream id and custom
//! parameters may arrive on `connected`, `start`, or ride along with
//! `media`, and field casing follows the carrier's camelCase convention
//! with snake_case accepted as an alias.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

/// Name of the mark frame closing an assistant reply.
pub const REPLY_DONE_MARK: &str = "assistant_reply_done";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unparseable frame: {0}")]
    Malformed(String),
    #[error("unknown event \"{0}\"")]
    UnknownEvent(String),
    #[error("invalid media payload: {0}")]
    BadPayload(#[from] base64::DecodeError),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum CarrierEvent {
    Connected {
        #[serde(rename = "streamSid", alias = "stream_sid", default)]
        stream_sid: Option<String>,
        #[serde(rename = "customParameters", alias = "custom_parameters", default)]
        custom_parameters: Option<HashMap<String, String>>,
    },
    Start {
        #[serde(rename = "streamSid", alias = "stream_sid", default)]
        stream_sid: Option<String>,
        #[serde(default)]
        start: Option<StartMetadata>,
    },
    Media {
        #[serde(rename = "streamSid", alias = "stream_sid", default)]
        stream_sid: Option<String>,
        media: MediaPayload,
    },
    Stop {
        #[serde(default)]
        stop: Option<StopMetadata>,
    },
    Mark {
        #[serde(default)]
        mark: Option<MarkMetadata>,
    },
    Clear {},
}

#[derive(Debug, Deserialize)]
pub struct StartMetadata {
    #[serde(rename = "streamSid", alias = "stream_sid", default)]
    pub stream_sid: Option<String>,
    #[serde(rename = "customParameters", alias = "custom_parameters", default)]
    pub custom_parameters: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    /// Base64 of 16-bit LE mono PCM at the session rate.
    pub payload: String,
    /// `inbound` is caller audio; `outbound` is our own echo and is
    /// discarded.
    #[serde(default)]
    pub track: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StopMetadata {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MarkMetadata {
    #[serde(default)]
    pub name: Option<String>,
}

impl MediaPayload {
    pub fn is_inbound(&self) -> bool {
        self.track.as_deref().map_or(true, |t| t != "outbound")
    }

    pub fn decode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(BASE64.decode(&self.payload)?)
    }
}

impl CarrierEvent {
    /// Stream sid carried by this event, wherever the carrier put it.
    pub fn stream_sid(&self) -> Option<&str> {
        match self {
            CarrierEvent::Connected { stream_sid, .. } => stream_sid.as_deref(),
            CarrierEvent::Start { stream_sid, start } => stream_sid
                .as_deref()
                .or_else(|| start.as_ref().and_then(|s| s.stream_sid.as_deref())),
            CarrierEvent::Media { stream_sid, .. } => stream_sid.as_deref(),
            _ => None,
        }
    }

    /// Custom parameters carried by this event, if any.
    pub fn custom_parameters(&self) -> Option<&HashMap<String, String>> {
        match self {
            CarrierEvent::Connected { custom_parameters, .. } => custom_parameters.as_ref(),
            CarrierEvent::Start { start, .. } => {
                start.as_ref().and_then(|s| s.custom_parameters.as_ref())
            }
            _ => None,
        }
    }
}

const KNOWN_EVENTS: &[&str] = &["connected", "start", "media", "stop", "mark", "clear"];

/// Parse an inbound frame, classifying unknown events separately from
/// malformed JSON so the gateway can log them distinctly.
pub fn parse_event(text: &str) -> Result<CarrierEvent, ProtocolError> {
    match serde_json::from_str::<CarrierEvent>(text) {
        Ok(event) => Ok(event),
        Err(e) => {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
                if let Some(event) = value.get("event").and_then(|v| v.as_str()) {
                    if !KNOWN_EVENTS.contains(&event) {
                        return Err(ProtocolError::UnknownEvent(event.to_string()));
                    }
                }
            }
            Err(ProtocolError::Malformed(e.to_string()))
        }
    }
}

/// Outbound media frame. Sequence numbers go out as decimal strings.
pub fn media_frame(stream_sid: &str, sequence_number: u64, pcm: &[u8]) -> String {
    serde_json::json!({
        "event": "media",
        "streamSid": stream_sid,
        "sequenceNumber": sequence_number.to_string(),
        "media": { "payload": BASE64.encode(pcm) }
    })
    .to_string()
}

/// Outbound mark frame.
pub fn mark_frame(stream_sid: &str, name: &str) -> String {
    serde_json::json!({
        "event": "mark",
        "streamSid": stream_sid,
        "mark": { "name": name }
    })
    .to_string()
}
