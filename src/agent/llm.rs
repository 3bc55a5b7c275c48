//! Streaming LLM client
//!
//! Talks to the provider's generate endpoints: a Server-Sent-Events
//! streaming endpoint for live replies and a plain one used as a
//! fallback. SSE framing is line-buffered because provider frames land
//! on arbitrary read boundaries; a `data:` line split across two reads
//! must be reassembled before parsing.

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LlmConfig;

/// Sampling parameters for conversational replies.
const TEMPERATURE: f64 = 0.7;
const MAX_OUTPUT_TOKENS: u32 = 150;
const TOP_P: f64 = 1.0;
const TOP_K: u32 = 40;

/// Deadline for the provider to start answering. The stream itself is
/// unbounded; the token cap and finish reason bound it instead.
const INITIAL_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct LlmClient {
    client: Arc<Client>,
    api_key: String,
    api_url: Option<String>,
    stream_url: String,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Option<Self> {
        let api_key = config.api_key.clone()?;
        let stream_url = config.stream_url.clone()?;
        Some(Self {
            client: Arc::new(Client::new()),
            api_key,
            api_url: config.api_url.clone(),
            stream_url,
        })
    }

    fn request_body(prompt: &str) -> Value {
        json!({
            "contents": [ { "parts": [ { "text": prompt } ] } ],
            "generationConfig": {
                "temperature": TEMPERATURE,
                "maxOutputTokens": MAX_OUTPUT_TOKENS,
                "topP": TOP_P,
                "topK": TOP_K,
            }
        })
    }

    /// Stream a reply, invoking `on_token(delta, is_complete)` for each
    /// delta and exactly once with `is_complete = true` at the end.
    /// Returns the full reply text.
    pub async fn stream_reply(
        &self,
        prompt: &str,
        mut on_token: impl FnMut(&str, bool) + Send,
    ) -> Result<String> {
        let send = self
            .client
            .post(&self.stream_url)
            .query(&[("key", self.api_key.as_str()), ("alt", "sse")])
            .json(&Self::request_body(prompt))
            .send();

        let response = tokio::time::timeout(INITIAL_RESPONSE_TIMEOUT, send)
            .await
            .map_err(|_| anyhow::anyhow!("LLM stream did not respond within 10s"))?
            .context("Failed to send streaming request to LLM provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LLM streaming API error ({}): {}", status, crate::truncate_safe(&body, 300));
        }

        let mut stream = response.bytes_stream();
        let mut full_reply = String::new();
        let mut line_buffer = String::new();
        let mut completed = false;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Failed to read stream chunk")?;
            line_buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Drain complete lines; the tail stays buffered for the next read.
            while let Some(pos) = line_buffer.find('\n') {
                let line = line_buffer[..pos].trim_end_matches('\r').to_string();
                line_buffer.drain(..=pos);
                if Self::handle_sse_line(&line, &mut full_reply, &mut completed, &mut on_token)
                {
                    break;
                }
            }
            if completed {
                break;
            }
        }

        if !completed {
            // Stream ended without a finish reason (or with a trailing
            // unterminated line). Process the tail, then close out.
            let tail = std::mem::take(&mut line_buffer);
            Self::handle_sse_line(tail.trim_end(), &mut full_reply, &mut completed, &mut on_token);
            if !completed {
                on_token("", true);
            }
        }

        debug!("LLM reply complete ({} chars)", full_reply.len());
        Ok(full_reply)
    }

    /// Process one SSE line. Returns true once the stream has finished.
    fn handle_sse_line(
        line: &str,
        full_reply: &mut String,
        completed: &mut bool,
        on_token: &mut impl FnMut(&str, bool),
    ) -> bool {
        let Some(data) = line.trim().strip_prefix("data:") else {
            return false;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return false;
        }

        // Frames split mid-line show up as malformed JSON; skip them.
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return false;
        };

        for delta in extract_deltas(&value) {
            full_reply.push_str(delta);
            on_token(delta, false);
        }

        if finish_reason(&value).is_some() {
            *completed = true;
            on_token("", true);
            return true;
        }
        false
    }

    /// Non-streaming completion against the plain endpoint.
    pub async fn complete(&self, prompt: &str) -> Result<String> {
        let url = self
            .api_url
            .as_deref()
            .context("LLM non-stream endpoint not configured")?;

        let response = self
            .client
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&Self::request_body(prompt))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("Failed to send request to LLM provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LLM API error ({}): {}", status, crate::truncate_safe(&body, 300));
        }

        let body: Value = response.json().await.context("Failed to parse LLM response")?;
        let text: String = extract_deltas(&body).concat();
        if text.is_empty() {
            warn!("LLM returned an empty candidate");
        }
        Ok(text)
    }
}

/// Text parts of the first candidate's content.
fn extract_deltas(value: &Value) -> Vec<&str> {
    value
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|cand| cand.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(|parts| parts.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect()
        })
        .unwrap_or_default()
}

fn finish_reason(value: &Value) -> Option<&str> {
    value
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|cand| cand.get("finishReason"))
        .and_then(|r| r.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str, finish: Option<&str>) -> String {
        let mut cand = json!({ "content": { "parts": [ { "text": text } ] } });
        if let Some(reason) = finish {
            cand["finishReason"] = json!(reason);
        }
        json!({ "candidates": [cand] }).to_string()
    }

    #[test]
    fn test_extract_deltas() {
        let value: Value = serde_json::from_str(&frame("Hello", None)).unwrap();
        assert_eq!(extract_deltas(&value), vec!["Hello"]);
        assert!(extract_deltas(&json!({})).is_empty());
    }

    #[test]
    fn test_finish_reason() {
        let value: Value = serde_json::from_str(&frame("", Some("STOP"))).unwrap();
        assert_eq!(finish_reason(&value), Some("STOP"));
        let value: Value = serde_json::from_str(&frame("hi", None)).unwrap();
        assert_eq!(finish_reason(&value), None);
    }

    #[test]
    fn test_handle_sse_line_accumulates() {
        let mut reply = String::new();
        let mut completed = false;
        let mut tokens: Vec<(String, bool)> = Vec::new();
        let mut cb = |t: &str, done: bool| tokens.push((t.to_string(), done));

        let line = format!("data: {}", frame("Hello", None));
        assert!(!LlmClient::handle_sse_line(&line, &mut reply, &mut completed, &mut cb));
        let line = format!("data: {}", frame(", world", Some("STOP")));
        assert!(LlmClient::handle_sse_line(&line, &mut reply, &mut completed, &mut cb));

        assert_eq!(reply, "Hello, world");
        assert!(completed);
        assert_eq!(tokens.last().unwrap(), &(String::new(), true));
        // One completion callback, after two delta callbacks.
        assert_eq!(tokens.len(), 3);
    }

    #[test]
    fn test_handle_sse_line_skips_noise() {
        let mut reply = String::new();
        let mut completed = false;
        let mut cb = |_: &str, _: bool| {};

        assert!(!LlmClient::handle_sse_line("", &mut reply, &mut completed, &mut cb));
        assert!(!LlmClient::handle_sse_line("data:", &mut reply, &mut completed, &mut cb));
        assert!(!LlmClient::handle_sse_line("data: [DONE]", &mut reply, &mut completed, &mut cb));
        assert!(!LlmClient::handle_sse_line(
            "data: {\"candidates\": [{\"content\"",
            &mut reply,
            &mut completed,
            &mut cb
        ));
        assert!(!LlmClient::handle_sse_line(": keepalive", &mut reply, &mut completed, &mut cb));
        assert!(reply.is_empty());
        assert!(!completed);
    }

    #[test]
    fn test_request_body_shape() {
        let body = LlmClient::request_body("hi");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 150);
        assert_eq!(body["generationConfig"]["topK"], 40);
    }
}
