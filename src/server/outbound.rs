//! Outbound-call trigger
//!
//! POST /calls asks the carrier's REST API to place a call and point
//! its media stream at this gateway. Missing configuration is reported
//! as a 400 enumerating every absent key; nothing is retried.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct OutboundCallRequest {
    pub to: String,
    #[serde(default)]
    pub from: Option<String>,
}

pub async fn trigger_call(
    State(state): State<AppState>,
    Json(request): Json<OutboundCallRequest>,
) -> Response {
    let settings = &state.deps.settings;

    let mut missing = settings.carrier.missing_keys();
    if settings.public_base_url.is_none() {
        missing.push("PUBLIC_BASE_URL");
    }
    if !missing.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": "missing required configuration",
                "missing": missing,
            })),
        )
            .into_response();
    }

    if !request.to.starts_with('+') {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": "\"to\" must be an E.164 number starting with +",
            })),
        )
            .into_response();
    }

    let carrier = &settings.carrier;
    let api_key = carrier.api_key.as_deref().unwrap_or_default();
    let api_token = carrier.api_token.as_deref().unwrap_or_default();
    let account_sid = carrier.account_sid.as_deref().unwrap_or_default();
    let subdomain = carrier.subdomain.as_deref().unwrap_or_default();
    let caller_id = carrier.caller_id.as_deref().unwrap_or_default();
    let from = request.from.as_deref().unwrap_or(caller_id);

    let stream_url = media_stream_url(
        settings.public_base_url.as_deref().unwrap_or_default(),
        &settings.ws_path,
    );
    let url = format!("https://{}/v1/Accounts/{}/Calls/connect", subdomain, account_sid);

    info!("Placing outbound call to {} via {}", request.to, subdomain);

    let response = state
        .http
        .post(&url)
        .basic_auth(api_key, Some(api_token))
        .form(&[
            ("To", request.to.as_str()),
            ("From", from),
            ("CallerId", caller_id),
            ("Url", stream_url.as_str()),
        ])
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            warn!("Carrier API unreachable: {}", e);
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "success": false, "error": "carrier API unreachable" })),
            )
                .into_response();
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!("Carrier API error ({}): {}", status, crate::truncate_safe(&body, 300));
        return (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "success": false, "error": format!("carrier API error ({})", status) })),
        )
            .into_response();
    }

    let body: serde_json::Value = response.json().await.unwrap_or_default();
    let call_sid = extract_call_sid(&body);

    Json(json!({ "success": true, "callSid": call_sid })).into_response()
}

/// The wss:// media URL advertised to the carrier.
fn media_stream_url(public_base_url: &str, ws_path: &str) -> String {
    let base = public_base_url.trim_end_matches('/');
    let base = base
        .strip_prefix("https://")
        .or_else(|| base.strip_prefix("http://"))
        .unwrap_or(base);
    format!("wss://{}{}", base, ws_path)
}

fn extract_call_sid(body: &serde_json::Value) -> Option<&str> {
    body.get("Call")
        .and_then(|c| c.get("Sid"))
        .or_else(|| body.get("callSid"))
        .or_else(|| body.get("sid"))
        .and_then(|s| s.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_stream_url() {
        assert_eq!(
            media_stream_url("https://bot.example.com", "/voicebot/ws"),
            "wss://bot.example.com/voicebot/ws"
        );
        assert_eq!(
            media_stream_url("bot.example.com/", "/voicebot/ws"),
            "wss://bot.example.com/voicebot/ws"
        );
    }

    #[test]
    fn test_extract_call_sid_variants() {
        let nested = json!({ "Call": { "Sid": "CA123" } });
        assert_eq!(extract_call_sid(&nested), Some("CA123"));
        let flat = json!({ "callSid": "CA456" });
        assert_eq!(extract_call_sid(&flat), Some("CA456"));
        assert_eq!(extract_call_sid(&json!({})), None);
    }
}
