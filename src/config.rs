//! Configuration management
//!
//! All configuration is read from the process environment at startup.
//! Provider keys are optional at load time; an operation that needs a
//! missing key fails at use time so a partially configured deployment can
//! still serve the endpoints it has credentials for.

use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_ws_path() -> String {
    "/voicebot/ws".to_string()
}

fn default_database_path() -> String {
    "voicebridge.db".to_string()
}

fn default_voice() -> String {
    "meera".to_string()
}

fn default_greeting() -> String {
    "Hello! How can I help you today?".to_string()
}

fn default_silence_threshold() -> i16 {
    100
}

fn default_min_voiced_ratio() -> f32 {
    0.05
}

fn default_idle_timeout_secs() -> u64 {
    300
}

/// Credentials for the telephony carrier's REST API (outbound calls).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CarrierConfig {
    pub api_key: Option<String>,
    pub api_token: Option<String>,
    pub account_sid: Option<String>,
    pub subdomain: Option<String>,
    pub caller_id: Option<String>,
}

impl CarrierConfig {
    /// Names of environment keys that are unset, in declaration order.
    pub fn missing_keys(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.api_key.is_none() {
            missing.push("CARRIER_API_KEY");
        }
        if self.api_token.is_none() {
            missing.push("CARRIER_API_TOKEN");
        }
        if self.account_sid.is_none() {
            missing.push("CARRIER_ACCOUNT_SID");
        }
        if self.subdomain.is_none() {
            missing.push("CARRIER_SUBDOMAIN");
        }
        if self.caller_id.is_none() {
            missing.push("CARRIER_CALLER_ID");
        }
        missing
    }
}

/// LLM provider endpoints (streaming + non-streaming).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub stream_url: Option<String>,
}

/// STT provider settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SttConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
}

/// TTS provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    /// Voice used when the caller does not supply one.
    #[serde(default = "default_voice")]
    pub default_voice: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self { api_key: None, url: None, default_voice: default_voice() }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Canonical carrier WebSocket path. The gateway registers exactly
    /// one media path.
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Public base URL advertised to the carrier for media callbacks.
    pub public_base_url: Option<String>,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_greeting")]
    pub greeting_text: String,
    #[serde(default)]
    pub carrier: CarrierConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    /// Absolute sample amplitude above which a sample counts as voiced.
    #[serde(default = "default_silence_threshold")]
    pub silence_amplitude_threshold: i16,
    /// Minimum voiced-sample ratio for a buffer to reach STT.
    #[serde(default = "default_min_voiced_ratio")]
    pub min_voiced_ratio: f32,
    /// Sessions with no inbound media for this long may be reaped.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_path: default_ws_path(),
            public_base_url: None,
            database_path: default_database_path(),
            greeting_text: default_greeting(),
            carrier: CarrierConfig::default(),
            llm: LlmConfig::default(),
            stt: SttConfig::default(),
            tts: TtsConfig::default(),
            silence_amplitude_threshold: default_silence_threshold(),
            min_voiced_ratio: default_min_voiced_ratio(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Settings {
    /// Load settings from environment variables.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Some(host) = env_var("HOST") {
            settings.host = host;
        }
        if let Some(port) = env_var("PORT").and_then(|p| p.parse().ok()) {
            settings.port = port;
        }
        if let Some(path) = env_var("WS_PATH") {
            settings.ws_path = normalize_path(&path);
        }
        settings.public_base_url = env_var("PUBLIC_BASE_URL");
        if let Some(db) = env_var("DATABASE_PATH") {
            settings.database_path = db;
        }
        if let Some(greeting) = env_var("GREETING_TEXT") {
            settings.greeting_text = crate::pipeline::clean_greeting(&greeting);
        }

        settings.carrier = CarrierConfig {
            api_key: env_var("CARRIER_API_KEY"),
            api_token: env_var("CARRIER_API_TOKEN"),
            account_sid: env_var("CARRIER_ACCOUNT_SID"),
            subdomain: env_var("CARRIER_SUBDOMAIN"),
            caller_id: env_var("CARRIER_CALLER_ID"),
        };
        settings.llm = LlmConfig {
            api_key: env_var("LLM_API_KEY"),
            api_url: env_var("LLM_API_URL"),
            stream_url: env_var("LLM_STREAM_URL"),
        };
        settings.stt = SttConfig {
            api_key: env_var("STT_API_KEY"),
            url: env_var("STT_URL"),
        };
        settings.tts = TtsConfig {
            api_key: env_var("TTS_API_KEY"),
            url: env_var("TTS_URL"),
            default_voice: env_var("TTS_DEFAULT_VOICE").unwrap_or_else(default_voice),
        };

        if let Some(threshold) = env_var("SILENCE_AMPLITUDE_THRESHOLD").and_then(|v| v.parse().ok()) {
            settings.silence_amplitude_threshold = threshold;
        }
        if let Some(ratio) = env_var("MIN_VOICED_RATIO").and_then(|v| v.parse().ok()) {
            settings.min_voiced_ratio = ratio;
        }
        if let Some(idle) = env_var("IDLE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            settings.idle_timeout_secs = idle;
        }

        settings
    }
}

/// Ensure a configured path starts with exactly one leading slash.
fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}
