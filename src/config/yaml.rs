use serde::Deserialize;
use std::path::PathBuf;

/// Complete YAML configuration structure
///
/// Every field is optional so a file can override only what it needs;
/// anything left out falls back to environment variables, then defaults.
///
/// # Example YAML structure
/// ```yaml
/// api:
///   base_url: "https://orders.example.com/api/v1"
///   api_key: "app-credential"
///   token_timeout_ms: 10000
///
/// realtime:
///   sdp_url: "https://api.openai.com/v1/realtime"
///   model: "gpt-4o-realtime-preview-2024-12-17"
///   voice: "alloy"
///   transcription_model: "whisper-1"
///   instructions: "You are taking a food order at the counter."
///
/// transport:
///   stun_url: "stun:stun.l.google.com:19302"
///   connect_timeout_ms: 15000
///
/// reconnection:
///   auto_reconnect: true
///   max_attempts: 5
///   initial_delay_ms: 500
///   max_delay_ms: 10000
///   backoff_multiplier: 2.0
///   jitter: false
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub api: Option<ApiYaml>,
    pub realtime: Option<RealtimeYaml>,
    pub transport: Option<TransportYaml>,
    pub reconnection: Option<ReconnectionYaml>,
}

/// Token service settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ApiYaml {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub token_timeout_ms: Option<u64>,
}

/// Realtime model settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RealtimeYaml {
    pub sdp_url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub transcription_model: Option<String>,
    pub instructions: Option<String>,
}

/// WebRTC transport settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TransportYaml {
    pub stun_url: Option<String>,
    pub connect_timeout_ms: Option<u64>,
}

/// Reconnection policy overrides from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReconnectionYaml {
    pub auto_reconnect: Option<bool>,
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f32>,
    pub jitter: Option<bool>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file cannot be read
    /// - The YAML is malformed
    /// - Fields have invalid types
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}
