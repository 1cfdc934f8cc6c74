//! Configuration module for the voice transport
//!
//! Process-level settings shared by every [`VoiceSession`](crate::core::realtime::VoiceSession):
//! token endpoint, realtime model, STUN server, timeouts and reconnection policy.
//! Sources, highest priority first: YAML file > environment variables
//! (`.env` is loaded by the binary) > defaults.
//!
//! Per-session settings (restaurant, user, flags) live in
//! [`VoiceSessionConfig`](crate::core::realtime::VoiceSessionConfig) instead.
//!
//! # Example
//! ```rust,no_run
//! use waav_voice::config::VoiceConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Environment variables only
//! let config = VoiceConfig::from_env()?;
//!
//! // YAML file with environment variables underneath
//! let config = VoiceConfig::from_file(&PathBuf::from("voice.yaml"))?;
//! println!("Token endpoint base: {}", config.api_base_url);
//! # Ok(())
//! # }
//! ```

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::core::realtime::openai::{
    CONNECT_TIMEOUT, DEFAULT_STUN_URL, DEFAULT_TRANSCRIPTION_MODEL, OPENAI_REALTIME_SDP_URL,
};
use crate::core::realtime::{
    Collaborators, HttpSdpExchange, MediaDevices, PeerConfig, PeerFactory, RealtimeModel,
    RealtimeVoice, ReconnectionConfig, SessionSettings, SessionTokenProvider, VoiceError,
    VoiceResult,
};

mod yaml;

pub use yaml::YamlConfig;

/// Default base URL of the order API that mints session tokens
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3001/api/v1";

/// Default timeout for the token request
pub const DEFAULT_TOKEN_TIMEOUT_MS: u64 = 10_000;

/// Voice transport configuration
#[derive(Clone)]
pub struct VoiceConfig {
    /// Base URL of the order API; tokens come from `{api_base_url}/realtime/session`
    pub api_base_url: String,
    /// Realtime SDP exchange endpoint (without the model query)
    pub sdp_url: String,
    pub model: RealtimeModel,
    pub voice: RealtimeVoice,
    pub transcription_model: String,
    /// Only STUN is used for ICE
    pub stun_url: String,
    pub connect_timeout_ms: u64,
    pub token_timeout_ms: u64,
    pub reconnection: ReconnectionConfig,
    /// Default system instructions; the restaurant menu is appended per session
    pub instructions: Option<String>,
    /// Long-lived application credential, used by the CLI to request tokens
    pub api_key: Option<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            sdp_url: OPENAI_REALTIME_SDP_URL.to_string(),
            model: RealtimeModel::default(),
            voice: RealtimeVoice::default(),
            transcription_model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            stun_url: DEFAULT_STUN_URL.to_string(),
            connect_timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
            token_timeout_ms: DEFAULT_TOKEN_TIMEOUT_MS,
            reconnection: ReconnectionConfig::default(),
            instructions: None,
            api_key: None,
        }
    }
}

/// Zeroize the application credential when the config is dropped.
impl Drop for VoiceConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.api_key {
            key.zeroize();
        }
    }
}

impl fmt::Debug for VoiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceConfig")
            .field("api_base_url", &self.api_base_url)
            .field("sdp_url", &self.sdp_url)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("transcription_model", &self.transcription_model)
            .field("stun_url", &self.stun_url)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("token_timeout_ms", &self.token_timeout_ms)
            .field("reconnection", &self.reconnection)
            .field("instructions", &self.instructions.is_some())
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl VoiceConfig {
    /// Load configuration from environment variables on top of defaults
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `VOICE_API_BASE_URL` | `api_base_url` |
    /// | `VOICE_SDP_URL` | `sdp_url` |
    /// | `VOICE_MODEL` | `model` |
    /// | `VOICE_NAME` | `voice` |
    /// | `VOICE_TRANSCRIPTION_MODEL` | `transcription_model` |
    /// | `VOICE_STUN_URL` | `stun_url` |
    /// | `VOICE_CONNECT_TIMEOUT_MS` | `connect_timeout_ms` |
    /// | `VOICE_TOKEN_TIMEOUT_MS` | `token_timeout_ms` |
    /// | `VOICE_AUTO_RECONNECT` | `reconnection.auto_reconnect` |
    /// | `VOICE_MAX_RECONNECT_ATTEMPTS` | `reconnection.max_attempts` |
    /// | `VOICE_INSTRUCTIONS` | `instructions` |
    /// | `VOICE_API_KEY` | `api_key` |
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = Self::load_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variables as the base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. Default values
    ///
    /// # Errors
    /// Returns an error if the YAML file cannot be read or parsed, an
    /// environment variable has an invalid format, or validation fails.
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml_config = YamlConfig::from_file(path)?;

        let mut config = Self::load_env()?;
        config.apply_yaml(yaml_config);

        config.validate()?;
        Ok(config)
    }

    fn load_env() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();

        if let Some(v) = env_string("VOICE_API_BASE_URL") {
            config.api_base_url = v;
        }
        if let Some(v) = env_string("VOICE_SDP_URL") {
            config.sdp_url = v;
        }
        if let Some(v) = env_string("VOICE_MODEL") {
            config.model = RealtimeModel::from_str_or_default(&v);
        }
        if let Some(v) = env_string("VOICE_NAME") {
            config.voice = RealtimeVoice::from_str_or_default(&v);
        }
        if let Some(v) = env_string("VOICE_TRANSCRIPTION_MODEL") {
            config.transcription_model = v;
        }
        if let Some(v) = env_string("VOICE_STUN_URL") {
            config.stun_url = v;
        }
        if let Some(v) = env_parse::<u64>("VOICE_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u64>("VOICE_TOKEN_TIMEOUT_MS")? {
            config.token_timeout_ms = v;
        }
        if let Some(v) = env_bool("VOICE_AUTO_RECONNECT")? {
            config.reconnection.auto_reconnect = v;
        }
        if let Some(v) = env_parse::<u32>("VOICE_MAX_RECONNECT_ATTEMPTS")? {
            config.reconnection.max_attempts = v;
        }
        config.instructions = env_string("VOICE_INSTRUCTIONS");
        config.api_key = env_string("VOICE_API_KEY");

        Ok(config)
    }

    fn apply_yaml(&mut self, yaml: YamlConfig) {
        if let Some(api) = yaml.api {
            if let Some(v) = api.base_url {
                self.api_base_url = v;
            }
            if let Some(v) = api.api_key {
                self.api_key = Some(v);
            }
            if let Some(v) = api.token_timeout_ms {
                self.token_timeout_ms = v;
            }
        }
        if let Some(realtime) = yaml.realtime {
            if let Some(v) = realtime.sdp_url {
                self.sdp_url = v;
            }
            if let Some(v) = realtime.model {
                self.model = RealtimeModel::from_str_or_default(&v);
            }
            if let Some(v) = realtime.voice {
                self.voice = RealtimeVoice::from_str_or_default(&v);
            }
            if let Some(v) = realtime.transcription_model {
                self.transcription_model = v;
            }
            if let Some(v) = realtime.instructions {
                self.instructions = Some(v);
            }
        }
        if let Some(transport) = yaml.transport {
            if let Some(v) = transport.stun_url {
                self.stun_url = v;
            }
            if let Some(v) = transport.connect_timeout_ms {
                self.connect_timeout_ms = v;
            }
        }
        if let Some(r) = yaml.reconnection {
            let policy = &mut self.reconnection;
            if let Some(v) = r.auto_reconnect {
                policy.auto_reconnect = v;
            }
            if let Some(v) = r.max_attempts {
                policy.max_attempts = v;
            }
            if let Some(v) = r.initial_delay_ms {
                policy.initial_delay_ms = v;
            }
            if let Some(v) = r.max_delay_ms {
                policy.max_delay_ms = v;
            }
            if let Some(v) = r.backoff_multiplier {
                policy.backoff_multiplier = v;
            }
            if let Some(v) = r.jitter {
                policy.jitter = v;
            }
        }
    }

    /// Check URLs, timeouts and the reconnection policy.
    pub fn validate(&self) -> VoiceResult<()> {
        for (name, value) in [("api_base_url", &self.api_base_url), ("sdp_url", &self.sdp_url)] {
            let parsed = url::Url::parse(value).map_err(|e| {
                VoiceError::InvalidConfiguration(format!("{name} '{value}' is not a valid URL: {e}"))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(VoiceError::InvalidConfiguration(format!(
                    "{name} must use http or https, got '{}'",
                    parsed.scheme()
                )));
            }
        }

        let stun = url::Url::parse(&self.stun_url).map_err(|e| {
            VoiceError::InvalidConfiguration(format!(
                "stun_url '{}' is not a valid URL: {e}",
                self.stun_url
            ))
        })?;
        if !matches!(stun.scheme(), "stun" | "stuns") {
            return Err(VoiceError::InvalidConfiguration(format!(
                "stun_url must use the stun: or stuns: scheme, got '{}'",
                stun.scheme()
            )));
        }

        if self.connect_timeout_ms == 0 {
            return Err(VoiceError::InvalidConfiguration(
                "connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.token_timeout_ms == 0 {
            return Err(VoiceError::InvalidConfiguration(
                "token_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.reconnection.backoff_multiplier < 1.0 {
            return Err(VoiceError::InvalidConfiguration(
                "reconnection.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.reconnection.initial_delay_ms > self.reconnection.max_delay_ms {
            return Err(VoiceError::InvalidConfiguration(
                "reconnection.initial_delay_ms exceeds max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_millis(self.token_timeout_ms)
    }

    /// Session-level settings derived from this configuration.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            peer: PeerConfig {
                stun_url: self.stun_url.clone(),
                connect_timeout: self.connect_timeout(),
                ..PeerConfig::default()
            },
            reconnection: self.reconnection.clone(),
            voice: self.voice,
            transcription_model: self.transcription_model.clone(),
            instructions: self.instructions.clone(),
            tools: Vec::new(),
        }
    }

    pub fn token_provider(&self) -> VoiceResult<SessionTokenProvider> {
        SessionTokenProvider::new(&self.api_base_url, self.token_timeout())
    }

    pub fn sdp_exchange(&self) -> HttpSdpExchange {
        HttpSdpExchange::new(&self.sdp_url, self.model)
    }

    /// HTTP collaborators from this configuration plus the host factories.
    pub fn collaborators(
        &self,
        peer_factory: Arc<dyn PeerFactory>,
        media_devices: Arc<dyn MediaDevices>,
    ) -> VoiceResult<Collaborators> {
        Ok(Collaborators {
            token_source: Arc::new(self.token_provider()?),
            sdp_exchange: Arc::new(self.sdp_exchange()),
            peer_factory,
            media_devices,
        })
    }

    /// Effective configuration with secrets replaced, for display.
    pub fn redacted(&self) -> serde_json::Value {
        json!({
            "api_base_url": self.api_base_url,
            "sdp_url": self.sdp_url,
            "model": self.model.as_str(),
            "voice": self.voice.as_str(),
            "transcription_model": self.transcription_model,
            "stun_url": self.stun_url,
            "connect_timeout_ms": self.connect_timeout_ms,
            "token_timeout_ms": self.token_timeout_ms,
            "reconnection": self.reconnection,
            "instructions": self.instructions,
            "api_key": self.api_key.as_ref().map(|_| "[REDACTED]"),
        })
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env_string(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid value for {name}: '{raw}' ({e})").into()),
        None => Ok(None),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>, Box<dyn std::error::Error>> {
    match env_string(name) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(format!("Invalid boolean for {name}: '{raw}'").into()),
        },
        None => Ok(None),
    }
}
