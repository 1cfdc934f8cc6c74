//! Base types shared by every component of the voice transport core.
//!
//! This module defines the error taxonomy, the connection and turn state
//! enums, the per-session configuration and the reconnection policy.
//!
//! # States
//!
//! - [`ConnectionState`] is owned by the `VoiceSession` and is the single
//!   source of truth for consumer-facing connectivity.
//! - [`TurnState`] is owned by the `TurnCoordinator`; nothing else mutates it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur in the voice transport core.
///
/// The type is `Clone` so that a single settled connection attempt can be
/// reported to every caller that awaited it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VoiceError {
    /// Bad or expired application credential (HTTP 401/403). Not retried.
    #[error("Authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },

    /// Transport failure. Eligible for the reconnect policy.
    #[error("Network error: {0}")]
    Network(String),

    /// Non-2xx response from the token or SDP endpoint.
    ///
    /// The message always carries the numeric status.
    #[error("{message}")]
    Service { status: u16, message: String },

    /// The caller tore the connection down while negotiation was in flight.
    #[error("Peer connection closed during SDP exchange")]
    PeerClosedDuringExchange,

    /// Malformed message on the control channel.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Microphone denied or missing.
    #[error("Microphone unavailable: {0}")]
    Permission(String),

    /// A turn-taking operation was requested from a state that does not allow it.
    #[error("Invalid turn transition: cannot {action} while {from}")]
    InvalidTurnTransition { from: TurnState, action: TurnAction },

    /// The Realtime API reported a rate limit.
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// The Realtime API session expired and needs a fresh token.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Terminal reconnect failure.
    #[error("Max reconnection attempts reached ({0})")]
    MaxReconnectAttempts(u32),

    /// The connect sequence did not finish in time.
    #[error("Connection timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Operation requires an open connection.
    #[error("Not connected")]
    NotConnected,

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Error event reported by the realtime service over the control channel.
    #[error("Realtime API error: {message}")]
    Realtime {
        code: Option<String>,
        message: String,
    },
}

impl VoiceError {
    /// Whether the reconnect policy may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VoiceError::Network(_)
                | VoiceError::Service { .. }
                | VoiceError::Timeout(_)
                | VoiceError::SessionExpired(_)
        )
    }

    /// Errors that are expected side effects of a caller-initiated teardown
    /// and must not be surfaced as user-facing failures.
    pub fn is_benign(&self) -> bool {
        matches!(self, VoiceError::PeerClosedDuringExchange)
    }

    /// HTTP status attached to the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            VoiceError::Auth { status, .. } | VoiceError::Service { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type for voice transport operations.
pub type VoiceResult<T> = Result<T, VoiceError>;

// =============================================================================
// Connection State
// =============================================================================

/// Consumer-facing connection state of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No live connection
    #[default]
    Disconnected,
    /// Token fetch or negotiation in progress
    Connecting,
    /// Data channel open
    Connected,
    /// Waiting to re-establish after a connection loss
    Reconnecting,
    /// The last attempt failed; always followed by `Disconnected`
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

// =============================================================================
// Turn State
// =============================================================================

/// Turn-taking state tracked by the `TurnCoordinator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// Microphone muted, nothing pending
    #[default]
    Idle,
    /// Microphone live
    Recording,
    /// Audio buffer being committed
    Committing,
    /// Waiting for the final transcript of the committed audio
    WaitingUserFinal,
    /// Waiting for the assistant response to finish
    WaitingResponse,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnState::Idle => write!(f, "idle"),
            TurnState::Recording => write!(f, "recording"),
            TurnState::Committing => write!(f, "committing"),
            TurnState::WaitingUserFinal => write!(f, "waiting_user_final"),
            TurnState::WaitingResponse => write!(f, "waiting_response"),
        }
    }
}

/// Inputs that drive the turn state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnAction {
    StartRecording,
    StopRecording,
    TranscriptCompleted,
    ResponseCompleted,
}

impl fmt::Display for TurnAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnAction::StartRecording => write!(f, "start recording"),
            TurnAction::StopRecording => write!(f, "stop recording"),
            TurnAction::TranscriptCompleted => write!(f, "complete transcript"),
            TurnAction::ResponseCompleted => write!(f, "complete response"),
        }
    }
}

// =============================================================================
// Configuration Types
// =============================================================================

/// Per-session configuration, fixed for the lifetime of a `VoiceSession`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceSessionConfig {
    /// Restaurant whose menu scopes the session token
    pub restaurant_id: String,
    /// Client identifier the token is scoped to
    pub user_id: String,
    /// Log every control message at debug level
    #[serde(default)]
    pub debug: bool,
    /// Let the server detect end of speech instead of push-to-talk
    #[serde(default)]
    pub enable_vad: bool,
    /// Force the playback element to muted / zero volume
    #[serde(default)]
    pub mute_audio_output: bool,
}

impl VoiceSessionConfig {
    /// Create a config for a restaurant and user with all flags off.
    pub fn new(restaurant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            restaurant_id: restaurant_id.into(),
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// Reject configurations that cannot scope a session token.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.restaurant_id.trim().is_empty() {
            return Err(VoiceError::InvalidConfiguration(
                "restaurant_id is required".to_string(),
            ));
        }
        if self.user_id.trim().is_empty() {
            return Err(VoiceError::InvalidConfiguration(
                "user_id is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reconnection policy applied by the `VoiceSession`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    /// Reconnect automatically instead of only emitting `reconnect.needed`.
    /// Default: false
    pub auto_reconnect: bool,

    /// Maximum number of reconnection attempts before the terminal error.
    /// Set to 0 for unlimited attempts.
    /// Default: 3
    pub max_attempts: u32,

    /// Initial delay between reconnection attempts (milliseconds).
    /// Default: 1000ms
    pub initial_delay_ms: u64,

    /// Maximum delay between reconnection attempts (milliseconds).
    /// Default: 30000ms
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff.
    /// Default: 2.0
    pub backoff_multiplier: f32,

    /// Add up to 25% jitter to the delay.
    /// Default: true
    pub jitter: bool,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: false,
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectionConfig {
    /// Calculate the delay for a given attempt number using exponential backoff.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay_ms as f64;
        let multiplier = self.backoff_multiplier as f64;

        // base_delay * multiplier^(attempt-1)
        let delay = base_delay * multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = delay.min(self.max_delay_ms as f64);

        let millis = if self.jitter {
            let jitter = rand_jitter(delay * 0.25);
            (delay + jitter).max(0.0) as u64
        } else {
            delay as u64
        };
        Duration::from_millis(millis)
    }

    /// Whether attempt number `attempt` (1-based) is still within budget.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }
}

/// Pseudo-random jitter in `[-range, range]` from a time-seeded LCG.
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = ((seed.wrapping_mul(1103515245).wrapping_add(12345)) % (1 << 31)) as f64;
    let normalized = random / (1u64 << 31) as f64;
    (normalized - 0.5) * 2.0 * range
}
