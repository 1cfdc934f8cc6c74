pub mod realtime;

// Re-export commonly used types for convenience
pub use realtime::{
    Collaborators, ConnectionState, ControlEvent, OrderPayload, SessionEvent, SessionSettings,
    SessionToken, SessionTokenProvider, TurnState, VoiceError, VoiceResult, VoiceSession,
    VoiceSessionConfig,
};
