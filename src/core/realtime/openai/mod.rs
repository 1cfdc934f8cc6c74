//! OpenAI Realtime API over WebRTC.
//!
//! Audio flows over the peer connection's media tracks; everything else
//! (session configuration, transcripts, function calls) is JSON on the
//! `oai-events` data channel.
//!
//! # Supported Models
//!
//! - `gpt-4o-realtime-preview-2024-12-17` (default)
//! - `gpt-4o-realtime-preview`
//! - `gpt-4o-mini-realtime-preview-2024-12-17`
//! - `gpt-4o-mini-realtime-preview`
//!
//! # Supported Voices
//!
//! alloy, ash, ballad, coral, echo, sage, shimmer, verse
//!
//! # Signaling
//!
//! The SDP offer is POSTed as `application/sdp` to
//! `https://api.openai.com/v1/realtime?model=<model>` with the ephemeral
//! session token as bearer credential; the response body is the answer SDP.

mod config;
mod messages;
mod protocol;
mod sdp;

pub use config::{
    CONNECT_TIMEOUT, CONTROL_CHANNEL_LABEL, DEFAULT_STUN_URL, DEFAULT_TRANSCRIPTION_MODEL,
    Modality, OPENAI_REALTIME_SDP_URL, RealtimeModel, RealtimeVoice, SESSION_TOKEN_TTL,
    sdp_exchange_url,
};
pub use messages::{
    ApiError, ClientEvent, ContentPart, ConversationItem, InputAudioTranscription, RateLimit,
    ResponseInfo, ServerEvent, SessionInfo, SessionUpdate, ToolDef, TurnDetection,
};
pub use protocol::{ControlChannelProtocol, ControlEvent, OrderPayload, TranscriptRole};
pub use sdp::{HttpSdpExchange, SdpExchange};
