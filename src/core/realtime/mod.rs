//! Real-time voice transport.
//!
//! One [`VoiceSession`] per customer conversation. Underneath it:
//!
//! - [`SessionTokenProvider`] mints short-lived, restaurant-scoped credentials
//! - [`MediaEndpoint`] owns the microphone track and the playback element
//! - [`PeerConnection`] negotiates WebRTC and owns the control channel
//! - [`ControlChannelProtocol`] turns wire JSON into [`ControlEvent`]s
//! - [`TurnCoordinator`] gates the microphone through the push-to-talk cycle
//!
//! Browser objects (peer connections, data channels, media devices, audio
//! elements) are reached through the traits in [`peer`] and [`media`], so the
//! whole stack runs against in-memory fakes in tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use waav_voice::core::realtime::{
//!     Collaborators, HttpSdpExchange, SessionTokenProvider, VoiceSession, VoiceSessionConfig,
//! };
//!
//! let collaborators = Collaborators {
//!     token_source: Arc::new(SessionTokenProvider::new(&api_base, timeout)?),
//!     sdp_exchange: Arc::new(HttpSdpExchange::default()),
//!     peer_factory: host.peer_factory(),
//!     media_devices: host.media_devices(),
//! };
//! let session = VoiceSession::configure(VoiceSessionConfig::new("rest-42", "kiosk-1"))
//!     .initialize(collaborators)?;
//! session.connect(&auth_token).await?;
//! ```

mod base;
pub mod media;
pub mod openai;
pub mod peer;
mod session;
mod token;
mod turn;

pub use base::{
    ConnectionState, ReconnectionConfig, TurnAction, TurnState, VoiceError, VoiceResult,
    VoiceSessionConfig,
};
pub use media::{
    AudioConstraints, AudioElement, LocalAudioTrack, LocalStream, MediaDeviceError, MediaDevices,
    MediaEndpoint, MediaHandler, RemoteStream,
};
pub use openai::{
    ClientEvent, ControlChannelProtocol, ControlEvent, HttpSdpExchange, OrderPayload,
    RealtimeModel, RealtimeVoice, SdpExchange, TranscriptRole,
};
pub use peer::{
    ControlChannel, DataChannel, DataChannelInit, DataChannelState, IceConnectionState,
    PeerConfig, PeerConnection, PeerEvent, PeerFactory, RtcConfiguration, RtcHandler, RtcPeer,
    SessionDescription, SignalingState,
};
pub use session::{
    Collaborators, PendingVoiceSession, ReconnectReason, SessionEvent, SessionSettings,
    VoiceSession,
};
pub use token::{
    MenuContextSource, SessionToken, SessionTokenProvider, TOKEN_ENDPOINT_PATH, TokenScope,
    TokenSource,
};
pub use turn::{STOP_DEBOUNCE, StopOutcome, TurnCoordinator, TurnEffects};
