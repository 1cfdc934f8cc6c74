//! Voice session orchestrator.
//!
//! [`VoiceSession`] is the single consumer-facing object. It fetches a session
//! token, drives the [`PeerConnection`], feeds control channel traffic through
//! the [`ControlChannelProtocol`] and the [`TurnCoordinator`], and republishes
//! everything as [`SessionEvent`]s on a broadcast channel.
//!
//! Construction is two-phase: [`VoiceSession::configure`] fixes the
//! per-session config, [`PendingVoiceSession::initialize`] supplies the
//! collaborators (token source, SDP exchange and host factories).
//!
//! # Example
//!
//! ```rust,ignore
//! let session = VoiceSession::configure(VoiceSessionConfig::new("rest-42", "kiosk-1"))
//!     .initialize(collaborators)?;
//! let mut events = session.subscribe();
//!
//! session.connect(&auth_token).await?;
//! session.start_recording()?;
//! // ... user speaks ...
//! session.stop_recording()?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let SessionEvent::OrderDetected(order) = event {
//!         println!("{} {}", order.name, order.arguments);
//!     }
//! }
//! ```

use std::fmt;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use super::base::{
    ConnectionState, ReconnectionConfig, TurnState, VoiceError, VoiceResult, VoiceSessionConfig,
};
use super::media::{MediaDevices, MediaEndpoint, RemoteStream};
use super::openai::{
    ClientEvent, ControlChannelProtocol, ControlEvent, ConversationItem,
    DEFAULT_TRANSCRIPTION_MODEL, InputAudioTranscription, Modality, OrderPayload, RealtimeVoice,
    SdpExchange, SessionUpdate, ToolDef, TranscriptRole, TurnDetection,
};
use super::peer::{ControlChannel, PeerConfig, PeerConnection, PeerEvent, PeerFactory};
use super::token::{TokenScope, TokenSource};
use super::turn::{StopOutcome, TurnCoordinator, TurnEffects};

const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Events
// =============================================================================

/// Why a reconnect is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    Disconnection,
    Timeout,
    SessionExpired,
}

impl fmt::Display for ReconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectReason::Disconnection => write!(f, "disconnection"),
            ReconnectReason::Timeout => write!(f, "timeout"),
            ReconnectReason::SessionExpired => write!(f, "session_expired"),
        }
    }
}

/// Events published to session subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionChange(ConnectionState),
    TurnChanged(TurnState),
    Transcript {
        role: TranscriptRole,
        item_id: String,
        text: String,
        is_final: bool,
    },
    OrderDetected(OrderPayload),
    Error(VoiceError),
    ReconnectNeeded {
        attempt: u32,
        delay: Duration,
        reason: ReconnectReason,
    },
    /// The connection dropped without a caller asking for it.
    Disconnection,
    DataChannelReady(ControlChannel),
    TrackReceived(RemoteStream),
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::ConnectionChange(_) => "connection.change",
            SessionEvent::TurnChanged(_) => "turn.change",
            SessionEvent::Transcript { .. } => "transcript",
            SessionEvent::OrderDetected(_) => "order.detected",
            SessionEvent::Error(_) => "error",
            SessionEvent::ReconnectNeeded { .. } => "reconnect.needed",
            SessionEvent::Disconnection => "disconnection",
            SessionEvent::DataChannelReady(_) => "dataChannelReady",
            SessionEvent::TrackReceived(_) => "track.received",
        }
    }
}

// =============================================================================
// Settings & Collaborators
// =============================================================================

/// Transport and model settings shared by every session built from one config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub peer: PeerConfig,
    pub reconnection: ReconnectionConfig,
    pub voice: RealtimeVoice,
    pub transcription_model: String,
    /// Base system instructions; the token's menu context is appended.
    pub instructions: Option<String>,
    pub tools: Vec<ToolDef>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            peer: PeerConfig::default(),
            reconnection: ReconnectionConfig::default(),
            voice: RealtimeVoice::default(),
            transcription_model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            instructions: None,
            tools: Vec::new(),
        }
    }
}

/// External services and host factories a session depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub token_source: Arc<dyn TokenSource>,
    pub sdp_exchange: Arc<dyn SdpExchange>,
    pub peer_factory: Arc<dyn PeerFactory>,
    pub media_devices: Arc<dyn MediaDevices>,
}

/// A configured session that has not been given its collaborators yet.
#[derive(Debug, Clone)]
pub struct PendingVoiceSession {
    config: VoiceSessionConfig,
    settings: SessionSettings,
}

impl PendingVoiceSession {
    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn config(&self) -> &VoiceSessionConfig {
        &self.config
    }

    /// Wire the collaborators and start the event pump.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn initialize(self, collaborators: Collaborators) -> VoiceResult<VoiceSession> {
        self.config.validate()?;

        let media = Arc::new(MediaEndpoint::new(
            collaborators.media_devices,
            self.config.mute_audio_output,
        ));
        let (peer, peer_events) = PeerConnection::new(
            self.settings.peer.clone(),
            collaborators.peer_factory,
            collaborators.sdp_exchange,
            media,
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            session_id = %id,
            restaurant_id = %self.config.restaurant_id,
            vad = self.config.enable_vad,
            "Voice session initialized"
        );

        let shared = Arc::new(SessionShared {
            id,
            protocol: Mutex::new(ControlChannelProtocol::new().with_verbose_logging(self.config.debug)),
            turn: Mutex::new(TurnCoordinator::new(!self.config.enable_vad)),
            config: self.config,
            settings: self.settings,
            token_source: collaborators.token_source,
            peer,
            state: Mutex::new(ConnectionState::Disconnected),
            events,
            reconnect_attempts: AtomicU32::new(0),
            connect_generation: AtomicU64::new(0),
            pending_connect: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            last_auth_token: Mutex::new(None),
        });

        let pump = tokio::spawn(pump_peer_events(Arc::downgrade(&shared), peer_events));
        Ok(VoiceSession { shared, pump })
    }
}

// =============================================================================
// Voice Session
// =============================================================================

type ConnectAttempt = Shared<BoxFuture<'static, VoiceResult<()>>>;

struct SessionShared {
    id: String,
    config: VoiceSessionConfig,
    settings: SessionSettings,
    token_source: Arc<dyn TokenSource>,
    peer: PeerConnection,
    protocol: Mutex<ControlChannelProtocol>,
    turn: Mutex<TurnCoordinator>,
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    reconnect_attempts: AtomicU32,
    /// Bumped by `disconnect` so in-flight connects know they were cancelled
    connect_generation: AtomicU64,
    pending_connect: Mutex<Option<(u64, ConnectAttempt)>>,
    /// Cancelled and replaced by `disconnect`; stops in-flight connects and scheduled reconnects
    cancel: Mutex<CancellationToken>,
    /// Kept for automatic reconnects
    last_auth_token: Mutex<Option<Zeroizing<String>>>,
}

/// One customer's voice ordering session.
pub struct VoiceSession {
    shared: Arc<SessionShared>,
    pump: JoinHandle<()>,
}

impl fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceSession")
            .field("id", &self.shared.id)
            .field("restaurant_id", &self.shared.config.restaurant_id)
            .field("connection_state", &self.connection_state())
            .field("turn_state", &self.turn_state())
            .finish()
    }
}

impl VoiceSession {
    /// First construction phase.
    pub fn configure(config: VoiceSessionConfig) -> PendingVoiceSession {
        PendingVoiceSession {
            config,
            settings: SessionSettings::default(),
        }
    }

    /// Both construction phases at once.
    pub fn new(
        config: VoiceSessionConfig,
        settings: SessionSettings,
        collaborators: Collaborators,
    ) -> VoiceResult<Self> {
        Self::configure(config)
            .with_settings(settings)
            .initialize(collaborators)
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn config(&self) -> &VoiceSessionConfig {
        &self.shared.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Fetch a fresh token and connect. Overlapping calls share one attempt.
    pub async fn connect(&self, auth_token: &str) -> VoiceResult<()> {
        self.shared.connect(auth_token.to_string()).await
    }

    /// Tear everything down and cancel any in-flight or scheduled connect.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    pub fn start_recording(&self) -> VoiceResult<()> {
        // Read under the turn lock so a concurrent disconnection cannot be missed
        self.shared
            .with_turn(|turn, fx| turn.start_recording(self.shared.connection_state(), fx))
            .map(|_| ())
    }

    pub fn stop_recording(&self) -> VoiceResult<StopOutcome> {
        self.shared
            .with_turn(|turn, fx| turn.stop_recording(Instant::now(), fx))
    }

    /// Return a function call result to the model and request a follow-up response.
    pub fn submit_function_result(&self, call_id: &str, output: &str) -> VoiceResult<()> {
        tracing::debug!(call_id, "Submitting function result");
        self.shared.peer.send(&ClientEvent::ConversationItemCreate {
            item: ConversationItem::function_output(call_id, output),
        })?;
        self.shared.peer.send(&ClientEvent::ResponseCreate)
    }

    /// Send a typed user message instead of speech.
    pub fn send_text(&self, text: &str) -> VoiceResult<()> {
        self.shared.peer.send(&ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text(text),
        })?;
        self.shared.peer.send(&ClientEvent::ResponseCreate)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection_state()
    }

    pub fn turn_state(&self) -> TurnState {
        self.shared.turn.lock().state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn peer(&self) -> &PeerConnection {
        &self.shared.peer
    }

    pub fn media(&self) -> &Arc<MediaEndpoint> {
        self.shared.peer.media()
    }

    /// Disconnect and stop delivering events.
    pub fn dispose(self) {
        tracing::debug!(session_id = %self.shared.id, "Disposing voice session");
        drop(self);
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.shared.disconnect();
        self.pump.abort();
    }
}

struct TransportEffects<'a> {
    peer: &'a PeerConnection,
}

impl TurnEffects for TransportEffects<'_> {
    fn set_microphone(&self, enabled: bool) {
        if enabled {
            self.peer.media().enable_microphone();
        } else {
            self.peer.media().disable_microphone();
        }
    }

    fn send(&self, event: ClientEvent) -> VoiceResult<()> {
        self.peer.send(&event)
    }
}

async fn pump_peer_events(
    session: Weak<SessionShared>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = session.upgrade() else {
            break;
        };
        shared.handle_peer_event(event);
    }
}

impl SessionShared {
    fn emit(&self, event: SessionEvent) {
        if self.config.debug {
            tracing::debug!(session_id = %self.id, event = event.name(), "Session event");
        } else {
            tracing::trace!(session_id = %self.id, event = event.name(), "Session event");
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, next)
        };
        if previous != next {
            tracing::info!(session_id = %self.id, from = %previous, to = %next, "Connection state changed");
            self.emit(SessionEvent::ConnectionChange(next));
        }
    }

    fn with_turn<R>(
        &self,
        f: impl FnOnce(&mut TurnCoordinator, &dyn TurnEffects) -> VoiceResult<R>,
    ) -> VoiceResult<R> {
        let effects = TransportEffects { peer: &self.peer };
        let (result, before, after) = {
            let mut turn = self.turn.lock();
            let before = turn.state();
            let result = f(&mut *turn, &effects as &dyn TurnEffects);
            (result, before, turn.state())
        };
        if before != after {
            tracing::debug!(from = %before, to = %after, "Turn state changed");
            self.emit(SessionEvent::TurnChanged(after));
        }
        result
    }

    fn reset_turn(&self) {
        let _ = self.with_turn(|turn, fx| {
            turn.reset(fx);
            Ok(())
        });
    }

    async fn connect(self: &Arc<Self>, auth_token: String) -> VoiceResult<()> {
        let attempt = {
            let mut pending = self.pending_connect.lock();
            match pending.as_ref() {
                Some((_, attempt)) => {
                    tracing::debug!("Joining in-flight connect");
                    attempt.clone()
                }
                None => {
                    if self.connection_state() == ConnectionState::Connected {
                        return Ok(());
                    }
                    let generation = self.connect_generation.load(Ordering::SeqCst);
                    let cancel = self.cancel.lock().clone();
                    *self.last_auth_token.lock() = Some(Zeroizing::new(auth_token.clone()));
                    let attempt = Arc::clone(self)
                        .run_connect(generation, auth_token, cancel)
                        .boxed()
                        .shared();
                    *pending = Some((generation, attempt.clone()));
                    attempt
                }
            }
        };

        tokio::spawn(attempt.clone());
        attempt.await
    }

    fn is_current(&self, generation: u64) -> bool {
        self.connect_generation.load(Ordering::SeqCst) == generation
    }

    async fn run_connect(
        self: Arc<Self>,
        generation: u64,
        auth_token: String,
        cancel: CancellationToken,
    ) -> VoiceResult<()> {
        let auth_token = Zeroizing::new(auth_token);
        self.protocol.lock().reset();
        self.set_state(ConnectionState::Connecting);

        // One deadline covers the token fetch and the peer negotiation
        let deadline = self.settings.peer.connect_timeout;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(VoiceError::PeerClosedDuringExchange),
            outcome = tokio::time::timeout(deadline, self.establish(generation, &auth_token)) => {
                outcome.unwrap_or_else(|_| {
                    tracing::error!(
                        session_id = %self.id,
                        timeout_ms = deadline.as_millis() as u64,
                        "Connect timed out"
                    );
                    Err(VoiceError::Timeout(deadline))
                })
            }
        };

        {
            let mut pending = self.pending_connect.lock();
            if pending
                .as_ref()
                .is_some_and(|(pending, _)| *pending == generation)
            {
                *pending = None;
            }
        }

        let current = self.is_current(generation);
        match result {
            Ok(menu_context) if current => {
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.set_state(ConnectionState::Connected);
                if let Err(e) = self
                    .peer
                    .send(&ClientEvent::SessionUpdate {
                        session: self.session_update(menu_context),
                    })
                {
                    tracing::warn!(error = %e, "Failed to send session configuration");
                }
                Ok(())
            }
            Ok(_) => Err(VoiceError::PeerClosedDuringExchange),
            Err(err) if err.is_benign() || !current => {
                tracing::debug!(error = %err, "Connect cancelled");
                Err(err)
            }
            Err(err) => {
                tracing::error!(session_id = %self.id, error = %err, "Connect failed");
                self.peer.disconnect();
                self.reset_turn();
                self.set_state(ConnectionState::Error);
                self.emit(SessionEvent::Error(err.clone()));
                self.set_state(ConnectionState::Disconnected);
                if matches!(err, VoiceError::Timeout(_)) {
                    self.apply_reconnect_policy(ReconnectReason::Timeout);
                }
                Err(err)
            }
        }
    }

    /// Token fetch plus peer negotiation; yields the menu context for `session.update`.
    async fn establish(&self, generation: u64, auth_token: &str) -> VoiceResult<Option<String>> {
        let scope = TokenScope {
            restaurant_id: self.config.restaurant_id.clone(),
            client_id: self.config.user_id.clone(),
        };
        let token = self.token_source.fetch_token(auth_token, &scope).await?;
        if !self.is_current(generation) {
            return Err(VoiceError::PeerClosedDuringExchange);
        }
        let menu_context = token.menu_context().map(str::to_owned);
        self.peer.connect(token).await?;
        Ok(menu_context)
    }

    fn session_update(&self, menu_context: Option<String>) -> SessionUpdate {
        let instructions = match (self.settings.instructions.as_deref(), menu_context) {
            (Some(base), Some(menu)) => Some(format!("{base}\n\nMenu:\n{menu}")),
            (Some(base), None) => Some(base.to_string()),
            (None, Some(menu)) => Some(format!("Menu:\n{menu}")),
            (None, None) => None,
        };
        let turn_detection = if self.config.enable_vad {
            TurnDetection::server_vad()
        } else {
            TurnDetection::None {}
        };
        let has_tools = !self.settings.tools.is_empty();

        SessionUpdate {
            modalities: Some(vec![
                Modality::Text.as_str().to_string(),
                Modality::Audio.as_str().to_string(),
            ]),
            instructions,
            voice: Some(self.settings.voice.as_str().to_string()),
            input_audio_transcription: Some(InputAudioTranscription {
                model: self.settings.transcription_model.clone(),
            }),
            turn_detection: Some(turn_detection),
            tools: has_tools.then(|| self.settings.tools.clone()),
            tool_choice: has_tools.then(|| "auto".to_string()),
        }
    }

    fn disconnect(&self) {
        self.connect_generation.fetch_add(1, Ordering::SeqCst);
        *self.pending_connect.lock() = None;
        let cancel = std::mem::replace(&mut *self.cancel.lock(), CancellationToken::new());
        cancel.cancel();
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        *self.last_auth_token.lock() = None;

        self.peer.disconnect();
        self.reset_turn();
        self.protocol.lock().reset();
        self.set_state(ConnectionState::Disconnected);
    }

    fn handle_peer_event(self: &Arc<Self>, event: PeerEvent) {
        let state = self.connection_state();
        match event {
            PeerEvent::DataChannelReady(channel) => {
                if matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
                    self.emit(SessionEvent::DataChannelReady(channel));
                }
            }
            PeerEvent::Message(raw) => {
                // The server speaks as soon as the channel opens, before connect() settles
                if !matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
                    tracing::trace!("Dropping control message received outside a live connection");
                    return;
                }
                let decoded = self.protocol.lock().decode(&raw);
                match decoded {
                    Ok(Some(event)) => self.handle_control_event(event),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "Discarding undecodable control message"),
                }
            }
            PeerEvent::TrackReceived(stream) => {
                if matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
                    self.emit(SessionEvent::TrackReceived(stream));
                }
            }
            PeerEvent::Disconnection => {
                tracing::warn!(session_id = %self.id, "Connection lost");
                self.set_state(ConnectionState::Disconnected);
                self.reset_turn();
                self.protocol.lock().reset();
                self.emit(SessionEvent::Disconnection);
                self.apply_reconnect_policy(ReconnectReason::Disconnection);
            }
            PeerEvent::ConnectionTimeout => {
                // The failed connect() applies the reconnect policy
                tracing::debug!("Peer negotiation timed out");
            }
            PeerEvent::Error(e) => {
                // Surfaced by the connect() that failed
                tracing::debug!(error = %e, "Peer reported error");
            }
        }
    }

    fn handle_control_event(self: &Arc<Self>, event: ControlEvent) {
        match event {
            ControlEvent::TranscriptDelta {
                role,
                item_id,
                text,
            } => self.emit(SessionEvent::Transcript {
                role,
                item_id,
                text,
                is_final: false,
            }),
            ControlEvent::TranscriptCompleted {
                role,
                item_id,
                text,
            } => {
                self.emit(SessionEvent::Transcript {
                    role,
                    item_id,
                    text,
                    is_final: true,
                });
                if role == TranscriptRole::User
                    && let Err(e) = self.with_turn(|turn, _| turn.on_transcript_completed())
                {
                    tracing::trace!(error = %e, "User transcript outside a committed turn");
                }
            }
            ControlEvent::OrderDetected(order) => {
                tracing::info!(call_id = %order.call_id, name = %order.name, "Order detected");
                self.emit(SessionEvent::OrderDetected(order));
            }
            ControlEvent::ResponseCompleted { response_id } => {
                if let Err(e) = self.with_turn(|turn, _| turn.on_response_completed()) {
                    tracing::trace!(%response_id, error = %e, "Response outside a committed turn");
                }
            }
            ControlEvent::RateLimitExceeded {
                message,
                retry_after_ms,
            } => {
                tracing::warn!(%message, ?retry_after_ms, "Rate limit exceeded");
                self.emit(SessionEvent::Error(VoiceError::RateLimited(message)));
            }
            ControlEvent::SessionExpired { message } => {
                tracing::warn!(session_id = %self.id, %message, "Realtime session expired");
                self.peer.disconnect();
                self.reset_turn();
                self.protocol.lock().reset();
                self.set_state(ConnectionState::Disconnected);
                // Not counted against the reconnect budget
                self.emit(SessionEvent::ReconnectNeeded {
                    attempt: self.reconnect_attempts.load(Ordering::SeqCst),
                    delay: Duration::ZERO,
                    reason: ReconnectReason::SessionExpired,
                });
                self.schedule_reconnect(Duration::ZERO);
            }
            ControlEvent::Error { code, message } => {
                tracing::error!(?code, %message, "Realtime API error");
                self.emit(SessionEvent::Error(VoiceError::Realtime { code, message }));
            }
            ControlEvent::SpeechStarted { audio_start_ms } => {
                tracing::debug!(audio_start_ms, "Speech started");
            }
            ControlEvent::SpeechStopped { audio_end_ms } => {
                tracing::debug!(audio_end_ms, "Speech stopped");
            }
            ControlEvent::SessionCreated { session_id } => {
                tracing::debug!(%session_id, "Realtime session created");
            }
            ControlEvent::SessionUpdated
            | ControlEvent::AudioCommitted { .. }
            | ControlEvent::ResponseStarted { .. } => {}
        }
    }

    fn apply_reconnect_policy(self: &Arc<Self>, reason: ReconnectReason) {
        let policy = &self.settings.reconnection;
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !policy.allows_attempt(attempt) {
            tracing::warn!(
                attempt,
                max_attempts = policy.max_attempts,
                "Reconnection attempts exhausted"
            );
            self.emit(SessionEvent::Error(VoiceError::MaxReconnectAttempts(
                policy.max_attempts,
            )));
            return;
        }

        let delay = policy.calculate_delay(attempt);
        tracing::info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "Reconnect needed"
        );
        self.emit(SessionEvent::ReconnectNeeded {
            attempt,
            delay,
            reason,
        });
        self.schedule_reconnect(delay);
    }

    fn schedule_reconnect(self: &Arc<Self>, delay: Duration) {
        if !self.settings.reconnection.auto_reconnect {
            return;
        }
        let Some(auth_token) = self.last_auth_token.lock().as_ref().map(|t| t.as_str().to_owned()) else {
            tracing::debug!("No credentials for automatic reconnect");
            return;
        };

        self.set_state(ConnectionState::Reconnecting);
        let cancel = self.cancel.lock().clone();
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            let auth_token = Zeroizing::new(auth_token);
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Scheduled reconnect cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(session) = session.upgrade() else {
                return;
            };
            tracing::info!(session_id = %session.id, "Reconnecting");
            if let Err(e) = session.connect(auth_token.as_str().to_owned()).await {
                tracing::warn!(error = %e, "Automatic reconnect failed");
            }
        });
    }
}
