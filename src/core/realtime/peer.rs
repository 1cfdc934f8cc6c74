//! WebRTC peer connection lifecycle.
//!
//! [`PeerConnection`] negotiates one audio track plus the reliable `oai-events`
//! data channel against the realtime service, and owns every host object it
//! creates until [`PeerConnection::disconnect`] hands them back.
//!
//! # Cancellation
//!
//! Each connect attempt runs under a generation number. `disconnect` bumps the
//! generation and cancels the attempt's token before closing anything, so an
//! attempt stuck in a host await resolves right away with
//! [`VoiceError::PeerClosedDuringExchange`] and callbacks that belong to an
//! older generation become no-ops. Handlers capture a weak reference to the
//! core; closing the peer never leaves a reference cycle.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::base::{ConnectionState, VoiceError, VoiceResult};
use super::media::{LocalAudioTrack, MediaEndpoint, RemoteStream};
use super::openai::{
    CONNECT_TIMEOUT, CONTROL_CHANNEL_LABEL, ClientEvent, ControlChannelProtocol,
    DEFAULT_STUN_URL, SdpExchange,
};
use super::token::SessionToken;

/// Callback slot on a host RTC object.
pub type RtcHandler<T> = Arc<dyn Fn(T) + Send + Sync>;

// =============================================================================
// Host Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundlePolicy {
    Balanced,
    MaxCompat,
    MaxBundle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
    pub bundle_policy: BundlePolicy,
}

/// Data channel options. `None` limits mean fully reliable delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChannelInit {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
    pub max_packet_life_time: Option<u16>,
}

impl DataChannelInit {
    pub fn reliable() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
            max_packet_life_time: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Host RTCPeerConnection.
#[async_trait]
pub trait RtcPeer: Send + Sync {
    fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> VoiceResult<Arc<dyn DataChannel>>;
    fn add_track(&self, track: Arc<dyn LocalAudioTrack>) -> VoiceResult<()>;
    async fn create_offer(&self) -> VoiceResult<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> VoiceResult<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> VoiceResult<()>;
    fn signaling_state(&self) -> SignalingState;
    fn set_on_ice_connection_state_change(
        &self,
        handler: Option<RtcHandler<IceConnectionState>>,
    );
    fn set_on_track(&self, handler: Option<RtcHandler<RemoteStream>>);
    fn close(&self);
}

/// Host RTCDataChannel.
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    fn ready_state(&self) -> DataChannelState;
    fn send(&self, text: &str) -> VoiceResult<()>;
    fn set_on_open(&self, handler: Option<RtcHandler<()>>);
    fn set_on_message(&self, handler: Option<RtcHandler<String>>);
    fn set_on_close(&self, handler: Option<RtcHandler<()>>);
    fn set_on_error(&self, handler: Option<RtcHandler<String>>);
    fn close(&self);
}

/// Creates host peer connections.
pub trait PeerFactory: Send + Sync {
    fn create_peer(&self, config: &RtcConfiguration) -> VoiceResult<Arc<dyn RtcPeer>>;
}

/// Handle to the open control channel, handed to consumers.
#[derive(Clone)]
pub struct ControlChannel(Arc<dyn DataChannel>);

impl ControlChannel {
    pub fn new(channel: Arc<dyn DataChannel>) -> Self {
        Self(channel)
    }

    pub fn label(&self) -> String {
        self.0.label()
    }

    pub fn is_open(&self) -> bool {
        self.0.ready_state() == DataChannelState::Open
    }

    pub fn inner(&self) -> &Arc<dyn DataChannel> {
        &self.0
    }
}

impl fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlChannel")
            .field("label", &self.0.label())
            .field("ready_state", &self.0.ready_state())
            .finish()
    }
}

// =============================================================================
// Peer Events
// =============================================================================

/// Events raised by the peer connection, delivered in order on the receiver
/// returned from [`PeerConnection::new`].
#[derive(Debug, Clone)]
pub enum PeerEvent {
    DataChannelReady(ControlChannel),
    /// Raw control channel message
    Message(String),
    TrackReceived(RemoteStream),
    /// An established connection was lost.
    Disconnection,
    /// Raised before the matching `Error` when negotiation overruns its deadline.
    ConnectionTimeout,
    Error(VoiceError),
}

/// Transport settings for the peer connection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub stun_url: String,
    pub connect_timeout: Duration,
    pub channel_label: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            stun_url: DEFAULT_STUN_URL.to_string(),
            connect_timeout: CONNECT_TIMEOUT,
            channel_label: CONTROL_CHANNEL_LABEL.to_string(),
        }
    }
}

// =============================================================================
// Peer Connection
// =============================================================================

type ConnectAttempt = Shared<BoxFuture<'static, VoiceResult<()>>>;

#[derive(Default)]
struct PeerInner {
    state: ConnectionState,
    generation: u64,
    peer: Option<Arc<dyn RtcPeer>>,
    channel: Option<Arc<dyn DataChannel>>,
    pending: Option<(u64, ConnectAttempt)>,
    open_signal: Option<oneshot::Sender<VoiceResult<()>>>,
    /// Cancelled by teardown
    cancel: Option<CancellationToken>,
}

struct PeerCore {
    config: PeerConfig,
    factory: Arc<dyn PeerFactory>,
    sdp: Arc<dyn SdpExchange>,
    media: Arc<MediaEndpoint>,
    events: mpsc::UnboundedSender<PeerEvent>,
    inner: Mutex<PeerInner>,
}

/// WebRTC transport for one voice session.
#[derive(Clone)]
pub struct PeerConnection {
    core: Arc<PeerCore>,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.core.inner.lock();
        f.debug_struct("PeerConnection")
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("has_peer", &inner.peer.is_some())
            .field("has_channel", &inner.channel.is_some())
            .finish()
    }
}

impl PeerConnection {
    pub fn new(
        config: PeerConfig,
        factory: Arc<dyn PeerFactory>,
        sdp: Arc<dyn SdpExchange>,
        media: Arc<MediaEndpoint>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let core = Arc::new(PeerCore {
            config,
            factory,
            sdp,
            media,
            events,
            inner: Mutex::new(PeerInner::default()),
        });
        (Self { core }, rx)
    }

    /// Negotiate a connection using a fresh session token.
    ///
    /// Overlapping calls share the in-flight attempt; exactly one host peer is
    /// created. Resolves once the control channel is open, or fails with
    /// [`VoiceError::Timeout`] after the configured deadline.
    pub async fn connect(&self, token: SessionToken) -> VoiceResult<()> {
        let attempt = {
            let mut inner = self.core.inner.lock();
            if inner.state == ConnectionState::Connected {
                tracing::debug!("Already connected; connect() ignored");
                return Ok(());
            }
            match &inner.pending {
                Some((_, attempt)) => {
                    tracing::debug!("Joining in-flight connection attempt");
                    attempt.clone()
                }
                None => {
                    inner.generation += 1;
                    let generation = inner.generation;
                    inner.state = ConnectionState::Connecting;
                    let cancel = CancellationToken::new();
                    inner.cancel = Some(cancel.clone());
                    let attempt = self
                        .core
                        .clone()
                        .run_attempt(generation, token, cancel)
                        .boxed()
                        .shared();
                    inner.pending = Some((generation, attempt.clone()));
                    attempt
                }
            }
        };

        // Drive the attempt even if every caller stops polling, so its deadline still fires.
        tokio::spawn(attempt.clone());
        attempt.await
    }

    /// Tear down the connection from any state. Idempotent.
    pub fn disconnect(&self) {
        if self.core.teardown() {
            tracing::info!("Peer connection closed");
        }
    }

    /// Encode and send a client event on the open control channel.
    pub fn send(&self, event: &ClientEvent) -> VoiceResult<()> {
        let channel = {
            let inner = self.core.inner.lock();
            if inner.state != ConnectionState::Connected {
                return Err(VoiceError::NotConnected);
            }
            inner.channel.clone()
        }
        .ok_or(VoiceError::NotConnected)?;

        if channel.ready_state() != DataChannelState::Open {
            return Err(VoiceError::NotConnected);
        }

        let payload = ControlChannelProtocol::encode(event)?;
        tracing::trace!(kind = event.kind(), "Sending control event");
        channel.send(&payload)
    }

    pub fn state(&self) -> ConnectionState {
        self.core.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The live host peer, if any.
    pub fn peer(&self) -> Option<Arc<dyn RtcPeer>> {
        self.core.inner.lock().peer.clone()
    }

    /// The live control channel, if any.
    pub fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.core.inner.lock().channel.clone()
    }

    pub fn media(&self) -> &Arc<MediaEndpoint> {
        &self.core.media
    }

    pub fn config(&self) -> &PeerConfig {
        &self.core.config
    }
}

impl PeerCore {
    fn emit(&self, event: PeerEvent) {
        // Receiver gone means the owning session was dropped
        let _ = self.events.send(event);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().generation == generation
    }

    fn ensure_open(&self, generation: u64, peer: &Arc<dyn RtcPeer>) -> VoiceResult<()> {
        if !self.is_current(generation) || peer.signaling_state() == SignalingState::Closed {
            return Err(VoiceError::PeerClosedDuringExchange);
        }
        Ok(())
    }

    fn rtc_configuration(&self) -> RtcConfiguration {
        RtcConfiguration {
            ice_servers: vec![IceServer {
                urls: vec![self.config.stun_url.clone()],
            }],
            bundle_policy: BundlePolicy::MaxBundle,
        }
    }

    async fn run_attempt(
        self: Arc<Self>,
        generation: u64,
        token: SessionToken,
        cancel: CancellationToken,
    ) -> VoiceResult<()> {
        let deadline = self.config.connect_timeout;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("Connection attempt cancelled by disconnect");
                Err(VoiceError::PeerClosedDuringExchange)
            }
            outcome = tokio::time::timeout(deadline, self.negotiate(generation, token)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::error!(
                            timeout_ms = deadline.as_millis() as u64,
                            "Connection attempt timed out"
                        );
                        if self.is_current(generation) {
                            self.emit(PeerEvent::ConnectionTimeout);
                        }
                        Err(VoiceError::Timeout(deadline))
                    }
                }
            }
        };
        self.settle(generation, result)
    }

    fn settle(&self, generation: u64, result: VoiceResult<()>) -> VoiceResult<()> {
        let current = {
            let mut inner = self.inner.lock();
            if inner
                .pending
                .as_ref()
                .is_some_and(|(pending, _)| *pending == generation)
            {
                inner.pending = None;
            }
            let current = inner.generation == generation;
            if current && result.is_ok() {
                inner.state = ConnectionState::Connected;
            }
            current
        };

        match result {
            Ok(()) if current => {
                tracing::info!("Peer connection established");
                if let Some(channel) = self.inner.lock().channel.clone() {
                    self.emit(PeerEvent::DataChannelReady(ControlChannel::new(channel)));
                }
                Ok(())
            }
            Ok(()) => Err(VoiceError::PeerClosedDuringExchange),
            Err(err) => {
                if current {
                    tracing::warn!(error = %err, "Connection attempt failed");
                    self.inner.lock().state = ConnectionState::Error;
                    self.teardown();
                    if !err.is_benign() {
                        self.emit(PeerEvent::Error(err.clone()));
                    }
                } else {
                    tracing::debug!(error = %err, "Superseded connection attempt finished");
                }
                Err(err)
            }
        }
    }

    async fn negotiate(self: &Arc<Self>, generation: u64, token: SessionToken) -> VoiceResult<()> {
        let peer = self.factory.create_peer(&self.rtc_configuration())?;
        let (open_tx, open_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                drop(inner);
                peer.close();
                return Err(VoiceError::PeerClosedDuringExchange);
            }
            inner.peer = Some(peer.clone());
            inner.open_signal = Some(open_tx);
        }
        self.attach_peer_handlers(generation, &peer);

        let channel =
            peer.create_data_channel(&self.config.channel_label, DataChannelInit::reliable())?;
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                drop(inner);
                channel.close();
                return Err(VoiceError::PeerClosedDuringExchange);
            }
            inner.channel = Some(channel.clone());
        }
        self.attach_channel_handlers(generation, &channel);

        let track = self.media.acquire_microphone().await?;
        if !self.is_current(generation) {
            self.media.discard_track(&track);
            return Err(VoiceError::PeerClosedDuringExchange);
        }
        peer.add_track(track)?;

        let offer = peer.create_offer().await?;
        self.ensure_open(generation, &peer)?;
        peer.set_local_description(offer.clone()).await?;
        self.ensure_open(generation, &peer)?;

        if token.is_expired() {
            return Err(VoiceError::SessionExpired(
                "session token expired before SDP exchange".to_string(),
            ));
        }

        let answer = match self.sdp.exchange(&offer.sdp, &token).await {
            Ok(answer) => answer,
            Err(err) => {
                if self.ensure_open(generation, &peer).is_err() {
                    tracing::info!(error = %err, "Peer closed while SDP exchange was in flight");
                    return Err(VoiceError::PeerClosedDuringExchange);
                }
                return Err(err);
            }
        };
        // Single use
        drop(token);

        self.ensure_open(generation, &peer)?;
        peer.set_remote_description(SessionDescription::answer(answer)).await?;
        self.ensure_open(generation, &peer)?;

        tracing::debug!("Remote description applied; waiting for control channel");
        match open_rx.await {
            Ok(result) => result?,
            Err(_) => return Err(VoiceError::PeerClosedDuringExchange),
        }
        self.ensure_open(generation, &peer)
    }

    fn attach_peer_handlers(self: &Arc<Self>, generation: u64, peer: &Arc<dyn RtcPeer>) {
        let weak = Arc::downgrade(self);
        peer.set_on_ice_connection_state_change(Some(Arc::new(move |state: IceConnectionState| {
            if let Some(core) = weak.upgrade() {
                core.on_ice_state(generation, state);
            }
        })));

        let weak = Arc::downgrade(self);
        peer.set_on_track(Some(Arc::new(move |stream: RemoteStream| {
            if let Some(core) = weak.upgrade() {
                core.on_remote_track(generation, stream);
            }
        })));
    }

    fn attach_channel_handlers(self: &Arc<Self>, generation: u64, channel: &Arc<dyn DataChannel>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        channel.set_on_open(Some(Arc::new(move |()| {
            if let Some(core) = weak.upgrade()
                && core.is_current(generation)
            {
                tracing::debug!("Control channel open");
                if let Some(signal) = core.inner.lock().open_signal.take() {
                    let _ = signal.send(Ok(()));
                }
            }
        })));

        let weak = Arc::downgrade(self);
        channel.set_on_message(Some(Arc::new(move |text: String| {
            if let Some(core) = weak.upgrade()
                && core.is_current(generation)
            {
                core.emit(PeerEvent::Message(text));
            }
        })));

        let weak = Arc::downgrade(self);
        channel.set_on_close(Some(Arc::new(move |()| {
            if let Some(core) = weak.upgrade() {
                core.on_transport_lost(generation, "control channel closed");
            }
        })));

        channel.set_on_error(Some(Arc::new(move |message: String| {
            tracing::warn!(generation, error = %message, "Control channel error");
        })));
    }

    fn on_ice_state(&self, generation: u64, state: IceConnectionState) {
        if !self.is_current(generation) {
            tracing::trace!(%state, "Late ICE callback ignored");
            return;
        }
        tracing::debug!(%state, "ICE connection state changed");
        if matches!(
            state,
            IceConnectionState::Failed | IceConnectionState::Disconnected
        ) {
            self.on_transport_lost(generation, &format!("ICE connection {state}"));
        }
    }

    fn on_transport_lost(&self, generation: u64, reason: &str) {
        let (current, state, signal) = {
            let mut inner = self.inner.lock();
            let current = inner.generation == generation;
            let signal = if current && inner.state == ConnectionState::Connecting {
                inner.open_signal.take()
            } else {
                None
            };
            (current, inner.state, signal)
        };
        if !current {
            return;
        }

        match state {
            ConnectionState::Connected => {
                tracing::warn!(reason, "Connection lost");
                self.teardown();
                self.emit(PeerEvent::Disconnection);
            }
            ConnectionState::Connecting => {
                if let Some(signal) = signal {
                    let _ = signal.send(Err(VoiceError::Network(reason.to_string())));
                }
            }
            _ => {}
        }
    }

    fn on_remote_track(&self, generation: u64, stream: RemoteStream) {
        if !self.is_current(generation) {
            return;
        }
        if let Err(e) = self.media.attach_remote_stream(stream.clone()) {
            tracing::warn!(error = %e, "Failed to attach remote audio");
        }
        self.emit(PeerEvent::TrackReceived(stream));
    }

    /// Close and drop every owned host object. Returns whether anything was live.
    fn teardown(&self) -> bool {
        let (peer, channel, was_active) = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.pending = None;
            inner.open_signal = None;
            if let Some(cancel) = inner.cancel.take() {
                cancel.cancel();
            }
            let was_active = inner.state != ConnectionState::Disconnected;
            inner.state = ConnectionState::Disconnected;
            (inner.peer.take(), inner.channel.take(), was_active)
        };

        if let Some(peer) = &peer {
            peer.close();
        }
        if let Some(channel) = &channel {
            channel.close();
        }
        self.media.release();

        if let Some(channel) = &channel {
            channel.set_on_open(None);
            channel.set_on_message(None);
            channel.set_on_close(None);
            channel.set_on_error(None);
        }
        if let Some(peer) = &peer {
            peer.set_on_ice_connection_state_change(None);
            peer.set_on_track(None);
        }

        was_active || peer.is_some()
    }
}
