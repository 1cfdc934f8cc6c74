//! In-memory RTCPeerConnection / RTCDataChannel
//!
//! Signaling completes instantly. `set_remote_description` optionally fires the
//! remote track and opens every data channel, the way a browser does once the
//! answer is applied and DTLS/SCTP come up.

use super::MockStats;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use waav_voice::core::realtime::media::{LocalAudioTrack, RemoteStream};
use waav_voice::core::realtime::peer::{
    DataChannel, DataChannelInit, DataChannelState, IceConnectionState, PeerFactory,
    RtcConfiguration, RtcHandler, RtcPeer, SessionDescription, SignalingState,
};
use waav_voice::core::realtime::{VoiceError, VoiceResult};

pub const MOCK_OFFER_SDP: &str = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=offer\r\n";
pub const REMOTE_STREAM_ID: &str = "remote-1";

// =============================================================================
// Data Channel
// =============================================================================

pub struct MockDataChannel {
    label: String,
    init: DataChannelInit,
    state: Mutex<DataChannelState>,
    sent: Mutex<Vec<String>>,
    on_open: Mutex<Option<RtcHandler<()>>>,
    on_message: Mutex<Option<RtcHandler<String>>>,
    on_close: Mutex<Option<RtcHandler<()>>>,
    on_error: Mutex<Option<RtcHandler<String>>>,
}

impl MockDataChannel {
    fn new(label: &str, init: DataChannelInit) -> Self {
        Self {
            label: label.to_string(),
            init,
            state: Mutex::new(DataChannelState::Connecting),
            sent: Mutex::new(Vec::new()),
            on_open: Mutex::new(None),
            on_message: Mutex::new(None),
            on_close: Mutex::new(None),
            on_error: Mutex::new(None),
        }
    }

    pub fn init(&self) -> DataChannelInit {
        self.init
    }

    /// Transition to open and fire `onopen`.
    pub fn open(&self) {
        {
            let mut state = self.state.lock();
            if *state != DataChannelState::Connecting {
                return;
            }
            *state = DataChannelState::Open;
        }
        let handler = self.on_open.lock().clone();
        if let Some(handler) = handler {
            handler(());
        }
    }

    /// Deliver an inbound message from the remote side.
    pub fn deliver(&self, text: &str) {
        let handler = self.on_message.lock().clone();
        if let Some(handler) = handler {
            handler(text.to_string());
        }
    }

    pub fn deliver_json(&self, value: serde_json::Value) {
        self.deliver(&value.to_string());
    }

    /// The remote side closed the channel.
    pub fn remote_close(&self) {
        *self.state.lock() = DataChannelState::Closed;
        let handler = self.on_close.lock().clone();
        if let Some(handler) = handler {
            handler(());
        }
    }

    pub fn raise_error(&self, message: &str) {
        let handler = self.on_error.lock().clone();
        if let Some(handler) = handler {
            handler(message.to_string());
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// `type` field of every sent message, in order.
    pub fn sent_types(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .filter_map(|v| v["type"].as_str().map(str::to_string))
            .collect()
    }

    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect()
    }

    pub fn handlers_cleared(&self) -> bool {
        self.on_open.lock().is_none()
            && self.on_message.lock().is_none()
            && self.on_close.lock().is_none()
            && self.on_error.lock().is_none()
    }
}

impl DataChannel for MockDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn ready_state(&self) -> DataChannelState {
        *self.state.lock()
    }

    fn send(&self, text: &str) -> VoiceResult<()> {
        if *self.state.lock() != DataChannelState::Open {
            return Err(VoiceError::NotConnected);
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    fn set_on_open(&self, handler: Option<RtcHandler<()>>) {
        *self.on_open.lock() = handler;
    }

    fn set_on_message(&self, handler: Option<RtcHandler<String>>) {
        *self.on_message.lock() = handler;
    }

    fn set_on_close(&self, handler: Option<RtcHandler<()>>) {
        *self.on_close.lock() = handler;
    }

    fn set_on_error(&self, handler: Option<RtcHandler<String>>) {
        *self.on_error.lock() = handler;
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == DataChannelState::Closed {
                return;
            }
            *state = DataChannelState::Closed;
        }
        // Browsers fire onclose for local closes as well
        let handler = self.on_close.lock().clone();
        if let Some(handler) = handler {
            handler(());
        }
    }
}

// =============================================================================
// Peer
// =============================================================================

/// How a mock peer behaves once the answer is applied.
#[derive(Debug, Clone, Copy)]
pub struct PeerBehavior {
    pub open_channels: bool,
    pub remote_track: bool,
}

impl Default for PeerBehavior {
    fn default() -> Self {
        Self {
            open_channels: true,
            remote_track: true,
        }
    }
}

pub struct MockPeer {
    config: RtcConfiguration,
    behavior: PeerBehavior,
    signaling: Mutex<SignalingState>,
    channels: Mutex<Vec<Arc<MockDataChannel>>>,
    tracks: Mutex<Vec<Arc<dyn LocalAudioTrack>>>,
    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    on_ice: Mutex<Option<RtcHandler<IceConnectionState>>>,
    on_track: Mutex<Option<RtcHandler<RemoteStream>>>,
    closed: AtomicBool,
}

impl MockPeer {
    fn new(config: RtcConfiguration, behavior: PeerBehavior) -> Self {
        Self {
            config,
            behavior,
            signaling: Mutex::new(SignalingState::Stable),
            channels: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            on_ice: Mutex::new(None),
            on_track: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RtcConfiguration {
        &self.config
    }

    pub fn channel(&self) -> Option<Arc<MockDataChannel>> {
        self.channels.lock().first().cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.lock().iter().map(|t| t.id()).collect()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local_description.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Report an ICE state change from the host.
    pub fn ice(&self, state: IceConnectionState) {
        let handler = self.on_ice.lock().clone();
        if let Some(handler) = handler {
            handler(state);
        }
    }

    pub fn fail_ice(&self) {
        self.ice(IceConnectionState::Failed);
    }

    pub fn deliver_track(&self, stream: RemoteStream) {
        let handler = self.on_track.lock().clone();
        if let Some(handler) = handler {
            handler(stream);
        }
    }

    pub fn handlers_cleared(&self) -> bool {
        self.on_ice.lock().is_none() && self.on_track.lock().is_none()
    }
}

#[async_trait]
impl RtcPeer for MockPeer {
    fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> VoiceResult<Arc<dyn DataChannel>> {
        if self.is_closed() {
            return Err(VoiceError::Network("peer connection is closed".to_string()));
        }
        let channel = Arc::new(MockDataChannel::new(label, init));
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    fn add_track(&self, track: Arc<dyn LocalAudioTrack>) -> VoiceResult<()> {
        if self.is_closed() {
            return Err(VoiceError::Network("peer connection is closed".to_string()));
        }
        self.tracks.lock().push(track);
        Ok(())
    }

    async fn create_offer(&self) -> VoiceResult<SessionDescription> {
        if self.is_closed() {
            return Err(VoiceError::Network("peer connection is closed".to_string()));
        }
        Ok(SessionDescription::offer(MOCK_OFFER_SDP))
    }

    async fn set_local_description(&self, description: SessionDescription) -> VoiceResult<()> {
        if self.is_closed() {
            return Err(VoiceError::Network("peer connection is closed".to_string()));
        }
        *self.local_description.lock() = Some(description);
        *self.signaling.lock() = SignalingState::HaveLocalOffer;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> VoiceResult<()> {
        if self.is_closed() {
            return Err(VoiceError::Network("peer connection is closed".to_string()));
        }
        *self.remote_description.lock() = Some(description);
        *self.signaling.lock() = SignalingState::Stable;

        if self.behavior.remote_track {
            self.deliver_track(RemoteStream::new(REMOTE_STREAM_ID));
        }
        if self.behavior.open_channels {
            let channels = self.channels.lock().clone();
            for channel in channels {
                channel.open();
            }
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        *self.signaling.lock()
    }

    fn set_on_ice_connection_state_change(
        &self,
        handler: Option<RtcHandler<IceConnectionState>>,
    ) {
        *self.on_ice.lock() = handler;
    }

    fn set_on_track(&self, handler: Option<RtcHandler<RemoteStream>>) {
        *self.on_track.lock() = handler;
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.signaling.lock() = SignalingState::Closed;
    }
}

// =============================================================================
// Factory
// =============================================================================

#[derive(Default)]
pub struct MockPeerFactory {
    behavior: Mutex<PeerBehavior>,
    peers: Mutex<Vec<Arc<MockPeer>>>,
    pub stats: MockStats,
}

impl MockPeerFactory {
    pub fn set_behavior(&self, behavior: PeerBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.peers.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn last_peer(&self) -> Option<Arc<MockPeer>> {
        self.peers.lock().last().cloned()
    }

    pub fn last_channel(&self) -> Option<Arc<MockDataChannel>> {
        self.last_peer().and_then(|p| p.channel())
    }
}

impl PeerFactory for MockPeerFactory {
    fn create_peer(&self, config: &RtcConfiguration) -> VoiceResult<Arc<dyn RtcPeer>> {
        self.stats.record_call();
        let peer = Arc::new(MockPeer::new(config.clone(), *self.behavior.lock()));
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}
