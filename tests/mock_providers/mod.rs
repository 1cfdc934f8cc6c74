//! In-memory host doubles for the voice transport
//!
//! Stands in for everything a browser (or native WebRTC stack) provides:
//! - Peer connections and data channels (`rtc_mock`)
//! - Microphone capture and the playback element (`media_mock`)
//! - The token service and SDP signaling endpoint (`token_mock`)
//!
//! Every double records what was asked of it so tests can assert on
//! ordering, ownership and cleanup.

// Each test binary uses a different subset of these helpers
#![allow(dead_code)]

pub mod media_mock;
pub mod rtc_mock;
pub mod token_mock;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use waav_voice::core::realtime::media::MediaEndpoint;
use waav_voice::core::realtime::peer::{PeerConfig, PeerConnection, PeerEvent};
use waav_voice::core::realtime::{Collaborators, SessionEvent, SessionToken};

pub use media_mock::{MockAudioElement, MockMediaDevices, MockTrack};
pub use rtc_mock::{MockDataChannel, MockPeer, MockPeerFactory, PeerBehavior};
pub use token_mock::{MockSdpExchange, MockTokenSource, SdpMode};

/// Per-double call counters
#[derive(Default, Debug)]
pub struct MockStats {
    pub calls: AtomicU64,
    pub failures: AtomicU64,
    pub timeouts: AtomicU64,
}

impl MockStats {
    pub fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> String {
        format!(
            "calls={}, failures={}, timeouts={}",
            self.calls.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
            self.timeouts.load(Ordering::Relaxed),
        )
    }
}

/// One fake host: peer factory, media devices, token service, SDP endpoint.
#[derive(Default, Clone)]
pub struct MockHost {
    pub factory: Arc<MockPeerFactory>,
    pub devices: Arc<MockMediaDevices>,
    pub tokens: Arc<MockTokenSource>,
    pub sdp: Arc<MockSdpExchange>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            token_source: self.tokens.clone(),
            sdp_exchange: self.sdp.clone(),
            peer_factory: self.factory.clone(),
            media_devices: self.devices.clone(),
        }
    }

    pub fn media_endpoint(&self, mute_output: bool) -> Arc<MediaEndpoint> {
        Arc::new(MediaEndpoint::new(self.devices.clone(), mute_output))
    }

    pub fn peer_connection(
        &self,
        config: PeerConfig,
    ) -> (PeerConnection, mpsc::UnboundedReceiver<PeerEvent>) {
        PeerConnection::new(
            config,
            self.factory.clone(),
            self.sdp.clone(),
            self.media_endpoint(false),
        )
    }

    pub fn summary(&self) -> String {
        format!(
            "peers: {} | media: {} | tokens: {} | sdp: {}",
            self.factory.stats.summary(),
            self.devices.stats.summary(),
            self.tokens.stats.summary(),
            self.sdp.stats.summary(),
        )
    }
}

/// A token valid for a minute.
pub fn session_token(restaurant_id: &str) -> SessionToken {
    SessionToken::new("ek_test", Duration::from_secs(60), restaurant_id, "kiosk-1")
}

/// Let spawned tasks and the event pump catch up.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Poll `condition` until it holds. Panics after 30s (virtual time under `start_paused`).
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(30), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "condition not reached within 30s");
}

/// Drain every peer event currently queued.
pub fn drain_peer_events(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<PeerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Drain every session event currently queued.
pub fn drain_session_events(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
