//! In-memory getUserMedia and HTMLAudioElement

use super::MockStats;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use waav_voice::core::realtime::media::{
    AudioConstraints, AudioElement, LocalAudioTrack, LocalStream, MediaDeviceError,
    MediaDevices, MediaHandler, RemoteStream,
};
use waav_voice::core::realtime::{VoiceError, VoiceResult};

// =============================================================================
// Track
// =============================================================================

pub struct MockTrack {
    id: String,
    enabled: AtomicBool,
    live: AtomicBool,
    on_ended: Mutex<Option<MediaHandler>>,
    on_mute: Mutex<Option<MediaHandler>>,
}

impl MockTrack {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            on_ended: Mutex::new(None),
            on_mute: Mutex::new(None),
        }
    }

    /// The host ended the track (device unplugged, permission revoked).
    pub fn end(&self) {
        self.live.store(false, Ordering::SeqCst);
        let handler = self.on_ended.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    pub fn has_on_ended(&self) -> bool {
        self.on_ended.lock().is_some()
    }

    pub fn handlers_cleared(&self) -> bool {
        self.on_ended.lock().is_none() && self.on_mute.lock().is_none()
    }
}

impl LocalAudioTrack for MockTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn set_on_ended(&self, handler: Option<MediaHandler>) {
        *self.on_ended.lock() = handler;
    }

    fn set_on_mute(&self, handler: Option<MediaHandler>) {
        *self.on_mute.lock() = handler;
    }
}

// =============================================================================
// Audio Element
// =============================================================================

#[derive(Default)]
pub struct MockAudioElement {
    ops: Mutex<Vec<String>>,
    hidden: AtomicBool,
    autoplay: AtomicBool,
    muted: AtomicBool,
    volume: Mutex<Option<f32>>,
    src_object: Mutex<Option<RemoteStream>>,
    attached: AtomicBool,
    playing: AtomicBool,
    block_autoplay: AtomicBool,
    refuse_attach: AtomicBool,
    on_error: Mutex<Option<MediaHandler>>,
    on_ended: Mutex<Option<MediaHandler>>,
}

impl MockAudioElement {
    fn record(&self, op: impl Into<String>) {
        self.ops.lock().push(op.into());
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::SeqCst)
    }

    pub fn is_autoplay(&self) -> bool {
        self.autoplay.load(Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// `None` until the volume is touched.
    pub fn volume(&self) -> Option<f32> {
        *self.volume.lock()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Make `play()` reject the way browsers do before a user gesture.
    pub fn block_autoplay(&self) {
        self.block_autoplay.store(true, Ordering::SeqCst);
    }

    /// Make `attach()` fail as if the document had no body.
    pub fn refuse_attach(&self) {
        self.refuse_attach.store(true, Ordering::SeqCst);
    }

    pub fn handlers_cleared(&self) -> bool {
        self.on_error.lock().is_none() && self.on_ended.lock().is_none()
    }
}

impl AudioElement for MockAudioElement {
    fn set_hidden(&self, hidden: bool) {
        self.hidden.store(hidden, Ordering::SeqCst);
    }

    fn set_autoplay(&self, autoplay: bool) {
        self.autoplay.store(autoplay, Ordering::SeqCst);
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn set_volume(&self, volume: f32) {
        *self.volume.lock() = Some(volume);
    }

    fn set_src_object(&self, stream: Option<RemoteStream>) {
        match &stream {
            Some(s) => self.record(format!("src_object:{}", s.id)),
            None => self.record("src_object:none"),
        }
        *self.src_object.lock() = stream;
    }

    fn src_object(&self) -> Option<RemoteStream> {
        self.src_object.lock().clone()
    }

    fn clear_src(&self) {
        self.record("clear_src");
    }

    fn play(&self) -> VoiceResult<()> {
        self.record("play");
        if self.block_autoplay.load(Ordering::SeqCst) {
            return Err(VoiceError::Permission(
                "play() failed because the user didn't interact with the document first"
                    .to_string(),
            ));
        }
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self) {
        self.record("pause");
        self.playing.store(false, Ordering::SeqCst);
    }

    fn attach(&self) -> VoiceResult<()> {
        self.record("attach");
        if self.refuse_attach.load(Ordering::SeqCst) {
            return Err(VoiceError::InvalidConfiguration(
                "no document body to attach the audio element to".to_string(),
            ));
        }
        self.attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn detach(&self) {
        self.record("detach");
        self.attached.store(false, Ordering::SeqCst);
    }

    fn set_on_error(&self, handler: Option<MediaHandler>) {
        *self.on_error.lock() = handler;
    }

    fn set_on_ended(&self, handler: Option<MediaHandler>) {
        *self.on_ended.lock() = handler;
    }
}

// =============================================================================
// Devices
// =============================================================================

#[derive(Default)]
pub struct MockMediaDevices {
    deny: Mutex<Option<MediaDeviceError>>,
    empty_stream: AtomicBool,
    refuse_attach: AtomicBool,
    delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<AudioConstraints>>,
    tracks: Mutex<Vec<Arc<MockTrack>>>,
    elements: Mutex<Vec<Arc<MockAudioElement>>>,
    next_id: AtomicU64,
    pub stats: MockStats,
}

impl MockMediaDevices {
    pub fn deny(&self, error: MediaDeviceError) {
        *self.deny.lock() = Some(error);
    }

    pub fn allow(&self) {
        *self.deny.lock() = None;
    }

    /// Hand out streams with no audio track.
    pub fn return_empty_stream(&self) {
        self.empty_stream.store(true, Ordering::SeqCst);
    }

    /// Hand out audio elements that cannot be attached.
    pub fn refuse_element_attach(&self) {
        self.refuse_attach.store(true, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn requests(&self) -> Vec<AudioConstraints> {
        self.requests.lock().clone()
    }

    pub fn tracks(&self) -> Vec<Arc<MockTrack>> {
        self.tracks.lock().clone()
    }

    pub fn last_track(&self) -> Option<Arc<MockTrack>> {
        self.tracks.lock().last().cloned()
    }

    pub fn elements(&self) -> Vec<Arc<MockAudioElement>> {
        self.elements.lock().clone()
    }

    pub fn last_element(&self) -> Option<Arc<MockAudioElement>> {
        self.elements.lock().last().cloned()
    }

    /// Tracks that were issued and never stopped.
    pub fn live_tracks(&self) -> usize {
        self.tracks.lock().iter().filter(|t| t.is_live()).count()
    }
}

#[async_trait]
impl MediaDevices for MockMediaDevices {
    async fn get_user_media(
        &self,
        constraints: AudioConstraints,
    ) -> Result<LocalStream, MediaDeviceError> {
        self.requests.lock().push(constraints);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.deny.lock().clone() {
            self.stats.record_failure();
            return Err(err);
        }
        self.stats.record_call();

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        if self.empty_stream.load(Ordering::SeqCst) {
            return Ok(LocalStream {
                id: format!("stream-{n}"),
                tracks: Vec::new(),
            });
        }

        let track = Arc::new(MockTrack::new(format!("mic-{n}")));
        self.tracks.lock().push(track.clone());
        Ok(LocalStream {
            id: format!("stream-{n}"),
            tracks: vec![track],
        })
    }

    fn create_audio_element(&self) -> VoiceResult<Arc<dyn AudioElement>> {
        let element = Arc::new(MockAudioElement::default());
        if self.refuse_attach.load(Ordering::SeqCst) {
            element.refuse_attach();
        }
        self.elements.lock().push(element.clone());
        Ok(element)
    }
}
