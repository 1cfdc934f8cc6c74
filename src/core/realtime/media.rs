//! Local capture and remote playback.
//!
//! [`MediaEndpoint`] wraps every interaction with the host's media devices and
//! the hidden playback element. The resources it owns live for exactly one
//! connect/disconnect cycle; [`MediaEndpoint::release`] returns it to an empty
//! state with no live tracks, no attached element and no handlers.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use super::base::{VoiceError, VoiceResult};

/// Callback slot on a host media object.
pub type MediaHandler = Arc<dyn Fn() + Send + Sync>;

/// Capture constraints requested from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Identity of a remote media stream delivered by the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteStream {
    pub id: String,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Why the host refused to hand out a capture stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaDeviceError {
    PermissionDenied(String),
    NotFound(String),
    Unavailable(String),
}

impl From<MediaDeviceError> for VoiceError {
    fn from(err: MediaDeviceError) -> Self {
        match err {
            MediaDeviceError::PermissionDenied(msg) => {
                VoiceError::Permission(format!("access denied: {msg}"))
            }
            MediaDeviceError::NotFound(msg) => {
                VoiceError::Permission(format!("no capture device: {msg}"))
            }
            MediaDeviceError::Unavailable(msg) => VoiceError::Permission(msg),
        }
    }
}

// =============================================================================
// Host Traits
// =============================================================================

/// A local capture track.
pub trait LocalAudioTrack: Send + Sync {
    fn id(&self) -> String;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    fn stop(&self);
    fn is_live(&self) -> bool;
    fn set_on_ended(&self, handler: Option<MediaHandler>);
    fn set_on_mute(&self, handler: Option<MediaHandler>);
}

impl fmt::Debug for dyn LocalAudioTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAudioTrack").field("id", &self.id()).finish()
    }
}

/// A capture stream as returned by the host.
#[derive(Clone)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<Arc<dyn LocalAudioTrack>>,
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.id)
            .field(
                "tracks",
                &self.tracks.iter().map(|t| t.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Playback element for the remote stream.
pub trait AudioElement: Send + Sync {
    /// `display: none`
    fn set_hidden(&self, hidden: bool);
    fn set_autoplay(&self, autoplay: bool);
    fn set_muted(&self, muted: bool);
    fn set_volume(&self, volume: f32);
    fn set_src_object(&self, stream: Option<RemoteStream>);
    fn src_object(&self) -> Option<RemoteStream>;
    fn clear_src(&self);
    fn play(&self) -> VoiceResult<()>;
    fn pause(&self);
    /// Insert into the document.
    fn attach(&self) -> VoiceResult<()>;
    /// Remove from its parent, if any.
    fn detach(&self);
    fn set_on_error(&self, handler: Option<MediaHandler>);
    fn set_on_ended(&self, handler: Option<MediaHandler>);
}

/// Host device access.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Prompt for (or reuse) microphone access.
    async fn get_user_media(
        &self,
        constraints: AudioConstraints,
    ) -> Result<LocalStream, MediaDeviceError>;

    /// Create a detached audio element.
    fn create_audio_element(&self) -> VoiceResult<Arc<dyn AudioElement>>;
}

// =============================================================================
// Media Endpoint
// =============================================================================

#[derive(Default)]
struct MediaResources {
    local_stream: Option<LocalStream>,
    remote_stream: Option<RemoteStream>,
    audio_element: Option<Arc<dyn AudioElement>>,
}

/// Owner of the local capture stream and the remote playback element.
pub struct MediaEndpoint {
    devices: Arc<dyn MediaDevices>,
    constraints: AudioConstraints,
    mute_output: bool,
    resources: Mutex<MediaResources>,
}

impl fmt::Debug for MediaEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resources = self.resources.lock();
        f.debug_struct("MediaEndpoint")
            .field("mute_output", &self.mute_output)
            .field("local_stream", &resources.local_stream)
            .field("remote_stream", &resources.remote_stream)
            .field("has_audio_element", &resources.audio_element.is_some())
            .finish()
    }
}

impl MediaEndpoint {
    pub fn new(devices: Arc<dyn MediaDevices>, mute_output: bool) -> Self {
        Self {
            devices,
            constraints: AudioConstraints::default(),
            mute_output,
            resources: Mutex::new(MediaResources::default()),
        }
    }

    /// Acquire the microphone. The returned track starts disabled (push-to-talk).
    pub async fn acquire_microphone(&self) -> VoiceResult<Arc<dyn LocalAudioTrack>> {
        let stream = self
            .devices
            .get_user_media(self.constraints)
            .await
            .map_err(|e| {
                let err = VoiceError::from(e);
                tracing::warn!(error = %err, "Microphone acquisition failed");
                err
            })?;

        let Some(track) = stream.tracks.first().cloned() else {
            stop_stream(&stream);
            return Err(VoiceError::Permission(
                "capture stream has no audio track".to_string(),
            ));
        };

        for t in &stream.tracks {
            t.set_enabled(false);
            let track_id = t.id();
            t.set_on_ended(Some(Arc::new(move || {
                tracing::warn!(track_id = %track_id, "Microphone track ended");
            })));
        }

        let previous = self.resources.lock().local_stream.replace(stream);
        if let Some(previous) = previous {
            tracing::debug!(stream_id = %previous.id, "Replacing stale capture stream");
            stop_stream(&previous);
        }

        tracing::info!(track_id = %track.id(), "Microphone acquired (disabled)");
        Ok(track)
    }

    /// Stop a track obtained from [`acquire_microphone`](Self::acquire_microphone)
    /// by an attempt that no longer owns the endpoint.
    pub fn discard_track(&self, track: &Arc<dyn LocalAudioTrack>) {
        let id = track.id();
        let owned = {
            let mut resources = self.resources.lock();
            let matches = resources
                .local_stream
                .as_ref()
                .is_some_and(|s| s.tracks.iter().any(|t| t.id() == id));
            if matches {
                resources.local_stream.take()
            } else {
                None
            }
        };
        match owned {
            Some(stream) => stop_stream(&stream),
            None => {
                track.stop();
                track.set_on_ended(None);
                track.set_on_mute(None);
            }
        }
    }

    /// Unmute the capture track. No-op without a stream.
    pub fn enable_microphone(&self) {
        self.set_microphone_enabled(true);
    }

    /// Mute the capture track. No-op without a stream.
    pub fn disable_microphone(&self) {
        self.set_microphone_enabled(false);
    }

    fn set_microphone_enabled(&self, enabled: bool) {
        let resources = self.resources.lock();
        let Some(stream) = resources.local_stream.as_ref() else {
            tracing::trace!(enabled, "No capture stream; microphone toggle ignored");
            return;
        };
        for track in &stream.tracks {
            track.set_enabled(enabled);
        }
        tracing::debug!(enabled, "Microphone toggled");
    }

    pub fn is_microphone_enabled(&self) -> bool {
        self.resources
            .lock()
            .local_stream
            .as_ref()
            .is_some_and(|s| s.tracks.iter().any(|t| t.is_enabled()))
    }

    /// Route the remote stream into the hidden playback element, creating it on first use.
    pub fn attach_remote_stream(&self, stream: RemoteStream) -> VoiceResult<()> {
        let element = {
            let mut resources = self.resources.lock();
            let element = match resources.audio_element.clone() {
                Some(element) => element,
                None => {
                    let element = self.create_element()?;
                    resources.audio_element = Some(element.clone());
                    element
                }
            };
            resources.remote_stream = Some(stream.clone());
            element
        };

        element.set_src_object(Some(stream.clone()));
        if let Err(e) = element.play() {
            // Autoplay may be blocked until the next user gesture.
            tracing::warn!(error = %e, "Remote audio playback did not start");
        }
        tracing::info!(stream_id = %stream.id, "Remote audio attached");
        Ok(())
    }

    fn create_element(&self) -> VoiceResult<Arc<dyn AudioElement>> {
        let element = self.devices.create_audio_element()?;
        element.set_hidden(true);
        element.set_autoplay(true);
        if self.mute_output {
            element.set_muted(true);
            element.set_volume(0.0);
        }
        element.set_on_error(Some(Arc::new(|| {
            tracing::warn!("Remote audio element reported an error");
        })));
        if let Err(e) = element.attach() {
            element.set_on_error(None);
            return Err(e);
        }
        Ok(element)
    }

    /// Tear down everything owned by this cycle.
    ///
    /// Order: pause playback, clear `srcObject`, clear `src`, detach the
    /// element, stop every local track, then null every handler.
    pub fn release(&self) {
        let MediaResources {
            local_stream,
            remote_stream,
            audio_element,
        } = std::mem::take(&mut *self.resources.lock());

        if let Some(element) = &audio_element {
            element.pause();
            element.set_src_object(None);
            element.clear_src();
            element.detach();
        }
        if let Some(stream) = &local_stream {
            for track in &stream.tracks {
                track.stop();
            }
        }
        if let Some(stream) = &local_stream {
            for track in &stream.tracks {
                track.set_on_ended(None);
                track.set_on_mute(None);
            }
        }
        if let Some(element) = &audio_element {
            element.set_on_error(None);
            element.set_on_ended(None);
        }

        if local_stream.is_some() || remote_stream.is_some() || audio_element.is_some() {
            tracing::debug!("Media resources released");
        }
    }

    pub fn has_local_stream(&self) -> bool {
        self.resources.lock().local_stream.is_some()
    }

    pub fn local_track(&self) -> Option<Arc<dyn LocalAudioTrack>> {
        self.resources
            .lock()
            .local_stream
            .as_ref()
            .and_then(|s| s.tracks.first().cloned())
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.resources.lock().remote_stream.clone()
    }

    pub fn audio_element(&self) -> Option<Arc<dyn AudioElement>> {
        self.resources.lock().audio_element.clone()
    }
}

fn stop_stream(stream: &LocalStream) {
    for track in &stream.tracks {
        track.stop();
        track.set_on_ended(None);
        track.set_on_mute(None);
    }
}
