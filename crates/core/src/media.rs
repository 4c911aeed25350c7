//! Local and remote audio media seam
//!
//! Capture and playback live outside this crate. The session manager only
//! holds opaque track handles and asks a [`MediaDevices`] implementation to
//! open, close, attach and detach them.

use crate::protocol::PeerId;
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// An audio input device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDevice {
    pub id: String,
    pub label: String,
    pub is_default: bool,
}

/// Handle to the local capture track shared by every session
///
/// The handle is type-erased; transports downcast it to the concrete track
/// type their media stack produced.
#[derive(Clone)]
pub struct LocalAudioTrack {
    id: String,
    device_id: String,
    handle: Arc<dyn Any + Send + Sync>,
}

impl LocalAudioTrack {
    pub fn new<T: Any + Send + Sync>(
        id: impl Into<String>,
        device_id: impl Into<String>,
        handle: Arc<T>,
    ) -> Self {
        Self {
            id: id.into(),
            device_id: device_id.into(),
            handle,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Concrete track, if it has type `T`
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.handle.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for LocalAudioTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAudioTrack")
            .field("id", &self.id)
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// Handle to an audio track received from a peer
#[derive(Clone)]
pub struct RemoteAudioTrack {
    id: String,
    handle: Arc<dyn Any + Send + Sync>,
}

impl RemoteAudioTrack {
    pub fn new<T: Any + Send + Sync>(id: impl Into<String>, handle: Arc<T>) -> Self {
        Self {
            id: id.into(),
            handle,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.handle.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for RemoteAudioTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAudioTrack").field("id", &self.id).finish()
    }
}

/// OS/browser media subsystem
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Available capture devices
    async fn list_devices(&self) -> Result<Vec<AudioDevice>>;

    /// Open a capture track (system default when `device_id` is `None`)
    async fn open_capture(&self, device_id: Option<&str>) -> Result<LocalAudioTrack>;

    /// Release a capture track previously returned by `open_capture`
    async fn close_capture(&self, track: &LocalAudioTrack) -> Result<()>;

    /// Enable or silence the capture track without releasing it
    fn set_capture_enabled(&self, track: &LocalAudioTrack, enabled: bool);

    /// Start playing a peer's audio
    async fn attach_remote(&self, peer_id: &PeerId, track: RemoteAudioTrack) -> Result<()>;

    /// Stop playing a peer's audio
    async fn detach_remote(&self, peer_id: &PeerId) -> Result<()>;

    /// Apply output volume (0.0..=1.0) and deafen state to all remote audio
    fn set_playback(&self, volume: f32, deafened: bool);
}

/// Local media controls reported in status snapshots
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    /// A capture track is open
    pub ready: bool,
    pub device_id: Option<String>,
    pub muted: bool,
    pub deafened: bool,
    pub volume: f32,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            ready: false,
            device_id: None,
            muted: false,
            deafened: false,
            volume: 1.0,
        }
    }
}

/// Clamp a requested volume into `0.0..=1.0`; NaN maps to silence
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}
