//! Scripted audio devices

use crate::media::{AudioDevice, LocalAudioTrack, MediaDevices, RemoteAudioTrack};
use crate::protocol::PeerId;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Capture handle produced by [`FakeMediaDevices`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCapture {
    pub device_id: String,
}

/// Every call observed by [`FakeMediaDevices`], in order
#[derive(Debug, Clone, PartialEq)]
pub enum MediaCall {
    Open(String),
    Close(String),
    CaptureEnabled { track_id: String, enabled: bool },
    Attach(PeerId),
    Detach(PeerId),
    Playback { volume: f32, deafened: bool },
}

/// In-memory [`MediaDevices`] with a fixed device list
pub struct FakeMediaDevices {
    devices: Vec<AudioDevice>,
    next_track: AtomicU32,
    calls: Mutex<Vec<MediaCall>>,
    playing: Mutex<BTreeSet<PeerId>>,
}

impl Default for FakeMediaDevices {
    fn default() -> Self {
        Self::with_devices(vec![
            AudioDevice {
                id: "default".to_string(),
                label: "Default Microphone".to_string(),
                is_default: true,
            },
            AudioDevice {
                id: "usb-headset".to_string(),
                label: "USB Headset".to_string(),
                is_default: false,
            },
        ])
    }
}

impl FakeMediaDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_devices(devices: Vec<AudioDevice>) -> Self {
        Self {
            devices,
            next_track: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
            playing: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn calls(&self) -> Vec<MediaCall> {
        self.calls.lock().clone()
    }

    /// Peers whose audio is currently attached for playback
    pub fn playing(&self) -> Vec<PeerId> {
        self.playing.lock().iter().cloned().collect()
    }

    fn record(&self, call: MediaCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn list_devices(&self) -> Result<Vec<AudioDevice>> {
        Ok(self.devices.clone())
    }

    async fn open_capture(&self, device_id: Option<&str>) -> Result<LocalAudioTrack> {
        let device = match device_id {
            Some(id) => self.devices.iter().find(|d| d.id == id),
            None => self
                .devices
                .iter()
                .find(|d| d.is_default)
                .or(self.devices.first()),
        }
        .ok_or_else(|| {
            Error::MediaError(format!(
                "no capture device {}",
                device_id.unwrap_or("(default)")
            ))
        })?;

        let n = self.next_track.fetch_add(1, Ordering::Relaxed) + 1;
        let track = LocalAudioTrack::new(
            format!("mic-{}", n),
            device.id.clone(),
            Arc::new(FakeCapture {
                device_id: device.id.clone(),
            }),
        );
        self.record(MediaCall::Open(device.id.clone()));
        Ok(track)
    }

    async fn close_capture(&self, track: &LocalAudioTrack) -> Result<()> {
        self.record(MediaCall::Close(track.id().to_string()));
        Ok(())
    }

    fn set_capture_enabled(&self, track: &LocalAudioTrack, enabled: bool) {
        self.record(MediaCall::CaptureEnabled {
            track_id: track.id().to_string(),
            enabled,
        });
    }

    async fn attach_remote(&self, peer_id: &PeerId, _track: RemoteAudioTrack) -> Result<()> {
        self.playing.lock().insert(peer_id.clone());
        self.record(MediaCall::Attach(peer_id.clone()));
        Ok(())
    }

    async fn detach_remote(&self, peer_id: &PeerId) -> Result<()> {
        self.playing.lock().remove(peer_id);
        self.record(MediaCall::Detach(peer_id.clone()));
        Ok(())
    }

    fn set_playback(&self, volume: f32, deafened: bool) {
        self.record(MediaCall::Playback { volume, deafened });
    }
}
