//! Null audio devices
//!
//! Capture produces an Opus track fed with 20 ms silence frames, and
//! remote tracks are drained without playback. OS audio I/O plugs in by
//! providing another [`MediaDevices`] implementation.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};
use voicemesh_core::{
    AudioDevice, Error, LocalAudioTrack, MediaDevices, PeerId, RemoteAudioTrack, Result,
};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

pub const DEFAULT_DEVICE_ID: &str = "default";

/// Duration of one Opus frame
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Opus TOC byte plus payload that decodes to 20 ms of silence
const OPUS_SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Opus sample track as negotiated by the default media engine
pub fn opus_track(track_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        track_id.to_string(),
        "voicemesh".to_string(),
    ))
}

struct CaptureHandle {
    enabled: Arc<AtomicBool>,
    writer: JoinHandle<()>,
}

struct PlaybackHandle {
    packets: Arc<AtomicU64>,
    reader: JoinHandle<()>,
}

struct DeviceState {
    captures: HashMap<String, CaptureHandle>,
    playback: HashMap<PeerId, PlaybackHandle>,
    volume: f32,
    deafened: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            captures: HashMap::new(),
            playback: HashMap::new(),
            volume: 1.0,
            deafened: false,
        }
    }
}

/// Silence capture and draining playback
#[derive(Default)]
pub struct NullCaptureDevices {
    state: Mutex<DeviceState>,
}

impl NullCaptureDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_captures(&self) -> usize {
        self.state.lock().captures.len()
    }

    /// RTP packets received from a peer since its track was attached
    pub fn packets_received(&self, peer_id: &PeerId) -> Option<u64> {
        self.state
            .lock()
            .playback
            .get(peer_id)
            .map(|p| p.packets.load(Ordering::Relaxed))
    }

    pub fn playback(&self) -> (f32, bool) {
        let state = self.state.lock();
        (state.volume, state.deafened)
    }
}

async fn write_silence(track: Arc<TrackLocalStaticSample>, enabled: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval(FRAME_DURATION);
    loop {
        ticker.tick().await;
        if !enabled.load(Ordering::Relaxed) {
            continue;
        }

        let sample = Sample {
            data: Bytes::from_static(&OPUS_SILENCE_FRAME),
            duration: FRAME_DURATION,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            trace!("Silence write failed: {}", e);
        }
    }
}

async fn drain_remote(peer_id: PeerId, track: Arc<TrackRemote>, packets: Arc<AtomicU64>) {
    loop {
        match track.read_rtp().await {
            Ok(_) => {
                packets.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                debug!("RTP read ended for peer {}: {}", peer_id, e);
                break;
            }
        }
    }
}

#[async_trait]
impl MediaDevices for NullCaptureDevices {
    async fn list_devices(&self) -> Result<Vec<AudioDevice>> {
        Ok(vec![AudioDevice {
            id: DEFAULT_DEVICE_ID.to_string(),
            label: "Silence generator".to_string(),
            is_default: true,
        }])
    }

    async fn open_capture(&self, device_id: Option<&str>) -> Result<LocalAudioTrack> {
        let device_id = device_id.unwrap_or(DEFAULT_DEVICE_ID);
        if device_id != DEFAULT_DEVICE_ID {
            return Err(Error::MediaError(format!("unknown audio device {}", device_id)));
        }

        let track_id = format!("audio-{}", uuid::Uuid::new_v4());
        let track = opus_track(&track_id);
        let enabled = Arc::new(AtomicBool::new(true));
        let writer = tokio::spawn(write_silence(Arc::clone(&track), Arc::clone(&enabled)));

        info!("Opened silence capture {} on device {}", track_id, device_id);
        self.state
            .lock()
            .captures
            .insert(track_id.clone(), CaptureHandle { enabled, writer });

        Ok(LocalAudioTrack::new(track_id, device_id, track))
    }

    async fn close_capture(&self, track: &LocalAudioTrack) -> Result<()> {
        if let Some(capture) = self.state.lock().captures.remove(track.id()) {
            capture.writer.abort();
            info!("Closed capture {}", track.id());
        }
        Ok(())
    }

    fn set_capture_enabled(&self, track: &LocalAudioTrack, enabled: bool) {
        if let Some(capture) = self.state.lock().captures.get(track.id()) {
            capture.enabled.store(enabled, Ordering::Relaxed);
        }
    }

    async fn attach_remote(&self, peer_id: &PeerId, track: RemoteAudioTrack) -> Result<()> {
        let remote = track.downcast::<TrackRemote>().ok_or_else(|| {
            Error::MediaError(format!("track {} is not a webrtc remote track", track.id()))
        })?;

        let packets = Arc::new(AtomicU64::new(0));
        let reader = tokio::spawn(drain_remote(peer_id.clone(), remote, Arc::clone(&packets)));

        info!("Attached remote audio from peer {}", peer_id);
        if let Some(previous) = self
            .state
            .lock()
            .playback
            .insert(peer_id.clone(), PlaybackHandle { packets, reader })
        {
            previous.reader.abort();
        }
        Ok(())
    }

    async fn detach_remote(&self, peer_id: &PeerId) -> Result<()> {
        if let Some(playback) = self.state.lock().playback.remove(peer_id) {
            playback.reader.abort();
            info!("Detached remote audio from peer {}", peer_id);
        }
        Ok(())
    }

    fn set_playback(&self, volume: f32, deafened: bool) {
        let mut state = self.state.lock();
        state.volume = volume;
        state.deafened = deafened;
    }
}

impl Drop for NullCaptureDevices {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (_, capture) in state.captures.drain() {
            capture.writer.abort();
        }
        for (_, playback) in state.playback.drain() {
            playback.reader.abort();
        }
    }
}
