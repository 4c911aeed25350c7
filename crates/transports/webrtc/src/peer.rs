//! One webrtc-rs peer connection per session

use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use voicemesh_core::protocol::SdpType;
use voicemesh_core::{
    IceCandidate, LocalAudioTrack, PeerId, PeerTransport, RemoteAudioTrack, SessionDescription,
    TransportEvent, TransportEventSink,
};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Map a peer connection state onto the session's transport signals
///
/// `Disconnected` may recover on its own; `Failed` never does. Intermediate
/// states carry no signal.
pub fn transport_event_for(state: RTCPeerConnectionState) -> Option<TransportEvent> {
    match state {
        RTCPeerConnectionState::Connected => Some(TransportEvent::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportEvent::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportEvent::Failed(
            "peer connection failed".to_string(),
        )),
        _ => None,
    }
}

/// Candidate in the core's wire shape
pub fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: candidate.username_fragment,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(voicemesh_core::Error::SdpError(
                "rollback descriptions are not supported".to_string(),
            )
            .into())
        }
    };
    parsed.map_err(|e| voicemesh_core::Error::SdpError(format!("Failed to parse SDP: {}", e)).into())
}

/// Concrete sample track behind a capture handle
fn sample_track(track: &LocalAudioTrack) -> Result<Arc<TrackLocalStaticSample>> {
    track.downcast::<TrackLocalStaticSample>().ok_or_else(|| {
        Error::MediaTrackError(format!("track {} is not a webrtc sample track", track.id()))
    })
}

/// Peer transport over a single `RTCPeerConnection`
pub struct WebRtcPeerTransport {
    peer_id: PeerId,
    peer_connection: Arc<RTCPeerConnection>,
    audio_sender: Arc<RTCRtpSender>,
    closed: AtomicBool,
}

impl WebRtcPeerTransport {
    /// Add the audio sender and wire connection callbacks into `events`
    pub(crate) async fn attach(
        peer_id: PeerId,
        peer_connection: Arc<RTCPeerConnection>,
        local_track: Option<LocalAudioTrack>,
        events: TransportEventSink,
    ) -> Result<Self> {
        let audio_sender = match local_track {
            Some(track) => {
                let sample = sample_track(&track)?;
                debug!("Sending local track {} to {}", track.id(), peer_id);
                peer_connection
                    .add_track(sample as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(|e| {
                        Error::MediaTrackError(format!("Failed to add audio track: {}", e))
                    })?
            }
            None => {
                let transceiver = peer_connection
                    .add_transceiver_from_kind(RTPCodecType::Audio, None)
                    .await
                    .map_err(|e| {
                        Error::MediaTrackError(format!("Failed to add audio transceiver: {}", e))
                    })?;
                transceiver.sender().await
            }
        };

        let sink = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete for peer {}", sink.peer_id());
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(TransportEvent::LocalCandidate(from_candidate_init(init)));
                    }
                    Err(e) => warn!("Failed to convert ICE candidate to JSON: {}", e),
                }
            })
        }));

        let sink = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    info!("Connection state change for peer {}: {}", sink.peer_id(), state);
                    if let Some(event) = transport_event_for(state) {
                        sink.emit(event);
                    }
                })
            },
        ));

        let sink = events;
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sink = sink.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    info!("Ignoring non-audio track from peer {}", sink.peer_id());
                    return;
                }
                info!("Remote audio track from peer {}", sink.peer_id());
                let id = track.id();
                sink.emit(TransportEvent::RemoteTrack(RemoteAudioTrack::new(id, track)));
            })
        }));

        Ok(Self {
            peer_id,
            peer_connection,
            audio_sender,
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn local_description(&self, what: &str) -> Result<String> {
        let local = self.peer_connection.local_description().await.ok_or_else(|| {
            voicemesh_core::Error::SdpError(format!("No local description after setting {}", what))
        })?;
        Ok(local.sdp)
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn create_offer(&self) -> voicemesh_core::Result<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await.map_err(|e| {
            voicemesh_core::Error::SdpError(format!("Failed to create offer: {}", e))
        })?;
        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| {
                voicemesh_core::Error::SdpError(format!("Failed to set local description: {}", e))
            })?;

        let sdp = self.local_description("offer").await?;
        debug!("Created SDP offer for peer {}", self.peer_id);
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> voicemesh_core::Result<SessionDescription> {
        let answer = self.peer_connection.create_answer(None).await.map_err(|e| {
            voicemesh_core::Error::SdpError(format!("Failed to create answer: {}", e))
        })?;
        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| {
                voicemesh_core::Error::SdpError(format!("Failed to set local description: {}", e))
            })?;

        let sdp = self.local_description("answer").await?;
        debug!("Created SDP answer for peer {}", self.peer_id);
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> voicemesh_core::Result<()> {
        debug!("Setting remote description for peer {}", self.peer_id);
        let description = to_rtc_description(description)?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| {
                voicemesh_core::Error::SdpError(format!("Failed to set remote description: {}", e))
            })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> voicemesh_core::Result<()> {
        debug!("Adding ICE candidate for peer {}: {}", self.peer_id, candidate.candidate);
        self.peer_connection
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .map_err(|e| {
                voicemesh_core::Error::IceCandidateError(format!(
                    "Failed to add ICE candidate: {}",
                    e
                ))
            })
    }

    async fn replace_audio_track(
        &self,
        track: Option<&LocalAudioTrack>,
    ) -> voicemesh_core::Result<()> {
        let replacement = match track {
            Some(track) => {
                debug!("Replacing audio for peer {} with {}", self.peer_id, track.id());
                Some(sample_track(track)? as Arc<dyn TrackLocal + Send + Sync>)
            }
            None => None,
        };

        self.audio_sender
            .replace_track(replacement)
            .await
            .map_err(|e| {
                voicemesh_core::Error::MediaError(format!("Failed to replace audio track: {}", e))
            })
    }

    async fn close(&self) -> voicemesh_core::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Closing peer connection for peer {}", self.peer_id);
        self.peer_connection.close().await.map_err(|e| {
            voicemesh_core::Error::PeerConnectionError(format!(
                "Failed to close connection: {}",
                e
            ))
        })
    }
}
