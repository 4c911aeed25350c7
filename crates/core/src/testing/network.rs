//! In-memory peer transport
//!
//! Each transport writes its own id into the `o=` line of the descriptions
//! it creates. Two transports connect once an answer is applied to the
//! offerer and the answerer holds that same offer as its remote description.

use crate::candidate::IceCandidate;
use crate::media::{LocalAudioTrack, RemoteAudioTrack};
use crate::protocol::{PeerId, SdpType, SessionDescription};
use crate::transport::{PeerTransport, TransportEvent, TransportEventSink, TransportFactory};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Marker carried by remote tracks produced by the loopback network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackAudio {
    /// Transport the audio was sent from
    pub source: u64,
}

struct Endpoint {
    owner: PeerId,
    peer: PeerId,
    sink: TransportEventSink,
    local: Option<SdpType>,
    remote: Option<(SdpType, u64)>,
    track: Option<String>,
    candidates_received: usize,
    connected: bool,
    closed: bool,
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    endpoints: HashMap<u64, Endpoint>,
    refused: HashSet<PeerId>,
}

/// Shared medium for every loopback transport in a test
#[derive(Default)]
pub struct LoopbackNetwork {
    state: Mutex<NetworkState>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport factory for the participant `owner`
    pub fn factory(self: &Arc<Self>, owner: impl Into<PeerId>) -> Arc<LoopbackTransportFactory> {
        Arc::new(LoopbackTransportFactory {
            owner: owner.into(),
            network: self.clone(),
        })
    }

    /// Make transport creation fail for `owner`
    pub fn refuse_transports(&self, owner: &PeerId, refuse: bool) {
        let mut state = self.state.lock();
        if refuse {
            state.refused.insert(owner.clone());
        } else {
            state.refused.remove(owner);
        }
    }

    /// Transports ever created by `owner` towards `peer`
    pub fn created(&self, owner: &PeerId, peer: &PeerId) -> usize {
        self.state
            .lock()
            .endpoints
            .values()
            .filter(|e| e.owner == *owner && e.peer == *peer)
            .count()
    }

    /// Transports of `owner` not yet closed
    pub fn open_transports(&self, owner: &PeerId) -> usize {
        self.state
            .lock()
            .endpoints
            .values()
            .filter(|e| e.owner == *owner && !e.closed)
            .count()
    }

    /// Outgoing track on the newest open transport from `owner` to `peer`
    pub fn sending_track(&self, owner: &PeerId, peer: &PeerId) -> Option<String> {
        let state = self.state.lock();
        state
            .endpoints
            .iter()
            .filter(|(_, e)| e.owner == *owner && e.peer == *peer && !e.closed)
            .max_by_key(|(id, _)| **id)
            .and_then(|(_, e)| e.track.clone())
    }

    /// Remote candidates applied to the newest transport from `owner` to `peer`
    pub fn candidates_received(&self, owner: &PeerId, peer: &PeerId) -> usize {
        let state = self.state.lock();
        state
            .endpoints
            .iter()
            .filter(|(_, e)| e.owner == *owner && e.peer == *peer)
            .max_by_key(|(id, _)| **id)
            .map(|(_, e)| e.candidates_received)
            .unwrap_or(0)
    }

    fn register(
        &self,
        owner: &PeerId,
        peer: &PeerId,
        track: Option<&LocalAudioTrack>,
        sink: TransportEventSink,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        if state.refused.contains(owner) {
            return Err(Error::PeerConnectionError(format!(
                "transport creation refused for {}",
                owner
            )));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.endpoints.insert(
            id,
            Endpoint {
                owner: owner.clone(),
                peer: peer.clone(),
                sink,
                local: None,
                remote: None,
                track: track.map(|t| t.id().to_string()),
                candidates_received: 0,
                connected: false,
                closed: false,
            },
        );
        Ok(id)
    }
}

fn describe(kind: SdpType, id: u64, owner: &PeerId) -> SessionDescription {
    let sdp = format!(
        "v=0\r\no=- {id} 1 IN IP4 127.0.0.1\r\ns=loopback {owner}\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\n"
    );
    SessionDescription { sdp_type: kind, sdp }
}

fn origin_of(description: &SessionDescription) -> Result<u64> {
    description
        .sdp
        .lines()
        .find_map(|line| line.strip_prefix("o="))
        .and_then(|origin| origin.split_whitespace().nth(1))
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| Error::SdpError("missing loopback origin".to_string()))
}

fn local_candidates(id: u64) -> [IceCandidate; 2] {
    let octet = (id % 250) + 2;
    [
        IceCandidate::new(format!(
            "candidate:{id}1 1 udp 2122260223 192.168.50.{octet} {} typ host generation 0",
            50000 + id
        )),
        IceCandidate::new(format!(
            "candidate:{id}2 1 udp 41885439 198.51.100.{octet} 3478 typ relay raddr 0.0.0.0 rport 0"
        )),
    ]
}

/// Creates [`LoopbackTransport`]s for one participant
pub struct LoopbackTransportFactory {
    owner: PeerId,
    network: Arc<LoopbackNetwork>,
}

#[async_trait]
impl TransportFactory for LoopbackTransportFactory {
    async fn create(
        &self,
        peer_id: &PeerId,
        local_track: Option<LocalAudioTrack>,
        events: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>> {
        let id = self
            .network
            .register(&self.owner, peer_id, local_track.as_ref(), events)?;
        Ok(Box::new(LoopbackTransport {
            id,
            network: self.network.clone(),
        }))
    }
}

/// One end of a simulated peer connection
pub struct LoopbackTransport {
    id: u64,
    network: Arc<LoopbackNetwork>,
}

impl LoopbackTransport {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn create_description(&self, kind: SdpType) -> Result<SessionDescription> {
        let (description, sink) = {
            let mut state = self.network.state.lock();
            let endpoint = live_endpoint(&mut state, self.id)?;

            if kind == SdpType::Answer && !matches!(endpoint.remote, Some((SdpType::Offer, _))) {
                return Err(Error::SdpError(
                    "cannot answer without a remote offer".to_string(),
                ));
            }

            endpoint.local = Some(kind);
            (
                describe(kind, self.id, &endpoint.owner),
                endpoint.sink.clone(),
            )
        };

        for candidate in local_candidates(self.id) {
            sink.emit(TransportEvent::LocalCandidate(candidate));
        }
        Ok(description)
    }
}

fn live_endpoint(state: &mut NetworkState, id: u64) -> Result<&mut Endpoint> {
    match state.endpoints.get_mut(&id) {
        Some(endpoint) if !endpoint.closed => Ok(endpoint),
        _ => Err(Error::PeerConnectionError(format!(
            "loopback transport {} is closed",
            id
        ))),
    }
}

fn connect(state: &mut NetworkState, offerer: u64, answerer: u64) {
    for (id, other) in [(offerer, answerer), (answerer, offerer)] {
        if let Some(endpoint) = state.endpoints.get_mut(&id) {
            endpoint.connected = true;
            endpoint.sink.emit(TransportEvent::Connected);
            endpoint.sink.emit(TransportEvent::RemoteTrack(RemoteAudioTrack::new(
                format!("loopback-audio-{}", other),
                Arc::new(LoopbackAudio { source: other }),
            )));
        }
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.create_description(SdpType::Offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.create_description(SdpType::Answer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let origin = origin_of(&description)?;
        let mut state = self.network.state.lock();
        let endpoint = live_endpoint(&mut state, self.id)?;

        if description.sdp_type == SdpType::Answer && endpoint.local != Some(SdpType::Offer) {
            return Err(Error::SdpError(
                "answer applied without a local offer".to_string(),
            ));
        }
        endpoint.remote = Some((description.sdp_type, origin));

        if description.sdp_type == SdpType::Offer {
            return Ok(());
        }

        let mutual = state.endpoints.get(&origin).is_some_and(|answerer| {
            !answerer.closed
                && answerer.local == Some(SdpType::Answer)
                && answerer.remote == Some((SdpType::Offer, self.id))
        });

        if mutual {
            connect(&mut state, self.id, origin);
        } else if let Some(endpoint) = state.endpoints.get(&self.id) {
            endpoint.sink.emit(TransportEvent::Failed(
                "answer does not match a live offer".to_string(),
            ));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        let mut state = self.network.state.lock();
        let endpoint = live_endpoint(&mut state, self.id)?;
        if endpoint.remote.is_none() {
            return Err(Error::IceCandidateError(
                "remote description not set".to_string(),
            ));
        }
        endpoint.candidates_received += 1;
        Ok(())
    }

    async fn replace_audio_track(&self, track: Option<&LocalAudioTrack>) -> Result<()> {
        let mut state = self.network.state.lock();
        let endpoint = live_endpoint(&mut state, self.id)?;
        endpoint.track = track.map(|t| t.id().to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.network.state.lock();
        let Some(endpoint) = state.endpoints.get_mut(&self.id) else {
            return Ok(());
        };
        if endpoint.closed {
            return Ok(());
        }

        endpoint.closed = true;
        let counterpart = match (endpoint.connected, endpoint.remote) {
            (true, Some((_, origin))) => Some(origin),
            _ => None,
        };
        endpoint.connected = false;

        if let Some(other) = counterpart.and_then(|id| state.endpoints.get_mut(&id)) {
            if other.connected && !other.closed {
                other.connected = false;
                other
                    .sink
                    .emit(TransportEvent::Failed("peer closed the connection".to_string()));
            }
        }
        Ok(())
    }
}
