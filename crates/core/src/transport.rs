//! Seams to the peer transport library and the relay channel

use crate::candidate::IceCandidate;
use crate::media::{LocalAudioTrack, RemoteAudioTrack};
use crate::protocol::{PeerId, RelayMessage, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Asynchronous signal from a peer transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Locally gathered candidate to forward to the peer
    LocalCandidate(IceCandidate),
    /// Transport reached its connected state
    Connected,
    /// Connectivity lost but may recover on its own
    Disconnected,
    /// Unrecoverable transport failure
    Failed(String),
    /// Peer audio arrived
    RemoteTrack(RemoteAudioTrack),
}

/// A transport event tagged with the session generation it belongs to
#[derive(Debug, Clone)]
pub struct TransportNotice {
    pub peer_id: PeerId,
    pub epoch: u64,
    pub event: TransportEvent,
}

/// Channel handed to each transport for reporting its events
///
/// Events carry the generation of the session that created the transport,
/// so events from a replaced transport are recognised as stale.
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    peer_id: PeerId,
    epoch: u64,
    tx: mpsc::UnboundedSender<TransportNotice>,
}

impl TransportEventSink {
    pub fn new(peer_id: PeerId, epoch: u64, tx: mpsc::UnboundedSender<TransportNotice>) -> Self {
        Self { peer_id, epoch, tx }
    }

    /// Standalone sink and its receiving end
    pub fn channel(peer_id: PeerId) -> (Self, mpsc::UnboundedReceiver<TransportNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(peer_id, 0, tx), rx)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Report an event; false once the session manager is gone
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TransportNotice {
                peer_id: self.peer_id.clone(),
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// One direct peer connection (exactly one per live session)
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer and apply it as the local description
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Only valid once the remote description is set
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Swap the outgoing audio without renegotiating (`None` sends nothing)
    async fn replace_audio_track(&self, track: Option<&LocalAudioTrack>) -> Result<()>;

    /// Release the connection; calling it again is a no-op
    async fn close(&self) -> Result<()>;
}

/// Builds peer transports for new sessions
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &PeerId,
        local_track: Option<LocalAudioTrack>,
        events: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>>;
}

/// Outbound half of the relay channel
#[async_trait]
pub trait RelaySink: Send + Sync {
    async fn send(&self, message: RelayMessage) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_tags_events() {
        let (sink, mut rx) = TransportEventSink::channel(PeerId::from("bob"));
        assert!(sink.emit(TransportEvent::Connected));

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.peer_id.as_str(), "bob");
        assert_eq!(notice.epoch, 0);
        assert!(matches!(notice.event, TransportEvent::Connected));
    }

    #[tokio::test]
    async fn test_sink_reports_closed_channel() {
        let (sink, rx) = TransportEventSink::channel(PeerId::from("bob"));
        drop(rx);
        assert!(!sink.emit(TransportEvent::Disconnected));
    }
}
