//! Session lifecycle events delivered to subscribers

use crate::peer::SessionState;
use crate::protocol::PeerId;

/// Lifecycle notification from the session manager
///
/// Delivered over a broadcast channel; multiple subscribers each receive
/// every event, in no particular order relative to one another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Audio path to the peer is established
    PeerConnected(PeerId),
    /// A previously connected peer is no longer reachable
    PeerDisconnected(PeerId),
    /// Retries exhausted; no further attempts until the peer is announced again
    ConnectionFailed(PeerId),
    /// Every state change of a session
    StateChanged {
        peer_id: PeerId,
        from: SessionState,
        to: SessionState,
    },
}

impl SessionEvent {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            SessionEvent::PeerConnected(peer_id)
            | SessionEvent::PeerDisconnected(peer_id)
            | SessionEvent::ConnectionFailed(peer_id) => peer_id,
            SessionEvent::StateChanged { peer_id, .. } => peer_id,
        }
    }

    /// True for the three lifecycle events (not state changes)
    pub fn is_lifecycle(&self) -> bool {
        !matches!(self, SessionEvent::StateChanged { .. })
    }
}
