//! Per-peer queue of candidates that arrived before a remote description

use super::IceCandidate;
use crate::protocol::PeerId;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

/// Ordered candidate queues keyed by peer
///
/// A peer must be registered (its session exists) before candidates for it
/// are kept. Arrival order is the only ordering; duplicates simply append.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queues: HashMap<PeerId, VecDeque<IceCandidate>>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting candidates for `peer_id`
    pub fn register(&mut self, peer_id: &PeerId) {
        self.queues.entry(peer_id.clone()).or_default();
    }

    /// Append a candidate; dropped when the peer has no session
    pub fn enqueue(&mut self, peer_id: &PeerId, candidate: IceCandidate) -> bool {
        match self.queues.get_mut(peer_id) {
            Some(queue) => {
                queue.push_back(candidate);
                debug!(
                    "Buffered candidate for {} ({} pending)",
                    peer_id,
                    queue.len()
                );
                true
            }
            None => {
                warn!("Dropping candidate for {}: no session", peer_id);
                false
            }
        }
    }

    /// Take every buffered candidate in arrival order
    pub fn drain(&mut self, peer_id: &PeerId) -> Vec<IceCandidate> {
        self.queues
            .get_mut(peer_id)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Forget the peer and anything buffered for it
    pub fn discard(&mut self, peer_id: &PeerId) -> usize {
        self.queues.remove(peer_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn len(&self, peer_id: &PeerId) -> usize {
        self.queues.get(peer_id).map(VecDeque::len).unwrap_or(0)
    }

    pub fn is_registered(&self, peer_id: &PeerId) -> bool {
        self.queues.contains_key(peer_id)
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}
