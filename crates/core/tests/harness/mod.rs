//! Multi-participant harness over the in-memory relay and network
//!
//! Each participant gets its own session manager, fake audio devices and
//! relay connection. Lifecycle events are recorded in the background so
//! tests can assert on exact counts after the mesh settles.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use voicemesh_core::testing::{
    FakeMediaDevices, LinkConditions, LoopbackNetwork, LoopbackRelay, RelayEndpoint,
};
use voicemesh_core::{
    PeerId, PeerSessionManager, RelayMessage, RelaySink, SessionConfig, SessionEvent,
    SessionState,
};

pub const ROOM: &str = "standup";

/// Initialize tracing for tests (safe to call repeatedly)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn,voicemesh_core=info")
        .with_test_writer()
        .try_init();
}

pub struct Participant {
    pub id: PeerId,
    pub manager: PeerSessionManager,
    pub media: Arc<FakeMediaDevices>,
    pub relay: Arc<RelayEndpoint>,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl Participant {
    /// Lifecycle events observed so far
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: &SessionEvent) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    pub async fn join(&self, room: &str) {
        self.relay
            .send(RelayMessage::JoinRoom {
                room_id: room.to_string(),
            })
            .await
            .unwrap();
    }

    pub async fn state_with(&self, peer: &PeerId) -> Option<SessionState> {
        self.manager.session_state(peer).await
    }
}

pub struct MeshHarness {
    pub relay: LoopbackRelay,
    pub network: Arc<LoopbackNetwork>,
    config: SessionConfig,
    participants: Vec<Participant>,
}

impl MeshHarness {
    pub fn new(seed: u64, conditions: LinkConditions) -> Self {
        init_test_tracing();
        Self {
            relay: LoopbackRelay::new(seed, conditions),
            network: LoopbackNetwork::new(),
            config: SessionConfig::default(),
            participants: Vec::new(),
        }
    }

    pub fn ideal() -> Self {
        Self::new(0, LinkConditions::ideal())
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Create a participant wired to the relay and network
    pub fn add(&mut self, id: &str) -> &Participant {
        let peer_id = PeerId::from(id);
        let media = FakeMediaDevices::new();
        let relay = self.relay.endpoint(peer_id.clone());

        let manager = PeerSessionManager::builder(
            peer_id.clone(),
            self.network.factory(peer_id.clone()),
            relay.clone(),
            media.clone(),
        )
        .config(self.config.clone())
        .build()
        .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        let mut rx = manager.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.is_lifecycle() => recorded.lock().push(event),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        self.relay.attach(manager.clone());
        self.participants.push(Participant {
            id: peer_id,
            manager,
            media,
            relay,
            events,
        });
        self.participants.last().unwrap()
    }

    pub fn get(&self, id: &str) -> &Participant {
        self.participants
            .iter()
            .find(|p| p.id.as_str() == id)
            .unwrap()
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// Start capture and join the shared room, in the given order
    pub async fn join_all(&self, ids: &[&str]) {
        for id in ids {
            let participant = self.get(id);
            participant.manager.start_capture(None).await.unwrap();
            participant.join(ROOM).await;
        }
    }

    /// Let (virtual) time pass so in-flight negotiation completes
    pub async fn settle(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Both directions of every pair report `Connected`
    pub async fn assert_full_mesh(&self) {
        for a in &self.participants {
            for b in &self.participants {
                if a.id == b.id {
                    continue;
                }
                assert_eq!(
                    a.state_with(&b.id).await,
                    Some(SessionState::Connected),
                    "{} -> {}",
                    a.id,
                    b.id
                );
            }
        }
    }
}
