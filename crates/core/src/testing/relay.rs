//! In-memory relay server
//!
//! Routes signaling between clients over per-link FIFO queues. Link delay
//! and loss are drawn from a seeded RNG so a failing schedule can be
//! reproduced from its seed. Room membership messages are never dropped.

use crate::peer::PeerSessionManager;
use crate::protocol::{PeerId, RelayMessage};
use crate::transport::RelaySink;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Delay and loss applied to signaling on every client-to-client link
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkConditions {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Probability in `0.0..=1.0` that a signaling message is lost
    pub drop_rate: f64,
}

impl LinkConditions {
    /// Immediate, lossless delivery
    pub fn ideal() -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            drop_rate: 0.0,
        }
    }

    /// Lossless with random delay up to `max_delay`
    pub fn jittery(max_delay: Duration) -> Self {
        Self {
            max_delay,
            ..Self::ideal()
        }
    }

    pub fn lossy(max_delay: Duration, drop_rate: f64) -> Self {
        Self {
            max_delay,
            drop_rate,
            ..Self::ideal()
        }
    }
}

impl Default for LinkConditions {
    fn default() -> Self {
        Self::ideal()
    }
}

struct Hub {
    conditions: LinkConditions,
    rng: Mutex<StdRng>,
    inboxes: Mutex<HashMap<PeerId, mpsc::UnboundedSender<RelayMessage>>>,
    unclaimed: Mutex<HashMap<PeerId, mpsc::UnboundedReceiver<RelayMessage>>>,
    links: Mutex<HashMap<(PeerId, PeerId), mpsc::UnboundedSender<(Duration, RelayMessage)>>>,
    rooms: Mutex<HashMap<String, BTreeSet<PeerId>>>,
    sent: Mutex<Vec<(PeerId, RelayMessage)>>,
}

/// In-memory relay server shared by every client of a test
#[derive(Clone)]
pub struct LoopbackRelay {
    hub: Arc<Hub>,
}

impl LoopbackRelay {
    pub fn new(seed: u64, conditions: LinkConditions) -> Self {
        Self {
            hub: Arc::new(Hub {
                conditions,
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
                inboxes: Mutex::new(HashMap::new()),
                unclaimed: Mutex::new(HashMap::new()),
                links: Mutex::new(HashMap::new()),
                rooms: Mutex::new(HashMap::new()),
                sent: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn ideal() -> Self {
        Self::new(0, LinkConditions::ideal())
    }

    /// Connect a client; its inbound messages wait until [`attach`](Self::attach)
    pub fn endpoint(&self, client_id: impl Into<PeerId>) -> Arc<RelayEndpoint> {
        let client_id = client_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.inboxes.lock().insert(client_id.clone(), tx);
        self.hub.unclaimed.lock().insert(client_id.clone(), rx);

        Arc::new(RelayEndpoint {
            client_id,
            hub: self.hub.clone(),
        })
    }

    /// Feed the client's inbound messages to its session manager, in order
    pub fn attach(&self, manager: PeerSessionManager) -> JoinHandle<()> {
        let inbox = self.hub.unclaimed.lock().remove(manager.local_id());

        tokio::spawn(async move {
            let Some(mut inbox) = inbox else {
                return;
            };
            while let Some(message) = inbox.recv().await {
                manager.on_relay_message(message).await;
            }
        })
    }

    /// Remove a client from its rooms and announce the departure
    pub fn disconnect(&self, client_id: &PeerId) {
        self.hub.inboxes.lock().remove(client_id);

        let mut notices = Vec::new();
        for (room_id, members) in self.hub.rooms.lock().iter_mut() {
            if members.remove(client_id) {
                for member in members.iter() {
                    notices.push((
                        member.clone(),
                        RelayMessage::UserLeft {
                            client_id: client_id.clone(),
                            room_id: Some(room_id.clone()),
                        },
                    ));
                }
            }
        }
        for (to, message) in notices {
            self.hub.deliver_now(&to, message);
        }
    }

    /// Every message sent through the relay, with its sender
    pub fn sent(&self) -> Vec<(PeerId, RelayMessage)> {
        self.hub.sent.lock().clone()
    }

    /// Number of messages of `kind` sent from `from` to `to`
    pub fn count(&self, from: &PeerId, to: &PeerId, kind: &str) -> usize {
        self.hub
            .sent
            .lock()
            .iter()
            .filter(|(sender, message)| {
                sender == from && message.kind() == kind && recipient(message) == Some(to)
            })
            .count()
    }
}

fn recipient(message: &RelayMessage) -> Option<&PeerId> {
    match message {
        RelayMessage::Offer { to, .. }
        | RelayMessage::Answer { to, .. }
        | RelayMessage::IceCandidate { to, .. } => Some(to),
        _ => None,
    }
}

fn stamp(message: RelayMessage, sender: &PeerId) -> RelayMessage {
    let from = Some(sender.clone());
    match message {
        RelayMessage::Offer { to, offer, .. } => RelayMessage::Offer { to, from, offer },
        RelayMessage::Answer { to, answer, .. } => RelayMessage::Answer { to, from, answer },
        RelayMessage::IceCandidate { to, candidate, .. } => RelayMessage::IceCandidate {
            to,
            from,
            candidate,
        },
        other => other,
    }
}

impl Hub {
    fn deliver_now(&self, to: &PeerId, message: RelayMessage) {
        if let Some(inbox) = self.inboxes.lock().get(to) {
            let _ = inbox.send(message);
        }
    }

    fn join(&self, client_id: &PeerId, room_id: String) {
        let others: Vec<PeerId> = {
            let mut rooms = self.rooms.lock();
            let members = rooms.entry(room_id.clone()).or_default();
            members.insert(client_id.clone());
            members.iter().filter(|m| *m != client_id).cloned().collect()
        };

        self.deliver_now(
            client_id,
            RelayMessage::RoomUsers {
                users: others.clone(),
                room_id: Some(room_id.clone()),
            },
        );
        for member in others {
            self.deliver_now(
                &member,
                RelayMessage::UserJoined {
                    client_id: client_id.clone(),
                    room_id: Some(room_id.clone()),
                },
            );
        }
    }

    fn forward(&self, from: &PeerId, to: PeerId, message: RelayMessage) {
        let (lost, delay) = {
            let mut rng = self.rng.lock();
            let lost = self.conditions.drop_rate > 0.0 && rng.gen_bool(self.conditions.drop_rate);
            let delay = if self.conditions.max_delay > self.conditions.min_delay {
                rng.gen_range(self.conditions.min_delay..=self.conditions.max_delay)
            } else {
                self.conditions.min_delay
            };
            (lost, delay)
        };

        if lost {
            debug!("Relay lost {} from {} to {}", message.kind(), from, to);
            return;
        }

        let Some(inbox) = self.inboxes.lock().get(&to).cloned() else {
            debug!("Relay has no client {}; dropping {}", to, message.kind());
            return;
        };

        let mut links = self.links.lock();
        let link = links.entry((from.clone(), to)).or_insert_with(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<(Duration, RelayMessage)>();
            tokio::spawn(async move {
                while let Some((delay, message)) = rx.recv().await {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if inbox.send(message).is_err() {
                        break;
                    }
                }
            });
            tx
        });
        let _ = link.send((delay, message));
    }
}

/// One client's connection to the [`LoopbackRelay`]
pub struct RelayEndpoint {
    client_id: PeerId,
    hub: Arc<Hub>,
}

impl RelayEndpoint {
    pub fn client_id(&self) -> &PeerId {
        &self.client_id
    }
}

#[async_trait]
impl RelaySink for RelayEndpoint {
    async fn send(&self, message: RelayMessage) -> Result<()> {
        if !self.hub.inboxes.lock().contains_key(&self.client_id) {
            return Err(Error::RelayError(format!(
                "{} is not connected",
                self.client_id
            )));
        }

        let message = stamp(message, &self.client_id);
        self.hub
            .sent
            .lock()
            .push((self.client_id.clone(), message.clone()));

        match message {
            RelayMessage::JoinRoom { room_id } => self.hub.join(&self.client_id, room_id),
            message => match recipient(&message).cloned() {
                Some(to) => self.hub.forward(&self.client_id, to, message),
                None => debug!("Relay ignores {} from {}", message.kind(), self.client_id),
            },
        }
        Ok(())
    }
}

/// Relay sink that only records what it is given
#[derive(Default)]
pub struct RecordingRelay {
    messages: Mutex<Vec<RelayMessage>>,
}

impl RecordingRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Remove and return everything recorded so far
    pub fn take(&self) -> Vec<RelayMessage> {
        std::mem::take(&mut *self.messages.lock())
    }

    pub fn messages(&self) -> Vec<RelayMessage> {
        self.messages.lock().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.kind() == kind)
            .count()
    }
}

#[async_trait]
impl RelaySink for RecordingRelay {
    async fn send(&self, message: RelayMessage) -> Result<()> {
        self.messages.lock().push(message);
        Ok(())
    }
}
