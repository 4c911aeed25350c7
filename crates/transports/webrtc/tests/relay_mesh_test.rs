//! Session managers connected through a real WebSocket relay
//!
//! A minimal in-process relay server routes addressed messages and room
//! membership the way the production relay does. Peer transports are the
//! core's in-memory loopback, so only the relay client is under test here.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use voicemesh_core::testing::{FakeMediaDevices, LoopbackNetwork};
use voicemesh_core::{
    PeerId, PeerSessionManager, RelayConfig, RelayMessage, SessionEvent, SessionState,
};
use voicemesh_webrtc::{RelayClient, RelayEvent};

const ROOM: &str = "standup";

#[derive(Default)]
struct RelayState {
    clients: HashMap<PeerId, mpsc::UnboundedSender<Message>>,
    rooms: HashMap<String, Vec<PeerId>>,
    /// Closes a client's socket from the server side
    kicks: HashMap<PeerId, mpsc::UnboundedSender<()>>,
}

impl RelayState {
    fn send(&self, to: &PeerId, message: &RelayMessage) {
        if let (Some(tx), Ok(text)) = (self.clients.get(to), message.to_json()) {
            let _ = tx.send(Message::Text(text));
        }
    }

    fn join(&mut self, client: &PeerId, room_id: &str) {
        let members = self.rooms.entry(room_id.to_string()).or_default();
        if !members.contains(client) {
            members.push(client.clone());
        }
        let members = members.clone();

        self.send(
            client,
            &RelayMessage::RoomUsers {
                users: members.clone(),
                room_id: Some(room_id.to_string()),
            },
        );
        for other in members.iter().filter(|m| *m != client) {
            self.send(
                other,
                &RelayMessage::UserJoined {
                    client_id: client.clone(),
                    room_id: Some(room_id.to_string()),
                },
            );
        }
    }

    fn leave(&mut self, client: &PeerId) {
        self.clients.remove(client);
        self.kicks.remove(client);
        let mut notify = Vec::new();
        for (room_id, members) in self.rooms.iter_mut() {
            if let Some(pos) = members.iter().position(|m| m == client) {
                members.remove(pos);
                notify.extend(members.iter().map(|m| (m.clone(), room_id.clone())));
            }
        }
        for (member, room_id) in notify {
            self.send(
                &member,
                &RelayMessage::UserLeft {
                    client_id: client.clone(),
                    room_id: Some(room_id),
                },
            );
        }
    }

    /// Stamp `from` and deliver to the addressee
    fn forward(&self, from: &PeerId, message: RelayMessage) {
        let (to, stamped) = match message {
            RelayMessage::Offer { to, offer, .. } => (
                to.clone(),
                RelayMessage::Offer {
                    to,
                    from: Some(from.clone()),
                    offer,
                },
            ),
            RelayMessage::Answer { to, answer, .. } => (
                to.clone(),
                RelayMessage::Answer {
                    to,
                    from: Some(from.clone()),
                    answer,
                },
            ),
            RelayMessage::IceCandidate { to, candidate, .. } => (
                to.clone(),
                RelayMessage::IceCandidate {
                    to,
                    from: Some(from.clone()),
                    candidate,
                },
            ),
            _ => return,
        };
        self.send(&to, &stamped);
    }
}

/// Relay server on an ephemeral port; returns its `ws://` base URL
async fn spawn_relay() -> (String, Arc<Mutex<RelayState>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let state = Arc::new(Mutex::new(RelayState::default()));

    let shared = Arc::clone(&state);
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            tokio::spawn(serve_client(tcp, Arc::clone(&shared)));
        }
    });
    (url, state)
}

async fn serve_client(tcp: TcpStream, state: Arc<Mutex<RelayState>>) {
    let mut path = String::new();
    let Ok(ws) = accept_hdr_async(tcp, |req: &Request, resp: Response| {
        path = req.uri().path().to_string();
        Ok(resp)
    })
    .await
    else {
        return;
    };
    let client = PeerId::from(path.rsplit('/').next().unwrap_or_default());

    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (kick_tx, mut kick_rx) = mpsc::unbounded_channel();
    {
        let mut state = state.lock();
        state.clients.insert(client.clone(), tx);
        state.kicks.insert(client.clone(), kick_tx);
    }

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if write.send(message).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    loop {
        tokio::select! {
            _ = kick_rx.recv() => break,
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                    _ => break,
                };
                let Ok(message) = RelayMessage::from_json(&text) else {
                    continue;
                };
                let mut relay = state.lock();
                match message {
                    RelayMessage::JoinRoom { room_id } => relay.join(&client, &room_id),
                    RelayMessage::Ping => {
                        if let Some(tx) = relay.clients.get(&client) {
                            let _ = tx.send(Message::Text(r#"{"type":"pong"}"#.to_string()));
                        }
                    }
                    other => relay.forward(&client, other),
                }
            }
        }
    }

    state.lock().leave(&client);
    writer.abort();
}

struct Client {
    id: PeerId,
    manager: PeerSessionManager,
    relay: Arc<RelayClient>,
    events: broadcast::Receiver<SessionEvent>,
}

/// Session manager fed by a relay client, re-joining the room on every connect
async fn client(url: &str, id: &str, network: &Arc<LoopbackNetwork>) -> Client {
    let config = RelayConfig {
        server_url: url.to_string(),
        reconnect_attempts: 5,
        reconnect_delay_ms: 50,
        heartbeat_interval_ms: 30_000,
    };
    let (relay, mut relay_events) = RelayClient::connect(config, id).await.unwrap();

    let manager = PeerSessionManager::builder(
        PeerId::from(id),
        network.factory(id),
        relay.clone(),
        FakeMediaDevices::new(),
    )
    .build()
    .unwrap();
    let events = manager.subscribe();
    manager.start_capture(None).await.unwrap();

    let pump_manager = manager.clone();
    let pump_relay = Arc::clone(&relay);
    tokio::spawn(async move {
        while let Some(event) = relay_events.recv().await {
            match event {
                RelayEvent::Connected => {
                    let _ = pump_relay.enqueue(RelayMessage::JoinRoom {
                        room_id: ROOM.to_string(),
                    });
                }
                RelayEvent::Message(message) => pump_manager.on_relay_message(message).await,
                RelayEvent::Disconnected => {}
                RelayEvent::GaveUp => break,
            }
        }
    });

    Client {
        id: PeerId::from(id),
        manager,
        relay,
        events,
    }
}

async fn wait_for(events: &mut broadcast::Receiver<SessionEvent>, wanted: &SessionEvent) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if event == *wanted => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {:?}", wanted));
}

#[tokio::test]
async fn test_two_clients_connect_through_websocket_relay() {
    let (url, _state) = spawn_relay().await;
    let network = LoopbackNetwork::new();

    let mut alice = client(&url, "alice", &network).await;
    let mut bob = client(&url, "bob", &network).await;

    wait_for(&mut alice.events, &SessionEvent::PeerConnected(bob.id.clone())).await;
    wait_for(&mut bob.events, &SessionEvent::PeerConnected(alice.id.clone())).await;

    assert_eq!(
        alice.manager.session_state(&bob.id).await,
        Some(SessionState::Connected)
    );
    assert_eq!(
        bob.manager.session_state(&alice.id).await,
        Some(SessionState::Connected)
    );

    alice.relay.disconnect();
    bob.relay.disconnect();
}

#[tokio::test]
async fn test_departure_over_relay_tears_down_session() {
    let (url, _state) = spawn_relay().await;
    let network = LoopbackNetwork::new();

    let mut alice = client(&url, "alice", &network).await;
    let bob = client(&url, "bob", &network).await;
    wait_for(&mut alice.events, &SessionEvent::PeerConnected(bob.id.clone())).await;

    bob.relay.disconnect();
    wait_for(&mut alice.events, &SessionEvent::PeerDisconnected(bob.id.clone())).await;
    assert!(!alice.manager.has_session(&bob.id));

    alice.relay.disconnect();
}

#[tokio::test]
async fn test_relay_reconnect_rejoins_room() {
    let (url, state) = spawn_relay().await;
    let network = LoopbackNetwork::new();

    let mut alice = client(&url, "alice", &network).await;
    let bob = client(&url, "bob", &network).await;
    wait_for(&mut alice.events, &SessionEvent::PeerConnected(bob.id.clone())).await;

    // Server drops alice; bob sees her leave, then she reconnects and rejoins
    let mut bob_events = bob.manager.subscribe();
    let kick = state.lock().kicks.get(&alice.id).cloned().unwrap();
    kick.send(()).unwrap();

    wait_for(&mut bob_events, &SessionEvent::PeerConnected(alice.id.clone())).await;
    assert!(alice.relay.is_connected());
    assert!(state.lock().rooms[ROOM].contains(&alice.id));

    alice.relay.disconnect();
    bob.relay.disconnect();
}
