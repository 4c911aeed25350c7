//! WebSocket client for the relay channel
//!
//! Connects to `{serverUrl}/{identity}` and exchanges JSON text frames.
//! Outbound messages go through an unbounded queue, so `send` never blocks;
//! while the socket is down they stay queued and are flushed in order once a
//! reconnect succeeds. Inbound frames and connection changes are delivered as
//! [`RelayEvent`]s on a single channel, in arrival order.

use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use voicemesh_core::{RelayConfig, RelayMessage, RelaySink};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;

/// Notification from the relay client
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Socket (re)established; the room must be joined again
    Connected,
    /// Socket lost; reconnection is in progress
    Disconnected,
    /// Inbound message for the session manager
    Message(RelayMessage),
    /// Every reconnect attempt failed; the client has stopped
    GaveUp,
}

/// Why a connected phase ended
enum SessionEnd {
    Lost,
    Shutdown,
}

/// Relay channel client
pub struct RelayClient {
    endpoint: String,
    outbound: mpsc::UnboundedSender<RelayMessage>,
    connected: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl RelayClient {
    /// Connect as `identity` and start the background connection task
    ///
    /// The first connection attempt is made before returning; later drops are
    /// handled by the reconnect loop.
    pub async fn connect(
        config: RelayConfig,
        identity: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<RelayEvent>)> {
        config.validate()?;
        let endpoint = config.endpoint_for(identity);

        info!("Connecting to relay: {}", endpoint);
        let (ws_stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;
        info!("Connected to relay");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(true));

        let worker = ConnectionWorker {
            config,
            endpoint: endpoint.clone(),
            outbound: outbound_rx,
            pending: VecDeque::new(),
            events: events_tx,
            connected: Arc::clone(&connected),
            shutdown: shutdown_rx,
        };
        tokio::spawn(worker.run(ws_stream));

        let client = Arc::new(Self {
            endpoint,
            outbound,
            connected,
            shutdown,
        });
        Ok((client, events_rx))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Queue a message; delivered as soon as the socket is up
    pub fn enqueue(&self, message: RelayMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| Error::WebSocketError("relay client stopped".to_string()))
    }

    /// Close the socket and stop reconnecting
    pub fn disconnect(&self) {
        info!("Disconnecting from relay");
        let _ = self.shutdown.send(true);
    }
}

#[async_trait]
impl RelaySink for RelayClient {
    async fn send(&self, message: RelayMessage) -> voicemesh_core::Result<()> {
        Ok(self.enqueue(message)?)
    }
}

/// Background task owning the socket
struct ConnectionWorker {
    config: RelayConfig,
    endpoint: String,
    outbound: mpsc::UnboundedReceiver<RelayMessage>,
    /// Frames taken off the queue but not written before the socket dropped
    pending: VecDeque<Message>,
    events: mpsc::UnboundedSender<RelayEvent>,
    connected: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionWorker {
    async fn run(mut self, ws_stream: WsStream) {
        let _ = self.events.send(RelayEvent::Connected);
        let mut stream = ws_stream;

        loop {
            let end = self.serve(stream).await;
            self.connected.store(false, Ordering::SeqCst);

            if matches!(end, SessionEnd::Shutdown) {
                break;
            }
            let _ = self.events.send(RelayEvent::Disconnected);

            match self.reconnect().await {
                Some(next) => {
                    self.connected.store(true, Ordering::SeqCst);
                    let _ = self.events.send(RelayEvent::Connected);
                    stream = next;
                }
                None => break,
            }
        }

        debug!("Relay connection task terminated");
    }

    /// Pump one connected socket until it drops or shutdown is requested
    async fn serve(&mut self, ws_stream: WsStream) -> SessionEnd {
        let (mut write, mut read) = ws_stream.split();

        if !self.flush_pending(&mut write).await {
            return SessionEnd::Lost;
        }

        let period = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                }
                message = self.outbound.recv() => {
                    let Some(message) = message else {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    };
                    match message.to_json() {
                        Ok(text) => {
                            let frame = Message::Text(text);
                            if let Err(e) = write.send(frame.clone()).await {
                                warn!("Failed to send relay message: {}", e);
                                self.pending.push_front(frame);
                                return SessionEnd::Lost;
                            }
                        }
                        Err(e) => error!("Failed to encode relay message: {}", e),
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = write.send(Message::Text(r#"{"type":"ping"}"#.to_string())).await {
                        warn!("Failed to send heartbeat: {}", e);
                        return SessionEnd::Lost;
                    }
                }
                frame = read.next() => {
                    if !self.handle_frame(frame, &mut write).await {
                        return SessionEnd::Lost;
                    }
                }
            }
        }
    }

    /// False once the socket is unusable
    async fn handle_frame(
        &mut self,
        frame: Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>,
        write: &mut WsWrite,
    ) -> bool {
        match frame {
            Some(Ok(Message::Text(text))) => {
                self.dispatch(&text);
                true
            }
            Some(Ok(Message::Ping(payload))) => {
                let _ = write.send(Message::Pong(payload)).await;
                true
            }
            Some(Ok(Message::Close(_))) | None => {
                info!("Relay connection closed");
                false
            }
            Some(Ok(_)) => true,
            Some(Err(e)) => {
                error!("Relay WebSocket error: {}", e);
                false
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match RelayMessage::from_json(text) {
            Ok(RelayMessage::Unknown) => debug!("Ignoring relay message: {}", text),
            Ok(RelayMessage::Ping) => debug!("Relay ping"),
            Ok(message) => {
                debug!("Relay message: {}", message.kind());
                let _ = self.events.send(RelayEvent::Message(message));
            }
            Err(e) => warn!("Dropping unparseable relay frame: {}", e),
        }
    }

    async fn flush_pending(&mut self, write: &mut WsWrite) -> bool {
        while let Some(frame) = self.pending.pop_front() {
            if let Err(e) = write.send(frame.clone()).await {
                warn!("Failed to flush queued relay message: {}", e);
                self.pending.push_front(frame);
                return false;
            }
        }
        true
    }

    /// Linear backoff; `None` when attempts are exhausted or shutdown was requested
    async fn reconnect(&mut self) -> Option<WsStream> {
        for attempt in 1..=self.config.reconnect_attempts {
            let delay = self.config.reconnect_delay(attempt);
            info!(
                "Reconnecting to relay in {:?} (attempt {}/{})",
                delay, attempt, self.config.reconnect_attempts
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => return None,
            }
            if *self.shutdown.borrow() {
                return None;
            }

            match connect_async(self.endpoint.as_str()).await {
                Ok((ws_stream, _)) => {
                    info!("Reconnected to relay after {} attempt(s)", attempt);
                    return Some(ws_stream);
                }
                Err(e) => warn!("Relay reconnect attempt {} failed: {}", attempt, e),
            }
        }

        error!(
            "Giving up on relay after {} reconnect attempt(s)",
            self.config.reconnect_attempts
        );
        let _ = self.events.send(RelayEvent::GaveUp);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use voicemesh_core::PeerId;

    async fn listener() -> (TcpListener, RelayConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = RelayConfig {
            server_url: format!("ws://{}/ws", addr),
            reconnect_attempts: 3,
            reconnect_delay_ms: 20,
            heartbeat_interval_ms: 60_000,
        };
        (listener, config)
    }

    async fn accept(listener: &TcpListener) -> WsStream {
        let (tcp, _) = listener.accept().await.unwrap();
        accept_async(MaybeTlsStream::Plain(tcp)).await.unwrap()
    }

    async fn next_text(server: &mut WsStream) -> String {
        loop {
            match server.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {:?}", other),
            }
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<RelayEvent>) -> RelayEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("relay event")
            .expect("event channel open")
    }

    #[tokio::test]
    async fn test_sends_and_receives_json_frames() {
        let (listener, config) = listener().await;
        let server = tokio::spawn(async move { accept(&listener).await });

        let (client, mut events) = RelayClient::connect(config, "alice").await.unwrap();
        let mut server = server.await.unwrap();
        assert!(client.endpoint().ends_with("/ws/alice"));
        assert_eq!(next_event(&mut events).await, RelayEvent::Connected);

        client
            .send(RelayMessage::JoinRoom {
                room_id: "standup".to_string(),
            })
            .await
            .unwrap();
        let text = next_text(&mut server).await;
        assert_eq!(
            RelayMessage::from_json(&text).unwrap(),
            RelayMessage::JoinRoom {
                room_id: "standup".to_string()
            }
        );

        server
            .send(Message::Text(
                r#"{"type":"room_users","users":["alice","bob"]}"#.to_string(),
            ))
            .await
            .unwrap();
        match next_event(&mut events).await {
            RelayEvent::Message(RelayMessage::RoomUsers { users, .. }) => {
                assert_eq!(users, vec![PeerId::from("alice"), PeerId::from("bob")]);
            }
            other => panic!("unexpected event {:?}", other),
        }

        client.disconnect();
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_frames_are_ignored() {
        let (listener, config) = listener().await;
        let server = tokio::spawn(async move { accept(&listener).await });

        let (client, mut events) = RelayClient::connect(config, "alice").await.unwrap();
        let mut server = server.await.unwrap();
        assert_eq!(next_event(&mut events).await, RelayEvent::Connected);

        for text in [
            r#"{"type":"pong"}"#,
            "not json",
            r#"{"type":"user_joined","client_id":"bob"}"#,
        ] {
            server.send(Message::Text(text.to_string())).await.unwrap();
        }

        match next_event(&mut events).await {
            RelayEvent::Message(RelayMessage::UserJoined { client_id, .. }) => {
                assert_eq!(client_id.as_str(), "bob");
            }
            other => panic!("unexpected event {:?}", other),
        }
        client.disconnect();
    }

    #[tokio::test]
    async fn test_heartbeat_pings() {
        let (listener, mut config) = listener().await;
        config.heartbeat_interval_ms = 50;
        let server = tokio::spawn(async move { accept(&listener).await });

        let (client, _events) = RelayClient::connect(config, "alice").await.unwrap();
        let mut server = server.await.unwrap();

        let text = tokio::time::timeout(Duration::from_secs(5), next_text(&mut server))
            .await
            .unwrap();
        assert_eq!(RelayMessage::from_json(&text).unwrap(), RelayMessage::Ping);
        client.disconnect();
    }

    #[tokio::test]
    async fn test_queued_messages_flush_after_reconnect() {
        let (listener, config) = listener().await;
        let listener = Arc::new(listener);

        let first = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { accept(&listener).await })
        };
        let (client, mut events) = RelayClient::connect(config, "alice").await.unwrap();
        assert_eq!(next_event(&mut events).await, RelayEvent::Connected);

        let mut first = first.await.unwrap();
        first.close(None).await.unwrap();
        assert_eq!(next_event(&mut events).await, RelayEvent::Disconnected);
        assert!(!client.is_connected());

        let second = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { accept(&listener).await })
        };
        for room in ["a", "b"] {
            client
                .enqueue(RelayMessage::JoinRoom {
                    room_id: room.to_string(),
                })
                .unwrap();
        }

        assert_eq!(next_event(&mut events).await, RelayEvent::Connected);
        let mut second = second.await.unwrap();
        for room in ["a", "b"] {
            let text = next_text(&mut second).await;
            assert_eq!(
                RelayMessage::from_json(&text).unwrap(),
                RelayMessage::JoinRoom {
                    room_id: room.to_string()
                }
            );
        }
        client.disconnect();
    }

    #[tokio::test]
    async fn test_gives_up_after_reconnect_attempts() {
        let (listener, mut config) = listener().await;
        config.reconnect_attempts = 2;
        let server = tokio::spawn(async move {
            let ws = accept(&listener).await;
            drop(listener);
            ws
        });

        let (_client, mut events) = RelayClient::connect(config, "alice").await.unwrap();
        assert_eq!(next_event(&mut events).await, RelayEvent::Connected);

        let mut server = server.await.unwrap();
        server.close(None).await.unwrap();

        assert_eq!(next_event(&mut events).await, RelayEvent::Disconnected);
        assert_eq!(next_event(&mut events).await, RelayEvent::GaveUp);
    }

    #[tokio::test]
    async fn test_rejects_non_websocket_url() {
        let config = RelayConfig {
            server_url: "http://localhost:8000/ws".to_string(),
            ..Default::default()
        };
        let err = RelayClient::connect(config, "alice").await.err().unwrap();
        assert!(err.is_config_error());
    }
}
