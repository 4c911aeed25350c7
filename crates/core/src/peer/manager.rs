//! Peer session management
//!
//! Owns the `PeerId -> Session` map, routes relay messages and transport
//! events to the right session, reconciles room membership and exposes
//! lifecycle events to subscribers.

use super::negotiation::{Role, SessionInput, SessionState};
use super::retry::RetryPolicy;
use super::session::{Session, TimerKind};
use crate::candidate::{screen, CandidateBuffer, CandidateFilter};
use crate::config::SessionConfig;
use crate::events::SessionEvent;
use crate::media::{clamp_volume, AudioDevice, LocalAudioTrack, MediaDevices, MediaState};
use crate::protocol::{EnvelopePayload, PeerId, RelayMessage, SignalingEnvelope};
use crate::transport::{RelaySink, TransportFactory, TransportNotice};
use crate::{Error, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub(crate) type SessionSlot = Arc<Mutex<Session>>;

/// Map entry: the slot id lets removal tell a replaced slot from its successor
pub(crate) struct SlotEntry {
    pub(crate) id: u64,
    pub(crate) session: SessionSlot,
}

/// Point-in-time view of one session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub peer_id: PeerId,
    pub state: SessionState,
    pub role: Option<Role>,
    pub retry_count: u32,
    pub pending_candidates: usize,
}

/// Point-in-time view of the manager
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub local_id: PeerId,
    pub media: MediaState,
    pub members: Vec<PeerId>,
    pub sessions: Vec<PeerStatus>,
}

impl ManagerStatus {
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.sessions
            .iter()
            .filter(|s| s.state == SessionState::Connected)
            .map(|s| s.peer_id.clone())
            .collect()
    }
}

/// Builder for [`PeerSessionManager`]
pub struct PeerSessionManagerBuilder {
    local_id: PeerId,
    config: SessionConfig,
    transports: Arc<dyn TransportFactory>,
    relay: Arc<dyn RelaySink>,
    media: Arc<dyn MediaDevices>,
    filter: Option<Arc<dyn CandidateFilter>>,
}

impl PeerSessionManagerBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the declarative candidate policy from the config
    pub fn candidate_filter(mut self, filter: Arc<dyn CandidateFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Validate the configuration and start the manager
    ///
    /// Must be called from within a Tokio runtime: the transport event
    /// dispatcher is spawned here.
    pub fn build(self) -> Result<PeerSessionManager> {
        self.config.validate()?;

        if self.local_id.as_str().is_empty() {
            return Err(Error::InvalidConfig("local identity is empty".to_string()));
        }

        let filter = self.filter.unwrap_or_else(|| {
            Arc::new(self.config.candidate_policy.clone()) as Arc<dyn CandidateFilter>
        });
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            local_id: self.local_id,
            retry: RetryPolicy::from(&self.config),
            config: self.config,
            filter,
            transports: self.transports,
            relay: self.relay,
            media: self.media,
            sessions: RwLock::new(HashMap::new()),
            members: RwLock::new(HashSet::new()),
            candidates: parking_lot::Mutex::new(CandidateBuffer::new()),
            local_track: RwLock::new(None),
            media_state: parking_lot::Mutex::new(MediaState::default()),
            events,
            notices: notices_tx,
            ids: AtomicU64::new(0),
        });

        spawn_dispatcher(Arc::downgrade(&inner), notices_rx);
        info!("Peer session manager started for {}", inner.local_id);

        Ok(PeerSessionManager { inner })
    }
}

/// Handle to the session manager; cheap to clone
#[derive(Clone)]
pub struct PeerSessionManager {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) me: Weak<Inner>,
    pub(crate) local_id: PeerId,
    pub(crate) config: SessionConfig,
    pub(crate) retry: RetryPolicy,
    pub(crate) filter: Arc<dyn CandidateFilter>,
    pub(crate) transports: Arc<dyn TransportFactory>,
    pub(crate) relay: Arc<dyn RelaySink>,
    pub(crate) media: Arc<dyn MediaDevices>,
    /// Never held across an `.await`; session mutexes are taken after it
    /// has been released
    pub(crate) sessions: RwLock<HashMap<PeerId, SlotEntry>>,
    pub(crate) members: RwLock<HashSet<PeerId>>,
    pub(crate) candidates: parking_lot::Mutex<CandidateBuffer>,
    pub(crate) local_track: RwLock<Option<LocalAudioTrack>>,
    pub(crate) media_state: parking_lot::Mutex<MediaState>,
    pub(crate) events: broadcast::Sender<SessionEvent>,
    pub(crate) notices: mpsc::UnboundedSender<TransportNotice>,
    ids: AtomicU64,
}

fn spawn_dispatcher(inner: Weak<Inner>, mut notices: mpsc::UnboundedReceiver<TransportNotice>) {
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.on_transport_notice(notice).await;
        }
        debug!("Transport event dispatcher stopped");
    });
}

impl PeerSessionManager {
    pub fn builder(
        local_id: PeerId,
        transports: Arc<dyn TransportFactory>,
        relay: Arc<dyn RelaySink>,
        media: Arc<dyn MediaDevices>,
    ) -> PeerSessionManagerBuilder {
        PeerSessionManagerBuilder {
            local_id,
            config: SessionConfig::default(),
            transports,
            relay,
            media,
            filter: None,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Subscribe to lifecycle and state-change events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    // ========================================================================
    // Relay routing
    // ========================================================================

    /// Route one inbound relay message
    ///
    /// Messages for a single peer must be delivered in relay order; this
    /// method applies each one fully before returning.
    pub async fn on_relay_message(&self, message: RelayMessage) {
        match message {
            RelayMessage::RoomUsers { users, .. } => self.on_room_membership(users).await,
            RelayMessage::UserJoined { client_id, .. } => self.on_peer_joined(client_id).await,
            RelayMessage::UserLeft { client_id, .. } => self.on_peer_left(&client_id).await,
            RelayMessage::Offer { .. }
            | RelayMessage::Answer { .. }
            | RelayMessage::IceCandidate { .. } => {
                match SignalingEnvelope::from_relay(&message) {
                    Ok(Some(envelope)) => self.on_envelope(envelope).await,
                    Ok(None) => {}
                    Err(e) => warn!("Dropping malformed {} message: {}", message.kind(), e),
                }
            }
            RelayMessage::JoinRoom { .. } | RelayMessage::Ping | RelayMessage::Unknown => {
                debug!("Ignoring relay message of type {}", message.kind());
            }
        }
    }

    /// Apply a signaling envelope to the session of its sender
    pub async fn on_envelope(&self, envelope: SignalingEnvelope) {
        let inner = &self.inner;

        if envelope.to != inner.local_id {
            warn!(
                "Dropping {} from {} addressed to {}",
                envelope.kind(),
                envelope.from,
                envelope.to
            );
            return;
        }
        if envelope.from == inner.local_id {
            warn!("Dropping {} addressed from ourselves", envelope.kind());
            return;
        }

        let from = envelope.from;
        match envelope.payload {
            EnvelopePayload::Offer(offer) => inner.handle_offer(from, offer).await,
            EnvelopePayload::Answer(answer) => inner.handle_answer(&from, answer).await,
            EnvelopePayload::Candidate(candidate) => {
                if let Err(e) = screen(inner.filter.as_ref(), &candidate) {
                    debug!("Rejected candidate from {}: {}", from, e);
                    return;
                }
                inner.handle_remote_candidate(&from, candidate).await;
            }
        }
    }

    // ========================================================================
    // Room membership
    // ========================================================================

    /// Replace the room membership
    ///
    /// Sessions for departed peers are torn down. Every member without a
    /// session gets one, and negotiation starts when local media is ready.
    pub async fn on_room_membership(&self, members: impl IntoIterator<Item = PeerId>) {
        let inner = &self.inner;
        let members: HashSet<PeerId> = members
            .into_iter()
            .filter(|peer| *peer != inner.local_id)
            .collect();

        info!("Room membership: {} remote member(s)", members.len());
        *inner.members.write() = members.clone();

        let departed: Vec<PeerId> = inner
            .sessions
            .read()
            .keys()
            .filter(|peer| !members.contains(*peer))
            .cloned()
            .collect();
        for peer in departed {
            inner.teardown(&peer).await;
        }

        let mut sorted: Vec<PeerId> = members.into_iter().collect();
        sorted.sort();
        for peer in sorted {
            inner.admit_member(peer).await;
        }
    }

    /// A peer entered the room
    pub async fn on_peer_joined(&self, peer_id: PeerId) {
        if peer_id == self.inner.local_id {
            return;
        }
        info!("Peer joined: {}", peer_id);
        self.inner.members.write().insert(peer_id.clone());
        self.inner.admit_member(peer_id).await;
    }

    /// A peer left the room
    pub async fn on_peer_left(&self, peer_id: &PeerId) {
        info!("Peer left: {}", peer_id);
        self.inner.members.write().remove(peer_id);
        self.inner.teardown(peer_id).await;
    }

    // ========================================================================
    // Explicit lifecycle control
    // ========================================================================

    /// Start a fresh negotiation with `peer_id`, replacing any existing session
    pub async fn initiate(&self, peer_id: PeerId) -> Result<()> {
        if peer_id == self.inner.local_id {
            return Err(Error::InvalidEnvelope(
                "cannot negotiate with ourselves".to_string(),
            ));
        }
        self.inner.restart(peer_id).await;
        Ok(())
    }

    /// Tear down the session for `peer_id`; returns false if there was none
    ///
    /// Idempotent: repeated calls neither fail nor emit further events.
    pub async fn teardown(&self, peer_id: &PeerId) -> bool {
        self.inner.teardown(peer_id).await
    }

    /// Close every session, clear buffered candidates and cancel all timers
    pub async fn shutdown_all(&self) {
        let inner = &self.inner;
        let slots: Vec<SessionSlot> = inner
            .sessions
            .write()
            .drain()
            .map(|(_, entry)| entry.session)
            .collect();

        info!("Shutting down {} session(s)", slots.len());
        for slot in slots {
            let mut session = slot.lock().await;
            inner.teardown_locked(&mut session).await;
        }

        inner.members.write().clear();
        inner.candidates.lock().clear();
    }

    // ========================================================================
    // Local media
    // ========================================================================

    pub async fn list_devices(&self) -> Result<Vec<AudioDevice>> {
        self.inner.media.list_devices().await
    }

    /// Open the capture device and start negotiating with waiting members
    ///
    /// When capture is already running this behaves like
    /// [`switch_device`](Self::switch_device).
    pub async fn start_capture(&self, device_id: Option<&str>) -> Result<()> {
        let inner = &self.inner;
        let track = inner.media.open_capture(device_id).await?;
        let muted = inner.media_state.lock().muted;
        inner.media.set_capture_enabled(&track, !muted);

        let previous = inner.swap_local_track(Some(track.clone()));
        info!("Capture started on device {}", track.device_id());

        match previous {
            Some(previous) => {
                inner.replace_track_everywhere(Some(&track)).await;
                if let Err(e) = inner.media.close_capture(&previous).await {
                    warn!("Error closing previous capture {}: {}", previous.id(), e);
                }
            }
            None => inner.initiate_waiting_members().await,
        }

        Ok(())
    }

    /// Switch the capture device on every live session without renegotiating
    pub async fn switch_device(&self, device_id: &str) -> Result<()> {
        if self.inner.current_track().is_none() {
            return Err(Error::MediaError(
                "cannot switch device: capture not started".to_string(),
            ));
        }
        self.start_capture(Some(device_id)).await
    }

    /// Stop sending audio and release the capture device
    pub async fn stop_capture(&self) -> Result<()> {
        let inner = &self.inner;
        let Some(previous) = inner.swap_local_track(None) else {
            return Ok(());
        };

        inner.replace_track_everywhere(None).await;
        inner.media.close_capture(&previous).await
    }

    /// Toggle the outgoing audio; returns the new muted state
    pub fn toggle_mute(&self) -> bool {
        let inner = &self.inner;
        let muted = {
            let mut state = inner.media_state.lock();
            state.muted = !state.muted;
            state.muted
        };

        if let Some(track) = inner.current_track() {
            inner.media.set_capture_enabled(&track, !muted);
        }
        info!("Microphone {}", if muted { "muted" } else { "unmuted" });
        muted
    }

    /// Toggle all incoming audio; returns the new deafened state
    pub fn toggle_deafen(&self) -> bool {
        let (volume, deafened) = {
            let mut state = self.inner.media_state.lock();
            state.deafened = !state.deafened;
            (state.volume, state.deafened)
        };

        self.inner.media.set_playback(volume, deafened);
        deafened
    }

    /// Set output volume, clamped to `0.0..=1.0`; returns the applied value
    pub fn set_volume(&self, volume: f32) -> f32 {
        let volume = clamp_volume(volume);
        let deafened = {
            let mut state = self.inner.media_state.lock();
            state.volume = volume;
            state.deafened
        };

        self.inner.media.set_playback(volume, deafened);
        volume
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub async fn session_state(&self, peer_id: &PeerId) -> Option<SessionState> {
        let slot = self.inner.slot(peer_id)?;
        let session = slot.lock().await;
        Some(session.state)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn has_session(&self, peer_id: &PeerId) -> bool {
        self.inner.sessions.read().contains_key(peer_id)
    }

    /// Snapshot of media controls, membership and every session
    pub async fn status(&self) -> ManagerStatus {
        let inner = &self.inner;
        let slots: Vec<SessionSlot> = inner.all_slots();

        let mut sessions = Vec::with_capacity(slots.len());
        for slot in slots {
            let session = slot.lock().await;
            if session.state.is_terminal() {
                continue;
            }
            sessions.push(PeerStatus {
                peer_id: session.peer_id.clone(),
                state: session.state,
                role: session.role,
                retry_count: session.retry_count,
                pending_candidates: inner.candidates.lock().len(&session.peer_id),
            });
        }
        sessions.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        let mut members: Vec<PeerId> = inner.members.read().iter().cloned().collect();
        members.sort();

        ManagerStatus {
            local_id: inner.local_id.clone(),
            media: inner.media_state.lock().clone(),
            members,
            sessions,
        }
    }
}

impl Inner {
    pub(crate) fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn slot(&self, peer_id: &PeerId) -> Option<SessionSlot> {
        self.sessions
            .read()
            .get(peer_id)
            .map(|entry| entry.session.clone())
    }

    pub(crate) fn all_slots(&self) -> Vec<SessionSlot> {
        self.sessions
            .read()
            .values()
            .map(|entry| entry.session.clone())
            .collect()
    }

    /// Existing slot for the peer, or a new Idle one
    pub(crate) fn slot_or_insert(&self, peer_id: &PeerId) -> SessionSlot {
        if let Some(slot) = self.slot(peer_id) {
            return slot;
        }

        let mut sessions = self.sessions.write();
        sessions
            .entry(peer_id.clone())
            .or_insert_with(|| {
                debug!("Creating session for {}", peer_id);
                self.candidates.lock().register(peer_id);
                let id = self.next_id();
                SlotEntry {
                    id,
                    session: Arc::new(Mutex::new(Session::new(peer_id.clone(), id, 0))),
                }
            })
            .session
            .clone()
    }

    /// Drop the map entry if it still belongs to `session`
    pub(crate) fn remove_slot(&self, session: &Session) {
        let mut sessions = self.sessions.write();
        let owned = sessions
            .get(&session.peer_id)
            .is_some_and(|entry| entry.id == session.slot_id);
        if owned {
            sessions.remove(&session.peer_id);
        }
    }

    pub(crate) fn current_track(&self) -> Option<LocalAudioTrack> {
        self.local_track.read().clone()
    }

    fn swap_local_track(&self, track: Option<LocalAudioTrack>) -> Option<LocalAudioTrack> {
        let ready = track.is_some();
        let device_id = track.as_ref().map(|t| t.device_id().to_string());
        let previous = std::mem::replace(&mut *self.local_track.write(), track);

        let mut state = self.media_state.lock();
        state.ready = ready;
        state.device_id = device_id;
        previous
    }

    async fn replace_track_everywhere(&self, track: Option<&LocalAudioTrack>) {
        let slots: Vec<SessionSlot> = self.all_slots();

        for slot in slots {
            let session = slot.lock().await;
            if let Some(transport) = &session.transport {
                if let Err(e) = transport.replace_audio_track(track).await {
                    warn!("Failed to replace audio track for {}: {}", session.peer_id, e);
                }
            }
        }
    }

    fn is_member(&self, peer_id: &PeerId) -> bool {
        self.members.read().contains(peer_id)
    }

    fn media_ready(&self) -> bool {
        self.local_track.read().is_some()
    }

    /// Ensure a member has a session and negotiate if media is ready
    async fn admit_member(&self, peer_id: PeerId) {
        let slot = self.slot_or_insert(&peer_id);
        if !self.media_ready() {
            debug!("Local media not ready; {} waits in idle", peer_id);
            return;
        }

        let mut session = slot.lock().await;
        if session.state == SessionState::Idle {
            self.initiate_locked(&mut session).await;
        }
    }

    async fn initiate_waiting_members(&self) {
        let mut peers: Vec<PeerId> = self.members.read().iter().cloned().collect();
        peers.sort();

        for peer in peers {
            if self.is_member(&peer) {
                self.admit_member(peer).await;
            }
        }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        info!("Session event: {:?}", event);
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    pub(crate) async fn on_timer(&self, peer_id: PeerId, epoch: u64, kind: TimerKind) {
        let Some(slot) = self.slot(&peer_id) else {
            return;
        };
        let mut session = slot.lock().await;

        if session.epoch != epoch {
            debug!("Ignoring stale {:?} timer for {}", kind, peer_id);
            return;
        }
        if let Some(timer) = session.timer.take() {
            timer.disarm();
        }

        match kind {
            TimerKind::Negotiation if session.state.is_negotiating() => {
                warn!(
                    "Negotiation with {} timed out in state {}",
                    peer_id, session.state
                );
                let reason = Error::OperationTimeout(format!(
                    "no connection after {:?}",
                    self.config.negotiation_timeout()
                ));
                self.fail_locked(&mut session, SessionInput::Timeout, reason)
                    .await;
            }
            TimerKind::Retry if session.state == SessionState::Failed => {
                self.retry_locked(&mut session).await;
            }
            _ => debug!(
                "Ignoring {:?} timer for {} in state {}",
                kind, peer_id, session.state
            ),
        }
    }
}
