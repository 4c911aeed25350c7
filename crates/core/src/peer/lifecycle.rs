//! Session lifecycle: the side effects around each state transition
//!
//! Every function here runs with the session's mutex held. Each await
//! point (transport construction, description handling, relay sends) is
//! therefore serialized per peer, while other sessions progress
//! independently.

use super::manager::Inner;
use super::negotiation::{resolve_glare, GlareOutcome, Role, SessionInput, SessionState};
use super::session::{Session, TimerHandle, TimerKind};
use crate::candidate::{screen, IceCandidate};
use crate::events::SessionEvent;
use crate::protocol::{PeerId, RelayMessage, SessionDescription};
use crate::transport::{PeerTransport, TransportEvent, TransportEventSink, TransportNotice};
use crate::{Error, Result};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

fn transport_of(session: &Session) -> Result<&dyn PeerTransport> {
    session.transport.as_deref().ok_or_else(|| {
        Error::PeerConnectionError(format!("no transport for {}", session.peer_id))
    })
}

impl Inner {
    // ========================================================================
    // State bookkeeping
    // ========================================================================

    /// Apply an input to the session's state machine
    fn transition(&self, session: &mut Session, input: SessionInput) -> bool {
        let from = session.state;
        match from.next(input) {
            Ok(to) => {
                session.state = to;
                if from != to {
                    debug!(peer_id = %session.peer_id, %from, %to, ?input, "Session transition");
                    let _ = self.events.send(SessionEvent::StateChanged {
                        peer_id: session.peer_id.clone(),
                        from,
                        to,
                    });
                }
                true
            }
            Err(e) => {
                warn!(peer_id = %session.peer_id, "Rejected transition: {}", e);
                false
            }
        }
    }

    fn arm_timer(&self, session: &mut Session, kind: TimerKind, delay: Duration) {
        let inner = self.me.clone();
        let peer_id = session.peer_id.clone();
        let epoch = session.epoch;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.on_timer(peer_id, epoch, kind).await;
            }
        });

        session.set_timer(TimerHandle::new(kind, handle));
    }

    fn sink_for(&self, session: &Session) -> TransportEventSink {
        TransportEventSink::new(session.peer_id.clone(), session.epoch, self.notices.clone())
    }

    fn mark_connected(&self, session: &mut Session) {
        session.retry_count = 0;
        self.emit(SessionEvent::PeerConnected(session.peer_id.clone()));
    }

    /// Cancel the timer, close the transport and stop remote playback
    async fn release_transport(&self, session: &mut Session) {
        session.cancel_timer();

        if let Some(transport) = session.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Error closing transport for {}: {}", session.peer_id, e);
            }
        }

        if session.remote_attached {
            session.remote_attached = false;
            if let Err(e) = self.media.detach_remote(&session.peer_id).await {
                warn!("Error detaching remote audio for {}: {}", session.peer_id, e);
            }
        }
    }

    async fn apply_buffered_candidates(&self, session: &Session) {
        let pending = self.candidates.lock().drain(&session.peer_id);
        if pending.is_empty() {
            return;
        }

        let Some(transport) = session.transport.as_deref() else {
            return;
        };

        debug!(
            "Applying {} buffered candidate(s) for {}",
            pending.len(),
            session.peer_id
        );
        for candidate in pending {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!("Buffered candidate for {} rejected: {}", session.peer_id, e);
            }
        }
    }

    /// Lock the peer's session, creating it if needed
    ///
    /// A slot observed as closed has already left the map, so the lookup
    /// is repeated until a live session is found or created.
    async fn lock_live(&self, peer_id: &PeerId) -> OwnedMutexGuard<Session> {
        loop {
            let session = self.slot_or_insert(peer_id).lock_owned().await;
            if !session.state.is_terminal() {
                return session;
            }
            debug!("Session for {} closed concurrently; looking up again", peer_id);
        }
    }

    // ========================================================================
    // Offer / answer
    // ========================================================================

    /// `Idle -> Offering -> AwaitingAnswer`
    pub(crate) async fn initiate_locked(&self, session: &mut Session) {
        if session.state != SessionState::Idle {
            debug!(
                "Not initiating with {} in state {}",
                session.peer_id, session.state
            );
            return;
        }
        if !self.transition(session, SessionInput::Initiate) {
            return;
        }

        session.role = Some(Role::Initiator);
        session.epoch = self.next_id();
        self.arm_timer(
            session,
            TimerKind::Negotiation,
            self.config.negotiation_timeout(),
        );

        info!(
            "Sending offer to {} (retry {})",
            session.peer_id, session.retry_count
        );
        if let Err(e) = self.send_offer(session).await {
            warn!("Offer to {} failed: {}", session.peer_id, e);
            self.fail_locked(session, SessionInput::TransportFailed, e)
                .await;
        }
    }

    async fn send_offer(&self, session: &mut Session) -> Result<()> {
        let peer_id = session.peer_id.clone();
        let track = self.current_track();
        let sink = self.sink_for(session);

        session.transport = Some(self.transports.create(&peer_id, track, sink).await?);
        let offer = transport_of(session)?.create_offer().await?;

        self.relay
            .send(RelayMessage::Offer {
                to: peer_id,
                from: Some(self.local_id.clone()),
                offer,
            })
            .await?;

        self.transition(session, SessionInput::OfferSent);
        Ok(())
    }

    /// `Idle -> Negotiating`
    async fn answer_locked(&self, session: &mut Session, offer: SessionDescription) {
        if !self.transition(session, SessionInput::ReceiveOffer) {
            return;
        }

        session.role = Some(Role::Responder);
        session.epoch = self.next_id();
        self.arm_timer(
            session,
            TimerKind::Negotiation,
            self.config.negotiation_timeout(),
        );

        if let Err(e) = self.send_answer(session, offer).await {
            warn!("Answering {} failed: {}", session.peer_id, e);
            self.fail_locked(session, SessionInput::TransportFailed, e)
                .await;
        }
    }

    async fn send_answer(&self, session: &mut Session, offer: SessionDescription) -> Result<()> {
        let peer_id = session.peer_id.clone();
        let track = self.current_track();
        let sink = self.sink_for(session);

        session.transport = Some(self.transports.create(&peer_id, track, sink).await?);
        transport_of(session)?.set_remote_description(offer).await?;
        self.apply_buffered_candidates(session).await;

        let answer = transport_of(session)?.create_answer().await?;
        self.relay
            .send(RelayMessage::Answer {
                to: peer_id.clone(),
                from: Some(self.local_id.clone()),
                answer,
            })
            .await?;

        info!("Answer sent to {}", peer_id);
        Ok(())
    }

    pub(crate) async fn handle_offer(&self, from: PeerId, offer: SessionDescription) {
        let mut session = self.lock_live(&from).await;

        match session.state {
            SessionState::Idle => self.answer_locked(&mut session, offer).await,
            state if state.has_local_offer() => match resolve_glare(&self.local_id, &from) {
                GlareOutcome::KeepLocalOffer => {
                    info!("Offer collision with {}: keeping our offer", from);
                }
                GlareOutcome::YieldToRemote => {
                    info!("Offer collision with {}: answering theirs", from);
                    let retry_count = session.retry_count;
                    self.replace_locked(&mut session, retry_count).await;
                    self.answer_locked(&mut session, offer).await;
                }
            },
            state => {
                info!("New offer from {} while {}; restarting session", from, state);
                let retry_count = session.retry_count;
                self.replace_locked(&mut session, retry_count).await;
                self.answer_locked(&mut session, offer).await;
            }
        }
    }

    pub(crate) async fn handle_answer(&self, from: &PeerId, answer: SessionDescription) {
        let Some(slot) = self.slot(from) else {
            warn!("Dropping answer from {}: no session", from);
            return;
        };
        let mut session = slot.lock().await;

        if session.state != SessionState::AwaitingAnswer {
            info!(
                "Discarding answer from {} received while {}",
                from, session.state
            );
            return;
        }

        let applied = match transport_of(&session) {
            Ok(transport) => transport.set_remote_description(answer).await,
            Err(e) => Err(e),
        };
        if let Err(e) = applied {
            warn!("Applying answer from {} failed: {}", from, e);
            self.fail_locked(&mut session, SessionInput::TransportFailed, e)
                .await;
            return;
        }

        self.apply_buffered_candidates(&session).await;
        session.cancel_timer();
        if self.transition(&mut session, SessionInput::ReceiveAnswer) {
            self.mark_connected(&mut session);
        }
    }

    pub(crate) async fn handle_remote_candidate(&self, from: &PeerId, candidate: IceCandidate) {
        let Some(slot) = self.slot(from) else {
            warn!("Dropping candidate from {}: no session", from);
            return;
        };
        let session = slot.lock().await;

        if session.state.has_remote_description() {
            if let Some(transport) = session.transport.as_deref() {
                if let Err(e) = transport.add_ice_candidate(candidate).await {
                    warn!("Candidate from {} rejected by transport: {}", from, e);
                }
            }
        } else if session.state.buffers_candidates() {
            self.candidates.lock().enqueue(from, candidate);
        } else {
            debug!(
                "Dropping candidate from {} received while {}",
                from, session.state
            );
        }
    }

    // ========================================================================
    // Transport events
    // ========================================================================

    pub(crate) async fn on_transport_notice(&self, notice: TransportNotice) {
        let Some(slot) = self.slot(&notice.peer_id) else {
            debug!("Transport event for {} without session", notice.peer_id);
            return;
        };
        let mut session = slot.lock().await;

        if session.epoch != notice.epoch || session.state.is_terminal() {
            debug!(
                "Ignoring stale transport event for {}: {:?}",
                notice.peer_id, notice.event
            );
            return;
        }

        let peer_id = notice.peer_id;
        match notice.event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Err(e) = screen(self.filter.as_ref(), &candidate) {
                    debug!("Not sending candidate to {}: {}", peer_id, e);
                    return;
                }
                let message = RelayMessage::IceCandidate {
                    to: peer_id.clone(),
                    from: Some(self.local_id.clone()),
                    candidate,
                };
                if let Err(e) = self.relay.send(message).await {
                    warn!("Failed to send candidate to {}: {}", peer_id, e);
                }
            }
            TransportEvent::Connected => match session.state {
                SessionState::Negotiating => {
                    session.cancel_timer();
                    if self.transition(&mut session, SessionInput::TransportConnected) {
                        self.mark_connected(&mut session);
                    }
                }
                state => debug!("Transport to {} connected while {}", peer_id, state),
            },
            TransportEvent::Disconnected => {
                info!("Transport to {} disconnected; waiting for recovery", peer_id);
            }
            TransportEvent::Failed(reason) => {
                let state = session.state;
                if state.is_negotiating() || state == SessionState::Connected {
                    self.fail_locked(
                        &mut session,
                        SessionInput::TransportFailed,
                        Error::PeerConnectionError(reason),
                    )
                    .await;
                } else {
                    debug!("Transport failure for {} ignored while {}", peer_id, state);
                }
            }
            TransportEvent::RemoteTrack(track) => {
                debug!("Remote track {} from {}", track.id(), peer_id);
                match self.media.attach_remote(&peer_id, track).await {
                    Ok(()) => session.remote_attached = true,
                    Err(e) => warn!("Failed to attach remote audio for {}: {}", peer_id, e),
                }
            }
        }
    }

    // ========================================================================
    // Failure, retry and teardown
    // ========================================================================

    /// Enter `Failed`, then either schedule a retry or give up
    pub(crate) async fn fail_locked(
        &self,
        session: &mut Session,
        input: SessionInput,
        reason: Error,
    ) {
        let was_connected = session.state == SessionState::Connected;
        if !self.transition(session, input) {
            return;
        }

        session.retry_count += 1;
        let peer_id = session.peer_id.clone();
        warn!(
            peer_id = %peer_id,
            retry_count = session.retry_count,
            retryable = reason.is_retryable(),
            "Session failed: {}",
            reason
        );

        self.release_transport(session).await;
        self.candidates.lock().drain(&peer_id);
        if was_connected {
            self.emit(SessionEvent::PeerDisconnected(peer_id.clone()));
        }

        if self.retry.should_retry(session.retry_count) {
            let delay = self.retry.delay_after_failure(session.retry_count);
            session.epoch = self.next_id();
            info!(
                "Retrying {} in {:?} (attempt {}/{})",
                peer_id,
                delay,
                session.retry_count + 1,
                self.retry.max_retries
            );
            self.arm_timer(session, TimerKind::Retry, delay);
        } else {
            warn!(
                "Giving up on {} after {} failed attempt(s)",
                peer_id, session.retry_count
            );
            self.transition(session, SessionInput::RetriesExhausted);
            self.candidates.lock().discard(&peer_id);
            self.remove_slot(session);
            self.emit(SessionEvent::ConnectionFailed(peer_id));
        }
    }

    /// `Failed -> Idle -> Offering`
    pub(crate) async fn retry_locked(&self, session: &mut Session) {
        if self.transition(session, SessionInput::RetryElapsed) {
            self.initiate_locked(session).await;
        }
    }

    /// Close the session; false if it was already closed
    pub(crate) async fn teardown_locked(&self, session: &mut Session) -> bool {
        if session.state.is_terminal() {
            return false;
        }

        let was_connected = session.state == SessionState::Connected;
        self.transition(session, SessionInput::Teardown);
        self.release_transport(session).await;
        self.candidates.lock().discard(&session.peer_id);

        if was_connected {
            self.emit(SessionEvent::PeerDisconnected(session.peer_id.clone()));
        }
        true
    }

    /// Remove and close the peer's session; false if there was none
    pub(crate) async fn teardown(&self, peer_id: &PeerId) -> bool {
        let slot = self.sessions.write().remove(peer_id);
        let Some(entry) = slot else {
            debug!("Teardown for {}: no session", peer_id);
            return false;
        };

        let mut session = entry.session.lock().await;
        info!("Tearing down session with {}", peer_id);
        self.teardown_locked(&mut session).await
    }

    /// Close the current session and put a fresh one in the same slot
    async fn replace_locked(&self, session: &mut Session, retry_count: u32) {
        let peer_id = session.peer_id.clone();
        let slot_id = session.slot_id;

        self.teardown_locked(session).await;
        self.candidates.lock().register(&peer_id);
        *session = Session::new(peer_id, slot_id, retry_count);
    }

    /// Explicit re-initiation: any existing session is closed first
    pub(crate) async fn restart(&self, peer_id: PeerId) {
        let mut session = self.lock_live(&peer_id).await;
        if session.state != SessionState::Idle {
            self.replace_locked(&mut session, 0).await;
        }
        self.initiate_locked(&mut session).await;
    }
}
