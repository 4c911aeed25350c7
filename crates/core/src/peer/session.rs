//! Per-peer session record

use super::negotiation::{Role, SessionState};
use crate::protocol::PeerId;
use crate::transport::PeerTransport;
use std::fmt;
use tokio::task::JoinHandle;

/// Purpose of the single timer a session may own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Bounds one offer/answer exchange
    Negotiation,
    /// Backoff before the next attempt
    Retry,
}

/// Spawned timer task; aborted when cancelled or dropped
pub(crate) struct TimerHandle {
    kind: TimerKind,
    handle: Option<JoinHandle<()>>,
}

impl TimerHandle {
    pub(crate) fn new(kind: TimerKind, handle: JoinHandle<()>) -> Self {
        Self {
            kind,
            handle: Some(handle),
        }
    }

    pub(crate) fn kind(&self) -> TimerKind {
        self.kind
    }

    pub(crate) fn cancel(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Forget the task without aborting it; used by the timer task itself
    pub(crate) fn disarm(mut self) {
        self.handle.take();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Negotiation state and resources for one remote participant
///
/// Only ever accessed behind its own mutex inside the session manager.
pub struct Session {
    pub(crate) peer_id: PeerId,
    /// Identity of the map slot holding this session
    pub(crate) slot_id: u64,
    pub(crate) state: SessionState,
    pub(crate) role: Option<Role>,
    pub(crate) retry_count: u32,
    /// Generation of the current transport/timer; bumped on every
    /// (re)creation so late completions from older generations are ignored
    pub(crate) epoch: u64,
    pub(crate) timer: Option<TimerHandle>,
    pub(crate) transport: Option<Box<dyn PeerTransport>>,
    pub(crate) remote_attached: bool,
}

impl Session {
    pub(crate) fn new(peer_id: PeerId, slot_id: u64, retry_count: u32) -> Self {
        Self {
            peer_id,
            slot_id,
            state: SessionState::Idle,
            role: None,
            retry_count,
            epoch: 0,
            timer: None,
            transport: None,
            remote_attached: false,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    #[cfg(test)]
    pub(crate) fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// Install a timer, cancelling any previous one
    pub(crate) fn set_timer(&mut self, timer: TimerHandle) {
        if let Some(previous) = self.timer.replace(timer) {
            previous.cancel();
        }
    }

    pub(crate) fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer_id", &self.peer_id)
            .field("state", &self.state)
            .field("role", &self.role)
            .field("retry_count", &self.retry_count)
            .field("epoch", &self.epoch)
            .field("timer", &self.timer.as_ref().map(TimerHandle::kind))
            .field("has_transport", &self.transport.is_some())
            .finish()
    }
}
