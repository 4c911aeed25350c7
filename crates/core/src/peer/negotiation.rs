//! Per-peer negotiation state machine
//!
//! The transition relation is a pure function over [`SessionState`] and
//! [`SessionInput`]; the session manager drives it and performs the side
//! effects (transport calls, timers, events) around each step.
//!
//! ```text
//!  Idle ──initiate──▶ Offering ──offer sent──▶ AwaitingAnswer ──answer──▶ Connected
//!   │                                                                        ▲
//!   └──receive offer──▶ Negotiating ──transport connected────────────────────┘
//!
//!  non-terminal ──timeout / transport failure──▶ Failed ──retry──▶ Idle
//!                                                   └──exhausted──▶ Closed
//!  any ──teardown──▶ Closed
//! ```

use crate::protocol::PeerId;
use crate::{Error, Result};
use serde::Serialize;
use std::fmt;

/// State of one peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// No negotiation in progress
    Idle,
    /// Constructing the local offer
    Offering,
    /// Local offer applied and sent, waiting for the answer
    AwaitingAnswer,
    /// Remote offer applied, answer sent, waiting for the transport
    Negotiating,
    Connected,
    /// Transient; always followed by a retry or by `Closed`
    Failed,
    /// Terminal
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }

    /// Offer/answer exchange in flight (negotiation timer armed)
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            SessionState::Offering | SessionState::AwaitingAnswer | SessionState::Negotiating
        )
    }

    /// Remote description is set; candidates can go straight to the transport
    pub fn has_remote_description(self) -> bool {
        matches!(self, SessionState::Negotiating | SessionState::Connected)
    }

    /// Candidates arriving now belong to a negotiation that has not yet
    /// applied its remote description and must be buffered
    pub fn buffers_candidates(self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Offering | SessionState::AwaitingAnswer
        )
    }

    /// Local offer outstanding; an inbound offer now is glare
    pub fn has_local_offer(self) -> bool {
        matches!(self, SessionState::Offering | SessionState::AwaitingAnswer)
    }

    /// Apply an input, returning the next state
    pub fn next(self, input: SessionInput) -> Result<SessionState> {
        use SessionInput as I;
        use SessionState as S;

        let next = match (self, input) {
            (_, I::Teardown) => S::Closed,

            (S::Idle, I::Initiate) => S::Offering,
            (S::Idle, I::ReceiveOffer) => S::Negotiating,
            (S::Offering, I::OfferSent) => S::AwaitingAnswer,
            (S::AwaitingAnswer, I::ReceiveAnswer) => S::Connected,
            (S::Negotiating, I::TransportConnected) => S::Connected,

            (s, I::Timeout) if s.is_negotiating() => S::Failed,
            (s, I::TransportFailed) if s.is_negotiating() || s == S::Connected => S::Failed,

            (S::Failed, I::RetryElapsed) => S::Idle,
            (S::Failed, I::RetriesExhausted) => S::Closed,

            (state, input) => {
                return Err(Error::InvalidTransition(format!(
                    "{:?} does not accept {:?}",
                    state, input
                )))
            }
        };

        Ok(next)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Offering => "offering",
            SessionState::AwaitingAnswer => "awaiting-answer",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Inputs accepted by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInput {
    Initiate,
    OfferSent,
    ReceiveOffer,
    ReceiveAnswer,
    TransportConnected,
    TransportFailed,
    Timeout,
    RetryElapsed,
    RetriesExhausted,
    Teardown,
}

/// Which side produced the offer for the current negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Initiator,
    Responder,
}

/// Resolution of simultaneous offers between two peers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlareOutcome {
    /// Local identity sorts first: ignore the inbound offer
    KeepLocalOffer,
    /// Remote identity sorts first: drop our offer and answer theirs
    YieldToRemote,
}

/// The lexicographically smaller identity stays the offerer
pub fn resolve_glare(local: &PeerId, remote: &PeerId) -> GlareOutcome {
    if local < remote {
        GlareOutcome::KeepLocalOffer
    } else {
        GlareOutcome::YieldToRemote
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [SessionState; 7] = [
        SessionState::Idle,
        SessionState::Offering,
        SessionState::AwaitingAnswer,
        SessionState::Negotiating,
        SessionState::Connected,
        SessionState::Failed,
        SessionState::Closed,
    ];

    #[test]
    fn test_initiator_path() {
        let state = SessionState::Idle;
        let state = state.next(SessionInput::Initiate).unwrap();
        assert_eq!(state, SessionState::Offering);
        let state = state.next(SessionInput::OfferSent).unwrap();
        assert_eq!(state, SessionState::AwaitingAnswer);
        let state = state.next(SessionInput::ReceiveAnswer).unwrap();
        assert_eq!(state, SessionState::Connected);
    }

    #[test]
    fn test_responder_path() {
        let state = SessionState::Idle.next(SessionInput::ReceiveOffer).unwrap();
        assert_eq!(state, SessionState::Negotiating);
        assert_eq!(
            state.next(SessionInput::TransportConnected).unwrap(),
            SessionState::Connected
        );
    }

    #[test]
    fn test_answer_only_accepted_with_local_offer() {
        for state in ALL_STATES {
            let result = state.next(SessionInput::ReceiveAnswer);
            if state == SessionState::AwaitingAnswer {
                assert_eq!(result.unwrap(), SessionState::Connected);
            } else {
                assert!(result.is_err(), "{:?} accepted an answer", state);
            }
        }
    }

    #[test]
    fn test_failure_reachable_from_non_terminal_negotiation() {
        for state in [
            SessionState::Offering,
            SessionState::AwaitingAnswer,
            SessionState::Negotiating,
        ] {
            assert_eq!(state.next(SessionInput::Timeout).unwrap(), SessionState::Failed);
            assert_eq!(
                state.next(SessionInput::TransportFailed).unwrap(),
                SessionState::Failed
            );
        }

        assert_eq!(
            SessionState::Connected
                .next(SessionInput::TransportFailed)
                .unwrap(),
            SessionState::Failed
        );
        assert!(SessionState::Connected.next(SessionInput::Timeout).is_err());
        assert!(SessionState::Idle.next(SessionInput::Timeout).is_err());
        assert!(SessionState::Closed.next(SessionInput::TransportFailed).is_err());
    }

    #[test]
    fn test_failed_resolves_to_retry_or_close() {
        assert_eq!(
            SessionState::Failed.next(SessionInput::RetryElapsed).unwrap(),
            SessionState::Idle
        );
        assert_eq!(
            SessionState::Failed
                .next(SessionInput::RetriesExhausted)
                .unwrap(),
            SessionState::Closed
        );
    }

    #[test]
    fn test_teardown_from_every_state() {
        for state in ALL_STATES {
            assert_eq!(state.next(SessionInput::Teardown).unwrap(), SessionState::Closed);
        }
    }

    #[test]
    fn test_closed_is_terminal() {
        for input in [
            SessionInput::Initiate,
            SessionInput::ReceiveOffer,
            SessionInput::RetryElapsed,
            SessionInput::TransportConnected,
        ] {
            assert!(SessionState::Closed.next(input).is_err());
        }
    }

    #[test]
    fn test_candidate_buffering_states() {
        assert!(SessionState::Idle.buffers_candidates());
        assert!(SessionState::AwaitingAnswer.buffers_candidates());
        assert!(!SessionState::Negotiating.buffers_candidates());
        assert!(SessionState::Negotiating.has_remote_description());
        assert!(!SessionState::Failed.buffers_candidates());
        assert!(!SessionState::Failed.has_remote_description());
    }

    #[test]
    fn test_glare_tie_break() {
        let alice = PeerId::from("alice");
        let bob = PeerId::from("bob");

        assert_eq!(resolve_glare(&alice, &bob), GlareOutcome::KeepLocalOffer);
        assert_eq!(resolve_glare(&bob, &alice), GlareOutcome::YieldToRemote);
    }
}
