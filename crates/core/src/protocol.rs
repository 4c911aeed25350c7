//! Relay wire protocol
//!
//! JSON text frames tagged by `type`. Offers, answers and candidates are
//! addressed with `to`; the relay server stamps `from` before forwarding.
//! Membership messages (`room_users`, `user_joined`, `user_left`) originate
//! from the server itself.

use crate::candidate::IceCandidate;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identity of a participant, unique within a room
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// SDP kind carried in a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in the browser's `RTCSessionDescriptionInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Every message exchanged with the relay server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Offer {
        to: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        offer: SessionDescription,
    },
    Answer {
        to: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        answer: SessionDescription,
    },
    IceCandidate {
        to: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        candidate: IceCandidate,
    },
    JoinRoom {
        room_id: String,
    },
    UserJoined {
        client_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    UserLeft {
        client_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    RoomUsers {
        users: Vec<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    Ping,
    /// Any `type` this client does not understand (e.g. `pong`)
    #[serde(other)]
    Unknown,
}

impl RelayMessage {
    /// Decode one text frame
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode as one text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::Offer { .. } => "offer",
            RelayMessage::Answer { .. } => "answer",
            RelayMessage::IceCandidate { .. } => "ice_candidate",
            RelayMessage::JoinRoom { .. } => "join_room",
            RelayMessage::UserJoined { .. } => "user_joined",
            RelayMessage::UserLeft { .. } => "user_left",
            RelayMessage::RoomUsers { .. } => "room_users",
            RelayMessage::Ping => "ping",
            RelayMessage::Unknown => "unknown",
        }
    }
}

/// Negotiation payload addressed from one peer to another
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopePayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

/// Envelope kind, used for logging and routing decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Offer,
    Answer,
    Candidate,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeKind::Offer => f.write_str("offer"),
            EnvelopeKind::Answer => f.write_str("answer"),
            EnvelopeKind::Candidate => f.write_str("candidate"),
        }
    }
}

/// Immutable signaling envelope `{kind, from, to, payload}`
#[derive(Debug, Clone, PartialEq)]
pub struct SignalingEnvelope {
    pub from: PeerId,
    pub to: PeerId,
    pub payload: EnvelopePayload,
}

impl SignalingEnvelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self.payload {
            EnvelopePayload::Offer(_) => EnvelopeKind::Offer,
            EnvelopePayload::Answer(_) => EnvelopeKind::Answer,
            EnvelopePayload::Candidate(_) => EnvelopeKind::Candidate,
        }
    }

    /// Extract the envelope from a relay message
    ///
    /// Returns `Ok(None)` for non-signaling messages and
    /// [`Error::InvalidEnvelope`] when a signaling message lacks its sender
    /// or carries a payload of the wrong SDP type.
    pub fn from_relay(message: &RelayMessage) -> Result<Option<Self>> {
        let (to, from, payload) = match message {
            RelayMessage::Offer { to, from, offer } => {
                if offer.sdp_type != SdpType::Offer {
                    return Err(Error::InvalidEnvelope(format!(
                        "offer message carries {:?} description",
                        offer.sdp_type
                    )));
                }
                (to, from, EnvelopePayload::Offer(offer.clone()))
            }
            RelayMessage::Answer { to, from, answer } => {
                if answer.sdp_type != SdpType::Answer {
                    return Err(Error::InvalidEnvelope(format!(
                        "answer message carries {:?} description",
                        answer.sdp_type
                    )));
                }
                (to, from, EnvelopePayload::Answer(answer.clone()))
            }
            RelayMessage::IceCandidate { to, from, candidate } => {
                (to, from, EnvelopePayload::Candidate(candidate.clone()))
            }
            _ => return Ok(None),
        };

        let from = from.clone().ok_or_else(|| {
            Error::InvalidEnvelope(format!("{} message without sender", message.kind()))
        })?;

        Ok(Some(Self {
            from,
            to: to.clone(),
            payload,
        }))
    }

    /// Convert to the relay message that carries it
    pub fn into_relay(self) -> RelayMessage {
        let from = Some(self.from);
        let to = self.to;
        match self.payload {
            EnvelopePayload::Offer(offer) => RelayMessage::Offer { to, from, offer },
            EnvelopePayload::Answer(answer) => RelayMessage::Answer { to, from, answer },
            EnvelopePayload::Candidate(candidate) => RelayMessage::IceCandidate {
                to,
                from,
                candidate,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_wire_format() {
        let message = RelayMessage::Offer {
            to: PeerId::from("bob"),
            from: None,
            offer: SessionDescription::offer("v=0"),
        };

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({"type": "offer", "to": "bob", "offer": {"type": "offer", "sdp": "v=0"}})
        );
    }

    #[test]
    fn test_parse_membership_messages() {
        let users = RelayMessage::from_json(r#"{"type":"room_users","users":["alice","bob"]}"#)
            .unwrap();
        assert_eq!(
            users,
            RelayMessage::RoomUsers {
                users: vec![PeerId::from("alice"), PeerId::from("bob")],
                room_id: None,
            }
        );

        let joined =
            RelayMessage::from_json(r#"{"type":"user_joined","client_id":"carol","room_id":"r1"}"#)
                .unwrap();
        assert!(matches!(joined, RelayMessage::UserJoined { ref client_id, .. } if client_id.as_str() == "carol"));
    }

    #[test]
    fn test_parse_candidate_with_browser_field_names() {
        let text = r#"{"type":"ice_candidate","to":"alice","from":"carol","candidate":{"candidate":"candidate:1 1 udp 2122260223 192.168.1.2 54400 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        let message = RelayMessage::from_json(text).unwrap();
        let envelope = SignalingEnvelope::from_relay(&message).unwrap().unwrap();

        assert_eq!(envelope.kind(), EnvelopeKind::Candidate);
        assert_eq!(envelope.from.as_str(), "carol");
        match envelope.payload {
            EnvelopePayload::Candidate(c) => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_m_line_index, Some(0));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let message = RelayMessage::from_json(r#"{"type":"pong","ts":1}"#).unwrap();
        assert_eq!(message, RelayMessage::Unknown);
        assert_eq!(SignalingEnvelope::from_relay(&message).unwrap(), None);
    }

    #[test]
    fn test_ping_is_bare() {
        assert_eq!(RelayMessage::Ping.to_json().unwrap(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_envelope_without_sender_is_invalid() {
        let message = RelayMessage::Answer {
            to: PeerId::from("alice"),
            from: None,
            answer: SessionDescription::answer("v=0"),
        };
        let err = SignalingEnvelope::from_relay(&message).unwrap_err();
        assert!(err.is_malformed_input());
    }

    #[test]
    fn test_offer_with_answer_sdp_is_invalid() {
        let message = RelayMessage::Offer {
            to: PeerId::from("alice"),
            from: Some(PeerId::from("bob")),
            offer: SessionDescription::answer("v=0"),
        };
        assert!(SignalingEnvelope::from_relay(&message).is_err());
    }

    #[test]
    fn test_malformed_frame_is_serialization_error() {
        let err = RelayMessage::from_json(r#"{"type":"offer","to":"bob"}"#).unwrap_err();
        assert!(matches!(err, Error::SerializationError(_)));
    }
}
