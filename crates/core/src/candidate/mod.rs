//! Connectivity hints (ICE candidates)
//!
//! Candidates are screened by a [`CandidateFilter`] in both directions and,
//! until the remote description of a session is set, held per peer in a
//! [`CandidateBuffer`].

mod buffer;
mod filter;

pub use buffer::CandidateBuffer;
pub use filter::{
    screen, CandidateFilter, CandidatePolicy, CandidateType, ParsedCandidate, TcpPolicy,
    TransportProtocol, Verdict,
};

use serde::{Deserialize, Serialize};

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The `candidate:` attribute line
    pub candidate: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate for the first media section
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }
}
