//! VoiceMesh core - peer session negotiation for mesh audio rooms
//!
//! Every participant of a room keeps one direct connection to every other
//! participant. This crate owns the per-peer negotiation lifecycle on top of
//! an opaque peer transport and a relay channel:
//!
//! - offer/answer exchange driven by a per-peer state machine
//! - ICE candidate buffering until a remote description is applied
//! - deterministic resolution of simultaneous offers (glare)
//! - bounded retries with exponential backoff
//! - room membership reconciliation and local audio controls
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  RelayMessage   ┌─────────────────────────────┐
//! │ relay client │ ──────────────▶ │ PeerSessionManager          │
//! │ (RelaySink)  │ ◀────────────── │  ├─ PeerId -> Session        │
//! └──────────────┘                 │  ├─ CandidateBuffer         │
//!                                  │  └─ timers (per session)    │
//!                                  └──────┬───────────────▲──────┘
//!                          TransportFactory│               │TransportEvent
//!                                  ┌──────▼───────────────┴──────┐
//!                                  │ PeerTransport (one per peer)│
//!                                  └─────────────────────────────┘
//! ```
//!
//! Concrete transports, relay clients and audio devices live in sibling
//! crates; the `testing` feature provides an in-memory implementation of
//! all three.
//!
//! # Example
//!
//! ```ignore
//! use voicemesh_core::{PeerId, PeerSessionManager, SessionConfig};
//!
//! let manager = PeerSessionManager::builder(PeerId::from("alice"), transports, relay, media)
//!     .config(SessionConfig::default())
//!     .build()?;
//!
//! let mut events = manager.subscribe();
//! manager.start_capture(None).await?;
//! manager.on_room_membership(vec![PeerId::from("bob")]).await;
//! ```

#![warn(clippy::all)]

pub mod candidate;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod peer;
pub mod protocol;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use candidate::{CandidateFilter, CandidatePolicy, IceCandidate};
pub use config::{ClientConfig, IceConfig, RelayConfig, SessionConfig};
pub use error::{Error, Result};
pub use events::SessionEvent;
pub use media::{AudioDevice, LocalAudioTrack, MediaDevices, MediaState, RemoteAudioTrack};
pub use peer::{ManagerStatus, PeerSessionManager, PeerStatus, RetryPolicy, SessionState};
pub use protocol::{PeerId, RelayMessage, SessionDescription, SignalingEnvelope};
pub use transport::{
    PeerTransport, RelaySink, TransportEvent, TransportEventSink, TransportFactory,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
