//! WebRTC binding for VoiceMesh audio rooms
//!
//! Plugs real collaborators into the `voicemesh-core` session manager:
//!
//! - [`WebRtcTransportFactory`] / [`WebRtcPeerTransport`]: one webrtc-rs
//!   `RTCPeerConnection` per remote participant
//! - [`RelayClient`]: WebSocket relay channel with outbound queueing,
//!   heartbeat and linear-backoff reconnect
//! - [`NullCaptureDevices`]: Opus silence capture for headless clients
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  voicemesh-client (CLI)                                  │
//! │  ├─ RelayClient ── RelayEvent ──▶ PeerSessionManager     │
//! │  │      ▲                          │                     │
//! │  │      └──────── RelaySink ◀──────┤                     │
//! │  ├─ WebRtcTransportFactory ◀───────┤ TransportFactory    │
//! │  │   └─ WebRtcPeerTransport (per peer)                   │
//! │  └─ NullCaptureDevices ◀───────────┘ MediaDevices        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use voicemesh_core::{ClientConfig, PeerId, PeerSessionManager};
//! use voicemesh_webrtc::{NullCaptureDevices, RelayClient, WebRtcTransportFactory};
//!
//! let config = ClientConfig::default();
//! let (relay, mut relay_events) = RelayClient::connect(config.relay.clone(), "alice").await?;
//! let manager = PeerSessionManager::builder(
//!     PeerId::from("alice"),
//!     Arc::new(WebRtcTransportFactory::new(config.ice.clone())?),
//!     relay.clone(),
//!     Arc::new(NullCaptureDevices::new()),
//! )
//! .config(config.session.clone())
//! .build()?;
//! ```

#![warn(clippy::all)]

pub mod capture;
pub mod error;
pub mod factory;
pub mod peer;
pub mod relay;

pub use capture::NullCaptureDevices;
pub use error::{Error, Result};
pub use factory::WebRtcTransportFactory;
pub use peer::WebRtcPeerTransport;
pub use relay::{RelayClient, RelayEvent};

/// Library version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
