//! In-memory relay, transport and media for tests and demos
//!
//! Everything here runs inside one process: a [`LoopbackRelay`] routes
//! signaling between clients with seeded delay and loss, a
//! [`LoopbackNetwork`] connects transports whose descriptions match, and
//! [`FakeMediaDevices`] records every media call.

mod media;
mod network;
mod relay;

pub use media::{FakeCapture, FakeMediaDevices, MediaCall};
pub use network::{LoopbackAudio, LoopbackNetwork, LoopbackTransport, LoopbackTransportFactory};
pub use relay::{LinkConditions, LoopbackRelay, RecordingRelay, RelayEndpoint};
