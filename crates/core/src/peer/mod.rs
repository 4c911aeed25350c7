//! Peer sessions: state machine, retry policy and the session manager

mod lifecycle;
mod manager;
mod negotiation;
mod retry;
mod session;

pub use manager::{ManagerStatus, PeerSessionManager, PeerSessionManagerBuilder, PeerStatus};
pub use negotiation::{resolve_glare, GlareOutcome, Role, SessionInput, SessionState};
pub use retry::RetryPolicy;
pub use session::Session;
