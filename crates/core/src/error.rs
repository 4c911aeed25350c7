//! Error types for the VoiceMesh session core

/// Result type alias using the core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating peer sessions
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Relay channel error (send failure, channel closed)
    #[error("Relay error: {0}")]
    RelayError(String),

    /// Envelope is structurally invalid (missing peer ids, wrong payload)
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Transition not permitted from the session's current state
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// Peer transport error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// ICE candidate error (malformed or rejected by policy)
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// Local or remote media error
    #[error("Media error: {0}")]
    MediaError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is a transient negotiation failure that the
    /// retry controller should absorb
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RelayError(_)
                | Error::OperationTimeout(_)
                | Error::PeerConnectionError(_)
                | Error::SdpError(_)
                | Error::Io(_)
        )
    }

    /// Check if this error describes malformed input that is dropped and logged
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            Error::InvalidEnvelope(_) | Error::IceCandidateError(_) | Error::SerializationError(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}
