//! Error types for the WebRTC binding

/// Result type alias using the binding Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the relay client, the webrtc-rs transport and capture
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from the session core
    #[error(transparent)]
    Core(#[from] voicemesh_core::Error),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// WebSocket connection or framing error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Error reported by webrtc-rs
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Capture or playback error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Core(e) => e.is_retryable(),
            Error::WebSocketError(_) | Error::IoError(_) => true,
            _ => false,
        }
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        match self {
            Error::Core(e) => e.is_config_error(),
            Error::InvalidConfig(_) => true,
            _ => false,
        }
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::WebRtcError(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocketError(e.to_string())
    }
}

/// Collapse into the core error for the core's collaborator traits
impl From<Error> for voicemesh_core::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Core(e) => e,
            Error::InvalidConfig(msg) => voicemesh_core::Error::InvalidConfig(msg),
            Error::WebSocketError(msg) => voicemesh_core::Error::RelayError(msg),
            Error::WebRtcError(msg) => voicemesh_core::Error::PeerConnectionError(msg),
            Error::MediaTrackError(msg) => voicemesh_core::Error::MediaError(msg),
            Error::IoError(e) => voicemesh_core::Error::Io(e),
            Error::Other(e) => voicemesh_core::Error::Other(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::WebSocketError("refused".to_string());
        assert_eq!(err.to_string(), "WebSocket error: refused");
    }

    #[test]
    fn test_core_error_is_transparent() {
        let err = Error::from(voicemesh_core::Error::InvalidConfig("bad".to_string()));
        assert_eq!(err.to_string(), "Invalid configuration: bad");
        assert!(err.is_config_error());
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::WebSocketError("closed".to_string()).is_retryable());
        assert!(!Error::InvalidConfig("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_into_core_error() {
        let core: voicemesh_core::Error = Error::WebRtcError("ice".to_string()).into();
        assert!(matches!(core, voicemesh_core::Error::PeerConnectionError(_)));

        let core: voicemesh_core::Error = Error::WebSocketError("closed".to_string()).into();
        assert!(matches!(core, voicemesh_core::Error::RelayError(_)));
    }
}
