//! Error types for the relay client and the session host.

use thiserror::Error;

/// Errors surfaced by the connection state machine and the command layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The relay URL could not be normalized into a WebSocket endpoint.
    #[error("invalid relay endpoint: {0}")]
    InvalidEndpoint(String),

    /// No authenticated transport is available.
    #[error("not connected to relay")]
    NotConnected,

    /// A frame was not valid JSON or did not match the expected shape.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A credential field required to connect was empty.
    #[error("missing credential: {0}")]
    MissingCredentials(&'static str),

    /// A handshake message arrived at the wrong step.
    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage { expected: &'static str, got: String },

    /// The host rejected the auth key.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The transport closed or refused a write.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// The relay reported the remote host as unavailable.
    #[error("remote host offline: {0}")]
    RemoteOffline(String),

    /// A handshake step did not complete in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

impl ClientError {
    /// Terminal errors must be surfaced to the caller instead of being
    /// retried by the reconnection controller.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RemoteOffline(_) | Self::AuthenticationFailed(_) | Self::InvalidEndpoint(_)
        )
    }

    /// Short machine-readable tag, used in event payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidEndpoint(_) => "invalid_endpoint",
            Self::NotConnected => "not_connected",
            Self::MalformedMessage(_) => "malformed_message",
            Self::MissingCredentials(_) => "missing_credentials",
            Self::UnexpectedMessage { .. } => "unexpected_message",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::TransportClosed(_) => "transport_closed",
            Self::RemoteOffline(_) => "remote_offline",
            Self::Timeout(_) => "timeout",
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedMessage(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::TransportClosed(err.to_string())
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors raised by the host-side session manager.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already closed: {0}")]
    Closed(String),

    #[error("invalid working directory: {0}")]
    InvalidWorkingDir(String),

    #[error("pty error: {0}")]
    Pty(#[from] anyhow::Error),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "SESSION_NOT_FOUND",
            Self::Closed(_) => "SESSION_CLOSED",
            Self::InvalidWorkingDir(_) => "INVALID_WORKING_DIR",
            Self::Pty(_) => "PTY_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ClientError;

    #[test]
    fn remote_offline_and_auth_failures_are_terminal() {
        assert!(ClientError::RemoteOffline("WORKSTATION_OFFLINE".into()).is_terminal());
        assert!(ClientError::AuthenticationFailed("bad key".into()).is_terminal());
        assert!(!ClientError::TransportClosed("reset".into()).is_terminal());
        assert!(!ClientError::Timeout("connected").is_terminal());
        assert!(!ClientError::MalformedMessage("eof".into()).is_terminal());
    }

    #[test]
    fn json_errors_map_to_malformed() {
        let err: ClientError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert_eq!(err.code(), "malformed_message");
    }
}
