use std::fmt;

use serde::Serialize;

use crate::error::{ClientError, Result};

/// The single authoritative connection state of a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Authenticated,
    Verified,
    Degraded(String),
    Error(String),
}

impl ConnectionState {
    /// A handshake is in flight.
    pub fn is_handshaking(&self) -> bool {
        matches!(self, Self::Connecting | Self::Authenticating)
    }

    /// Authenticated with the host, whether or not the path is fully healthy.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated | Self::Verified | Self::Degraded(_))
    }

    /// Writes are attempted in this state. `Degraded` keeps the transport up,
    /// so sends are still made on a best-effort basis.
    pub fn can_send(&self) -> bool {
        self.is_authenticated()
    }

    /// Whether `next` is a legal successor. Returning to an earlier handshake
    /// step always goes through `Disconnected` or `Error` first.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Disconnected) => true,
            (Disconnected | Error(_), Connecting) => true,
            (Connecting, Authenticating | Error(_)) => true,
            (Authenticating, Authenticated | Error(_)) => true,
            (Authenticated, Verified | Degraded(_) | Error(_)) => true,
            (Verified, Degraded(_) | Error(_)) => true,
            (Degraded(_), Verified | Degraded(_) | Error(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Authenticating => f.write_str("authenticating"),
            Self::Authenticated => f.write_str("authenticated"),
            Self::Verified => f.write_str("verified"),
            Self::Degraded(reason) => write!(f, "degraded({reason})"),
            Self::Error(message) => write!(f, "error({message})"),
        }
    }
}

/// Everything needed to (re)connect. Immutable for the lifetime of one attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub relay_url: String,
    pub session_group_id: String,
    pub auth_key: String,
    pub device_id: String,
}

impl Credentials {
    pub fn new(
        relay_url: impl Into<String>,
        session_group_id: impl Into<String>,
        auth_key: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            relay_url: relay_url.into(),
            session_group_id: session_group_id.into(),
            auth_key: auth_key.into(),
            device_id: device_id.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("relay_url", &self.relay_url),
            ("session_group_id", &self.session_group_id),
            ("auth_key", &self.auth_key),
            ("device_id", &self.device_id),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(ClientError::MissingCredentials(name));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("relay_url", &self.relay_url)
            .field("session_group_id", &self.session_group_id)
            .field("auth_key", &"<redacted>")
            .field("device_id", &self.device_id)
            .finish()
    }
}
