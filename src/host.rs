//! Remote-host side of the protocol.
//!
//! [`HostService`] owns the session manager and fans session output out to
//! every authenticated connection. [`HostConnection`] is the per-connection
//! dispatcher: it turns one inbound frame into zero or more replies and knows
//! nothing about the socket it is attached to.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::{
    sync::{broadcast, mpsc},
    time::Instant,
};

use crate::{
    config::HostConfig,
    error::SessionError,
    protocol::{
        now_millis, AuthPayload, AuthSuccessPayload, ConnectPayload, ConnectedPayload,
        ErrorPayload, HeartbeatAckPayload, HeartbeatPayload, Inbound, MessagePayload,
        RelayMessage, ResizeRequest, SessionCreatePayload, SessionDataPayload,
        SessionRefPayload, SessionResizedPayload, SyncStatePayload, TimestampPayload,
        CODE_TUNNEL_NOT_FOUND, CODE_UNAUTHENTICATED, PROTOCOL_VERSION,
    },
    session::{SessionEvent, SessionManager},
};

const OUTPUT_FANOUT_CAPACITY: usize = 1024;

pub const CODE_MALFORMED_MESSAGE: &str = "MALFORMED_MESSAGE";

fn key_digest(key: &str) -> [u8; 32] {
    Sha256::digest(key.as_bytes()).into()
}

fn digests_match(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub struct HostService {
    config: HostConfig,
    key_digest: [u8; 32],
    sessions: SessionManager,
    output: broadcast::Sender<String>,
    started: Instant,
}

impl HostService {
    /// Build the service and start forwarding session output. Must be called
    /// from within a tokio runtime.
    pub fn spawn(config: HostConfig) -> Arc<Self> {
        let (sessions, events) = SessionManager::new(config.session.clone());
        let (output, _) = broadcast::channel(OUTPUT_FANOUT_CAPACITY);
        let service = Arc::new(Self {
            key_digest: key_digest(&config.auth_key),
            config,
            sessions,
            output: output.clone(),
            started: Instant::now(),
        });
        tokio::spawn(forward_session_events(events, output));
        service
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn uptime_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Encoded `session.output`/`session.closed` frames for every session.
    pub fn subscribe_output(&self) -> broadcast::Receiver<String> {
        self.output.subscribe()
    }

    pub fn connection(self: &Arc<Self>) -> HostConnection {
        HostConnection {
            host: Arc::clone(self),
            device_id: None,
        }
    }

    fn verify_key(&self, presented: &str) -> bool {
        digests_match(&self.key_digest, &key_digest(presented))
    }

    pub fn shutdown(&self) {
        self.sessions.close_all();
    }
}

async fn forward_session_events(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    output: broadcast::Sender<String>,
) {
    while let Some(event) = events.recv().await {
        let message = match event {
            SessionEvent::Output { session_id, data } => {
                RelayMessage::SessionOutput(SessionDataPayload { session_id, data })
            }
            SessionEvent::Closed { session_id } => {
                RelayMessage::SessionClosed(SessionRefPayload { session_id })
            }
        };
        // No subscribers just means nobody is attached right now.
        let _ = output.send(message.to_text());
    }
}

fn error_reply(code: &str, message: impl Into<String>) -> RelayMessage {
    RelayMessage::Error(ErrorPayload {
        code: code.to_string(),
        message: message.into(),
    })
}

fn session_error_reply(error: &SessionError) -> RelayMessage {
    error_reply(error.code(), error.to_string())
}

pub struct HostConnection {
    host: Arc<HostService>,
    device_id: Option<String>,
}

impl HostConnection {
    pub fn is_authenticated(&self) -> bool {
        self.device_id.is_some()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn handle_text(&mut self, text: &str) -> Vec<RelayMessage> {
        match RelayMessage::parse(text) {
            Ok(Inbound::Known(message)) => self.handle(message),
            Ok(Inbound::Unknown(value)) => {
                let kind = value
                    .get("type")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("?");
                tracing::debug!(target = "session_relay::host", kind, "ignoring unknown message type");
                Vec::new()
            }
            Err(error) => {
                tracing::warn!(target = "session_relay::host", error = %error, "malformed frame");
                vec![error_reply(CODE_MALFORMED_MESSAGE, error.to_string())]
            }
        }
    }

    pub fn handle(&mut self, message: RelayMessage) -> Vec<RelayMessage> {
        match message {
            RelayMessage::Connect(connect) => vec![self.on_connect(connect)],
            RelayMessage::Auth(auth) => vec![self.on_auth(auth)],
            RelayMessage::Ping(ping) => vec![RelayMessage::Pong(TimestampPayload {
                timestamp: ping.timestamp,
            })],
            RelayMessage::Pong(_) => Vec::new(),
            message if !self.is_authenticated() => {
                vec![error_reply(
                    CODE_UNAUTHENTICATED,
                    format!("{} requires authentication", message.type_name()),
                )]
            }
            RelayMessage::Heartbeat(beat) => vec![self.on_heartbeat(beat)],
            RelayMessage::Sync(sync) => vec![RelayMessage::SyncState(SyncStatePayload {
                id: sync.id,
                sessions: self.host.sessions.list(),
            })],
            RelayMessage::SessionCreate(create) => vec![self.on_session_create(create)],
            RelayMessage::SessionInput(input) => self.on_session_input(input),
            RelayMessage::SessionResize(resize) => vec![self.on_session_resize(resize)],
            RelayMessage::SessionClose(close) => match self.host.sessions.close(&close.session_id) {
                Ok(()) => Vec::new(),
                Err(error) => vec![session_error_reply(&error)],
            },
            other => {
                tracing::debug!(
                    target = "session_relay::host",
                    kind = other.type_name(),
                    "ignoring message not addressed to the host"
                );
                Vec::new()
            }
        }
    }

    fn on_connect(&mut self, connect: ConnectPayload) -> RelayMessage {
        if connect.session_group_id != self.host.config.session_group_id {
            tracing::warn!(
                target = "session_relay::host",
                requested = %connect.session_group_id,
                "connect for unknown session group"
            );
            return error_reply(
                CODE_TUNNEL_NOT_FOUND,
                format!("no host for session group {}", connect.session_group_id),
            );
        }
        tracing::info!(
            target = "session_relay::host",
            device_id = %connect.device_id,
            reconnect = connect.reconnect,
            "client connected"
        );
        RelayMessage::Connected(ConnectedPayload {
            session_group_id: connect.session_group_id,
            relay_version: Some(self.host.config.host_version.clone()),
            protocol_version: Some(PROTOCOL_VERSION),
        })
    }

    fn on_auth(&mut self, auth: AuthPayload) -> RelayMessage {
        if !self.host.verify_key(&auth.auth_key) {
            tracing::warn!(target = "session_relay::host", device_id = %auth.device_id, "auth rejected");
            self.device_id = None;
            return RelayMessage::AuthError(MessagePayload {
                message: "invalid auth key".into(),
            });
        }
        tracing::info!(target = "session_relay::host", device_id = %auth.device_id, "device authenticated");
        self.device_id = Some(auth.device_id.clone());
        let config = &self.host.config;
        RelayMessage::AuthSuccess(AuthSuccessPayload {
            device_id: auth.device_id,
            host_name: Some(config.host_name.clone()),
            host_version: Some(config.host_version.clone()),
            protocol_version: Some(PROTOCOL_VERSION),
            workspaces_root: Some(config.workspaces_root.display().to_string()),
            restored_subscriptions: self.host.sessions.ids(),
        })
    }

    fn on_heartbeat(&self, beat: HeartbeatPayload) -> RelayMessage {
        RelayMessage::HeartbeatAck(HeartbeatAckPayload {
            id: beat.id,
            timestamp: now_millis(),
            remote_uptime_ms: self.host.uptime_ms(),
        })
    }

    fn on_session_create(&self, create: SessionCreatePayload) -> RelayMessage {
        match self
            .host
            .sessions
            .create(create.working_dir.as_deref(), create.cols, create.rows)
        {
            Ok(info) => RelayMessage::SessionCreated(info),
            Err(error) => {
                tracing::warn!(target = "session_relay::host", error = %error, "session create failed");
                session_error_reply(&error)
            }
        }
    }

    fn on_session_input(&self, input: SessionDataPayload) -> Vec<RelayMessage> {
        match self
            .host
            .sessions
            .write(&input.session_id, input.data.as_bytes())
        {
            Ok(()) => Vec::new(),
            Err(error) => vec![session_error_reply(&error)],
        }
    }

    fn on_session_resize(&self, resize: ResizeRequest) -> RelayMessage {
        // Mastery belongs to the device authenticated on this connection; the
        // id in the payload is only a fallback.
        let requester = match &self.device_id {
            Some(device_id) => {
                if !resize.device_id.is_empty() && resize.device_id != *device_id {
                    tracing::debug!(
                        target = "session_relay::host",
                        claimed = %resize.device_id,
                        device_id = %device_id,
                        "resize device id does not match connection"
                    );
                }
                device_id.clone()
            }
            None => resize.device_id,
        };
        match self
            .host
            .sessions
            .resize(&resize.session_id, resize.cols, resize.rows, &requester)
        {
            Ok(result) => RelayMessage::SessionResized(SessionResizedPayload {
                session_id: resize.session_id,
                result,
            }),
            Err(error) => session_error_reply(&error),
        }
    }
}
