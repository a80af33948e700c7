//! Connection state machine.
//!
//! One actor task owns the transport, the [`ConnectionState`], the liveness
//! monitors and the reconnect timer. [`RelayClient`] is a cheap handle that
//! talks to the actor over a mailbox; every state mutation happens on the
//! actor, so transitions are serialized and at most one handshake is ever in
//! flight.

use std::{collections::VecDeque, future::pending, sync::Arc, time::Duration};

use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{sleep_until, Instant},
};
use uuid::Uuid;

use crate::{
    config::ClientConfig,
    endpoint::normalize_relay_url,
    error::{ClientError, Result},
    liveness::{HeartbeatMonitor, HeartbeatTimeout, PingMonitor, PongTimeout},
    protocol::{
        now_millis, unwrap_forwarded, AuthPayload, AuthSuccessPayload, ConnectPayload,
        ErrorPayload, HeartbeatPayload, Inbound, RelayMessage, SyncPayload, TimestampPayload,
        CODE_TUNNEL_NOT_FOUND, CODE_WORKSTATION_OFFLINE,
    },
    reconnect::ReconnectController,
    state::{ConnectionState, Credentials},
    transport::{Connector, TransportEvent, TransportHandle},
};

const MAILBOX_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 1024;

/// Events observable by the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    Connected {
        relay_version: Option<String>,
        protocol_version: Option<u32>,
    },
    Authenticated(AuthSuccessPayload),
    Message(Value),
    Disconnected {
        reason: String,
    },
    HostOffline {
        reason: String,
    },
    HostOnline,
    Verified {
        rtt_ms: u64,
    },
    Degraded {
        reason: String,
    },
    Stale {
        missed: u32,
    },
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
}

impl ClientEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateChanged(_) => "state_changed",
            Self::Connected { .. } => "connected",
            Self::Authenticated(_) => "authenticated",
            Self::Message(_) => "message",
            Self::Disconnected { .. } => "disconnected",
            Self::HostOffline { .. } => "host_offline",
            Self::HostOnline => "host_online",
            Self::Verified { .. } => "verified",
            Self::Degraded { .. } => "degraded",
            Self::Stale { .. } => "stale",
            Self::Reconnecting { .. } => "reconnecting",
        }
    }
}

/// Result of a `connect` call. A handshake already in flight is never
/// restarted; callers observe its outcome through state notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectRequest {
    Started,
    AlreadyInProgress,
    AlreadyConnected,
}

enum ClientCommand {
    Connect {
        credentials: Credentials,
        reply: oneshot::Sender<Result<ConnectRequest>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Send {
        message: Value,
        reply: oneshot::Sender<Result<()>>,
    },
    Sync {
        reply: oneshot::Sender<Result<String>>,
    },
    NetworkPathChanged,
}

/// Handle to the connection actor. Clones share the same connection; the
/// actor shuts down once every handle is dropped.
#[derive(Clone)]
pub struct RelayClient {
    commands: mpsc::Sender<ClientCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
}

impl RelayClient {
    pub fn spawn<C: Connector>(connector: C, config: ClientConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let actor = ConnectionActor::new(Arc::new(connector), config, state_tx, events.clone());
        tokio::spawn(actor.run(commands_rx));
        Self {
            commands: commands_tx,
            state_rx,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn connect(&self, credentials: Credentials) -> Result<ConnectRequest> {
        let (reply, rx) = oneshot::channel();
        self.request(ClientCommand::Connect { credentials, reply }, rx)
            .await?
    }

    /// Cancel every timer, close the transport and stay disconnected.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.request(ClientCommand::Disconnect { reply }, rx).await;
    }

    /// Write one envelope. The connection state is checked on the actor at the
    /// moment of the write, so a concurrent disconnect cannot slip in between.
    pub async fn send(&self, message: Value) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(ClientCommand::Send { message, reply }, rx)
            .await?
    }

    /// Ask the host to report its live sessions. Returns the sync id.
    pub async fn request_sync(&self) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.request(ClientCommand::Sync { reply }, rx).await?
    }

    /// The network path changed (interface switch, wake from background).
    pub fn network_path_changed(&self) {
        if self
            .commands
            .try_send(ClientCommand::NetworkPathChanged)
            .is_err()
        {
            tracing::debug!(
                target = "session_relay::client",
                "mailbox full; dropping path change signal"
            );
        }
    }

    /// Wait until the state satisfies `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&ConnectionState) -> bool,
        timeout: Duration,
    ) -> Result<ConnectionState> {
        let mut rx = self.state_rx.clone();
        let outcome = match tokio::time::timeout(timeout, rx.wait_for(|state| predicate(state))).await {
            Ok(Ok(state)) => Ok(state.clone()),
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => Err(ClientError::Timeout("connection state")),
        };
        outcome
    }

    async fn request<T>(
        &self,
        command: ClientCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::NotConnected)?;
        rx.await.map_err(|_| ClientError::NotConnected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeStep {
    Opening,
    AwaitingConnected,
    AwaitingAuth,
}

impl HandshakeStep {
    fn expects(self) -> &'static str {
        match self {
            Self::Opening => "transport open",
            Self::AwaitingConnected => "connected",
            Self::AwaitingAuth => "auth.success",
        }
    }
}

struct Opened {
    generation: u64,
    result: Result<TransportHandle>,
}

enum Wake {
    Command(ClientCommand),
    Opened(Opened),
    Transport(TransportEvent),
    HandshakeTimeout,
    PingDue,
    PongTimeout,
    HeartbeatDue,
    HeartbeatTimeout,
    ReconnectDue,
    PathProbe,
}

struct ConnectionActor<C> {
    connector: Arc<C>,
    config: ClientConfig,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
    credentials: Option<Credentials>,
    transport: Option<TransportHandle>,
    generation: u64,
    step: Option<HandshakeStep>,
    handshake_deadline: Option<Instant>,
    pre_auth: VecDeque<(Inbound, Value)>,
    ping: PingMonitor,
    heartbeat: HeartbeatMonitor,
    reconnect: ReconnectController,
    host_offline: bool,
    path_probe_at: Option<Instant>,
    opened_tx: mpsc::Sender<Opened>,
    opened_rx: mpsc::Receiver<Opened>,
}

impl<C: Connector> ConnectionActor<C> {
    fn new(
        connector: Arc<C>,
        config: ClientConfig,
        state_tx: watch::Sender<ConnectionState>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let (opened_tx, opened_rx) = mpsc::channel(4);
        Self {
            ping: PingMonitor::new(
                config.ping_interval,
                config.pong_timeout,
                config.max_missed_pongs,
            ),
            heartbeat: HeartbeatMonitor::new(
                config.heartbeat_interval,
                config.heartbeat_timeout,
                config.stale_after_missed_heartbeats,
            ),
            reconnect: ReconnectController::new(
                config.reconnect_min_delay,
                config.reconnect_max_delay,
            ),
            connector,
            config,
            state: ConnectionState::Disconnected,
            state_tx,
            events,
            credentials: None,
            transport: None,
            generation: 0,
            step: None,
            handshake_deadline: None,
            pre_auth: VecDeque::new(),
            host_offline: false,
            path_probe_at: None,
            opened_tx,
            opened_rx,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<ClientCommand>) {
        loop {
            let wake = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => break,
                },
                Some(opened) = self.opened_rx.recv() => Wake::Opened(opened),
                event = next_transport_event(&mut self.transport) => Wake::Transport(event),
                _ = sleep_opt(self.handshake_deadline) => Wake::HandshakeTimeout,
                _ = sleep_opt(self.ping.next_ping_at()) => Wake::PingDue,
                _ = sleep_opt(self.ping.pong_deadline()) => Wake::PongTimeout,
                _ = sleep_opt(self.heartbeat.next_beat_at()) => Wake::HeartbeatDue,
                _ = sleep_opt(self.heartbeat.ack_deadline()) => Wake::HeartbeatTimeout,
                _ = sleep_opt(self.reconnect.deadline()) => Wake::ReconnectDue,
                _ = sleep_opt(self.path_probe_at) => Wake::PathProbe,
            };
            self.handle(wake);
        }

        self.reconnect.cancel();
        self.teardown_transport();
        tracing::debug!(
            target = "session_relay::client",
            "all client handles dropped; actor stopped"
        );
    }

    fn handle(&mut self, wake: Wake) {
        match wake {
            Wake::Command(command) => self.on_command(command),
            Wake::Opened(opened) => self.on_opened(opened),
            Wake::Transport(TransportEvent::Text(text)) => self.on_text(&text),
            Wake::Transport(TransportEvent::Closed { reason }) => {
                let reason = reason.unwrap_or_else(|| "closed by peer".to_string());
                if self.step.is_some() {
                    self.fail_attempt(ClientError::TransportClosed(reason));
                } else {
                    self.connection_lost(&format!("transport closed: {reason}"));
                }
            }
            Wake::HandshakeTimeout => {
                let expected = self.step.map(HandshakeStep::expects).unwrap_or("handshake");
                self.fail_attempt(ClientError::Timeout(expected));
            }
            Wake::PingDue => self.on_ping_due(),
            Wake::PongTimeout => match self.ping.on_pong_timeout() {
                PongTimeout::Tolerated { missed } => {
                    tracing::warn!(target = "session_relay::client", missed, "pong missed");
                }
                PongTimeout::Dead { missed } => {
                    tracing::warn!(
                        target = "session_relay::client",
                        missed,
                        "relay stopped answering pings; dropping transport"
                    );
                    self.connection_lost("pong timeout");
                }
            },
            Wake::HeartbeatDue => self.on_heartbeat_due(),
            Wake::HeartbeatTimeout => self.on_heartbeat_timeout(),
            Wake::ReconnectDue => {
                let has_credentials = self.credentials.is_some();
                match self.reconnect.fire(&self.state, has_credentials) {
                    Some(attempt) => {
                        tracing::info!(target = "session_relay::client", attempt, "reconnecting");
                        self.begin_connect();
                    }
                    None => tracing::debug!(
                        target = "session_relay::client",
                        state = %self.state,
                        "reconnect timer fired but no longer needed"
                    ),
                }
            }
            Wake::PathProbe => {
                self.path_probe_at = None;
                if self.state.is_authenticated() && !self.ping.is_awaiting_pong() {
                    tracing::debug!(
                        target = "session_relay::client",
                        "probing relay after network path change"
                    );
                    self.send_ping(Instant::now());
                }
            }
        }
    }

    fn on_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Connect { credentials, reply } => {
                let _ = reply.send(self.on_connect(credentials));
            }
            ClientCommand::Disconnect { reply } => {
                self.on_disconnect();
                let _ = reply.send(());
            }
            ClientCommand::Send { message, reply } => {
                let _ = reply.send(self.send_raw(message.to_string()));
            }
            ClientCommand::Sync { reply } => {
                let _ = reply.send(self.send_sync());
            }
            ClientCommand::NetworkPathChanged => {
                if self.state.is_handshaking() || self.reconnect.is_scheduled() {
                    tracing::debug!(
                        target = "session_relay::client",
                        state = %self.state,
                        "ignoring path change while connecting"
                    );
                } else if self.state.is_authenticated() {
                    self.path_probe_at = Some(Instant::now() + self.config.path_change_settle);
                }
            }
        }
    }

    fn on_connect(&mut self, credentials: Credentials) -> Result<ConnectRequest> {
        credentials.validate()?;
        normalize_relay_url(&credentials.relay_url)?;
        if self.state.is_handshaking() {
            return Ok(ConnectRequest::AlreadyInProgress);
        }
        if self.state.is_authenticated() {
            return Ok(ConnectRequest::AlreadyConnected);
        }
        self.reconnect.reset();
        self.credentials = Some(credentials);
        self.begin_connect();
        Ok(ConnectRequest::Started)
    }

    fn on_disconnect(&mut self) {
        // Timers first, so nothing fires against the state cleared below.
        self.reconnect.reset();
        self.credentials = None;
        let was_disconnected = self.state == ConnectionState::Disconnected;
        self.teardown_transport();
        self.transition(ConnectionState::Disconnected);
        if !was_disconnected {
            tracing::info!(target = "session_relay::client", "disconnected by client");
            self.emit(ClientEvent::Disconnected {
                reason: "client disconnect".into(),
            });
        }
    }

    fn begin_connect(&mut self) {
        let Some(credentials) = self.credentials.clone() else {
            return;
        };
        let url = match normalize_relay_url(&credentials.relay_url) {
            Ok(url) => url,
            Err(error) => {
                self.fail_attempt(error);
                return;
            }
        };
        if !self.transition(ConnectionState::Connecting) {
            return;
        }

        self.generation += 1;
        self.step = Some(HandshakeStep::Opening);
        self.handshake_deadline = Some(Instant::now() + self.config.handshake_timeout);
        self.pre_auth.clear();

        tracing::info!(
            target = "session_relay::client",
            endpoint = %url,
            attempt = self.reconnect.attempts(),
            "opening transport"
        );
        let generation = self.generation;
        let connector = self.connector.clone();
        let opened_tx = self.opened_tx.clone();
        tokio::spawn(async move {
            let result = connector.connect(url).await;
            let _ = opened_tx.send(Opened { generation, result }).await;
        });
    }

    fn on_opened(&mut self, opened: Opened) {
        if opened.generation != self.generation || self.step != Some(HandshakeStep::Opening) {
            tracing::debug!(
                target = "session_relay::client",
                generation = opened.generation,
                "discarding transport from an abandoned attempt"
            );
            return;
        }
        let handle = match opened.result {
            Ok(handle) => handle,
            Err(error) => {
                self.fail_attempt(error);
                return;
            }
        };
        self.transport = Some(handle);

        let Some(credentials) = self.credentials.clone() else {
            self.fail_attempt(ClientError::MissingCredentials("credentials"));
            return;
        };
        let connect = RelayMessage::Connect(ConnectPayload {
            session_group_id: credentials.session_group_id,
            auth_key: credentials.auth_key,
            device_id: credentials.device_id,
            reconnect: self.reconnect.attempts() > 0,
        });
        if let Err(error) = self.write(&connect) {
            self.fail_attempt(error);
            return;
        }
        self.advance_step(HandshakeStep::AwaitingConnected);
    }

    fn advance_step(&mut self, step: HandshakeStep) {
        self.step = Some(step);
        self.handshake_deadline = Some(Instant::now() + self.config.handshake_timeout);
    }

    fn on_text(&mut self, text: &str) {
        let parsed = serde_json::from_str::<Value>(text)
            .map_err(ClientError::from)
            .and_then(|value| RelayMessage::from_control_value(value.clone()).map(|inbound| (inbound, value)));
        let (inbound, raw) = match parsed {
            Ok(parsed) => parsed,
            Err(error) => {
                if self.step.is_some() {
                    self.fail_attempt(error);
                } else {
                    tracing::warn!(
                        target = "session_relay::client",
                        error = %error,
                        raw = %text.chars().take(200).collect::<String>(),
                        "dropping malformed frame"
                    );
                }
                return;
            }
        };

        match self.step {
            Some(step) => self.on_handshake_message(step, inbound, raw),
            None => self.on_live_message(inbound, raw),
        }
    }

    fn on_handshake_message(&mut self, step: HandshakeStep, inbound: Inbound, raw: Value) {
        match (step, inbound) {
            (_, Inbound::Known(RelayMessage::Ping(ping))) => self.reply_pong(ping.timestamp),
            (_, Inbound::Known(RelayMessage::Pong(_))) => {}
            (HandshakeStep::AwaitingConnected, Inbound::Known(RelayMessage::Connected(connected))) => {
                self.emit(ClientEvent::Connected {
                    relay_version: connected.relay_version,
                    protocol_version: connected.protocol_version,
                });
                let Some(credentials) = self.credentials.clone() else {
                    self.fail_attempt(ClientError::MissingCredentials("credentials"));
                    return;
                };
                let auth = RelayMessage::Auth(AuthPayload {
                    auth_key: credentials.auth_key,
                    device_id: credentials.device_id,
                });
                if let Err(error) = self.write(&auth) {
                    self.fail_attempt(error);
                    return;
                }
                self.transition(ConnectionState::Authenticating);
                self.advance_step(HandshakeStep::AwaitingAuth);
            }
            (HandshakeStep::AwaitingAuth, Inbound::Known(RelayMessage::AuthSuccess(success))) => {
                self.complete_handshake(success);
            }
            (HandshakeStep::AwaitingAuth, Inbound::Known(RelayMessage::AuthError(error))) => {
                self.fail_attempt(ClientError::AuthenticationFailed(error.message));
            }
            (_, Inbound::Known(RelayMessage::Error(error))) => {
                self.fail_attempt(classify_relay_error(step, error));
            }
            (
                _,
                Inbound::Known(
                    message @ (RelayMessage::Connected(_)
                    | RelayMessage::AuthSuccess(_)
                    | RelayMessage::AuthError(_)),
                ),
            ) => {
                self.fail_attempt(ClientError::UnexpectedMessage {
                    expected: step.expects(),
                    got: message.type_name().to_string(),
                });
            }
            (_, inbound) => {
                if self.pre_auth.len() >= self.config.pre_auth_buffer.max(1) {
                    self.pre_auth.pop_front();
                    tracing::warn!(
                        target = "session_relay::client",
                        capacity = self.config.pre_auth_buffer,
                        "pre-auth buffer full; dropped oldest message"
                    );
                }
                self.pre_auth.push_back((inbound, raw));
            }
        }
    }

    fn complete_handshake(&mut self, success: AuthSuccessPayload) {
        self.step = None;
        self.handshake_deadline = None;
        if !self.transition(ConnectionState::Authenticated) {
            return;
        }
        self.reconnect.reset();
        self.host_offline = false;
        let now = Instant::now();
        self.ping.start(now);
        self.heartbeat.start(now);

        tracing::info!(
            target = "session_relay::client",
            host = ?success.host_name,
            restored = success.restored_subscriptions.len(),
            "authenticated"
        );
        self.emit(ClientEvent::Authenticated(success));

        let buffered: Vec<(Inbound, Value)> = self.pre_auth.drain(..).collect();
        for (inbound, raw) in buffered {
            self.on_live_message(inbound, raw);
        }

        if self.config.sync_on_authenticated {
            if let Err(error) = self.send_sync() {
                tracing::warn!(target = "session_relay::client", error = %error, "sync request failed");
            }
        }
    }

    fn on_live_message(&mut self, inbound: Inbound, raw: Value) {
        match inbound {
            Inbound::Known(RelayMessage::Ping(ping)) => self.reply_pong(ping.timestamp),
            Inbound::Known(RelayMessage::Pong(pong)) => {
                if !self.ping.on_pong(pong.timestamp) {
                    tracing::trace!(target = "session_relay::client", "ignoring unmatched pong");
                }
            }
            Inbound::Known(RelayMessage::HeartbeatAck(ack)) => {
                match self.heartbeat.on_ack(&ack.id, Instant::now()) {
                    Some(rtt) => {
                        if self.state != ConnectionState::Verified {
                            self.transition(ConnectionState::Verified);
                        }
                        self.emit(ClientEvent::Verified {
                            rtt_ms: u64::try_from(rtt.as_millis()).unwrap_or(u64::MAX),
                        });
                    }
                    None => tracing::debug!(
                        target = "session_relay::client",
                        id = %ack.id,
                        "ignoring heartbeat ack for unknown id"
                    ),
                }
            }
            Inbound::Known(RelayMessage::WorkstationOffline(_)) => {
                self.on_host_offline("workstation offline".into());
            }
            Inbound::Known(RelayMessage::Error(error)) if error.code == CODE_WORKSTATION_OFFLINE => {
                let reason = if error.message.is_empty() {
                    error.code
                } else {
                    error.message
                };
                self.on_host_offline(reason);
            }
            Inbound::Known(RelayMessage::WorkstationOnline(_)) => self.on_host_online(),
            Inbound::Known(
                message @ (RelayMessage::Connected(_)
                | RelayMessage::AuthSuccess(_)
                | RelayMessage::AuthError(_)),
            ) => {
                tracing::debug!(
                    target = "session_relay::client",
                    kind = message.type_name(),
                    "ignoring handshake message outside handshake"
                );
            }
            _ => match unwrap_forwarded(raw) {
                Ok(message) => self.emit(ClientEvent::Message(message)),
                Err(error) => tracing::warn!(
                    target = "session_relay::client",
                    error = %error,
                    "dropping undecodable forwarded message"
                ),
            },
        }
    }

    fn on_host_offline(&mut self, reason: String) {
        tracing::warn!(target = "session_relay::client", reason = %reason, "remote host offline");
        self.host_offline = true;
        self.heartbeat.pause();
        if self.state.is_authenticated() {
            self.transition(ConnectionState::Degraded(reason.clone()));
        }
        self.emit(ClientEvent::HostOffline { reason });
    }

    fn on_host_online(&mut self) {
        if !self.host_offline {
            return;
        }
        tracing::info!(target = "session_relay::client", "remote host back online");
        self.host_offline = false;
        self.heartbeat.start(Instant::now());
        self.emit(ClientEvent::HostOnline);
    }

    fn on_ping_due(&mut self) {
        let now = Instant::now();
        if !self.state.is_authenticated() || self.transport.is_none() {
            self.ping.stop();
            return;
        }
        if self.ping.is_awaiting_pong() {
            self.ping.defer(now);
            return;
        }
        self.send_ping(now);
    }

    fn send_ping(&mut self, now: Instant) {
        let timestamp = now_millis();
        let ping = RelayMessage::Ping(TimestampPayload {
            timestamp: Some(timestamp),
        });
        match self.write(&ping) {
            Ok(()) => self.ping.on_ping_sent(timestamp, now),
            Err(error) => self.connection_lost(&error.to_string()),
        }
    }

    fn reply_pong(&mut self, timestamp: Option<u64>) {
        let pong = RelayMessage::Pong(TimestampPayload { timestamp });
        if let Err(error) = self.write(&pong) {
            tracing::debug!(target = "session_relay::client", error = %error, "pong write failed");
        }
    }

    fn on_heartbeat_due(&mut self) {
        let now = Instant::now();
        if !self.state.is_authenticated() || self.host_offline {
            self.heartbeat.pause();
            return;
        }
        let Some(record) = self.heartbeat.begin(now) else {
            return;
        };
        let beat = RelayMessage::Heartbeat(HeartbeatPayload {
            id: record.id,
            timestamp: now_millis(),
        });
        if let Err(error) = self.write(&beat) {
            self.connection_lost(&error.to_string());
        }
    }

    fn on_heartbeat_timeout(&mut self) {
        match self.heartbeat.on_timeout() {
            HeartbeatTimeout::Degraded { missed } => {
                let reason = "host not answering heartbeats".to_string();
                tracing::warn!(target = "session_relay::client", missed, "heartbeat missed");
                self.transition(ConnectionState::Degraded(reason.clone()));
                self.emit(ClientEvent::Degraded { reason });
            }
            HeartbeatTimeout::Stale { missed } => {
                tracing::warn!(
                    target = "session_relay::client",
                    missed,
                    "connection stale; forcing full reconnect"
                );
                self.emit(ClientEvent::Stale { missed });
                self.connection_lost("heartbeat stale");
            }
        }
    }

    fn send_sync(&mut self) -> Result<String> {
        if !self.state.can_send() {
            return Err(ClientError::NotConnected);
        }
        let id = Uuid::new_v4().to_string();
        self.write(&RelayMessage::Sync(SyncPayload { id: id.clone() }))?;
        Ok(id)
    }

    fn send_raw(&mut self, text: String) -> Result<()> {
        if !self.state.can_send() {
            return Err(ClientError::NotConnected);
        }
        let transport = self.transport.as_ref().ok_or(ClientError::NotConnected)?;
        transport.write(text)
    }

    fn write(&self, message: &RelayMessage) -> Result<()> {
        let transport = self.transport.as_ref().ok_or(ClientError::NotConnected)?;
        transport.write(message.to_text())
    }

    /// A handshake attempt failed. Terminal errors park the client in
    /// `Error`; everything else is retried.
    fn fail_attempt(&mut self, error: ClientError) {
        if !error.is_terminal() {
            tracing::warn!(target = "session_relay::client", error = %error, "connect attempt failed");
            self.connection_lost(&error.to_string());
            return;
        }

        tracing::error!(target = "session_relay::client", error = %error, "connect attempt failed permanently");
        self.reconnect.cancel();
        self.teardown_transport();
        self.transition(ConnectionState::Error(error.to_string()));
        if let ClientError::RemoteOffline(reason) = &error {
            self.emit(ClientEvent::HostOffline {
                reason: reason.clone(),
            });
        }
        self.emit(ClientEvent::Disconnected {
            reason: error.to_string(),
        });
    }

    /// Tear the transport down and let the reconnection controller take over.
    fn connection_lost(&mut self, reason: &str) {
        self.teardown_transport();
        self.transition(ConnectionState::Disconnected);
        self.emit(ClientEvent::Disconnected {
            reason: reason.to_string(),
        });
        if let Some(delay) = self.reconnect.schedule(&self.state, Instant::now()) {
            let attempt = self.reconnect.attempts() + 1;
            tracing::info!(
                target = "session_relay::client",
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnect scheduled"
            );
            self.emit(ClientEvent::Reconnecting {
                attempt,
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            });
        }
    }

    fn teardown_transport(&mut self) {
        self.ping.stop();
        self.heartbeat.stop();
        self.handshake_deadline = None;
        self.path_probe_at = None;
        self.step = None;
        self.host_offline = false;
        self.pre_auth.clear();
        self.generation += 1;
        self.transport = None;
    }

    fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(&next) {
            tracing::warn!(
                target = "session_relay::client",
                from = %self.state,
                to = %next,
                "refusing illegal state transition"
            );
            return false;
        }
        tracing::debug!(target = "session_relay::client", from = %self.state, to = %next, "state change");
        self.state = next.clone();
        self.state_tx.send_replace(next.clone());
        self.emit(ClientEvent::StateChanged(next));
        true
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

fn classify_relay_error(step: HandshakeStep, error: ErrorPayload) -> ClientError {
    let detail = if error.message.is_empty() {
        error.code.clone()
    } else {
        format!("{}: {}", error.code, error.message)
    };
    match error.code.as_str() {
        CODE_WORKSTATION_OFFLINE | CODE_TUNNEL_NOT_FOUND => ClientError::RemoteOffline(detail),
        _ => ClientError::UnexpectedMessage {
            expected: step.expects(),
            got: format!("error({detail})"),
        },
    }
}

pub(crate) async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn next_transport_event(transport: &mut Option<TransportHandle>) -> TransportEvent {
    match transport {
        Some(handle) => handle
            .inbound
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed { reason: None }),
        None => pending().await,
    }
}
