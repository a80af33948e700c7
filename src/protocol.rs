//! Wire envelope catalogue shared by the client, the relay and the host.
//!
//! Every frame is a JSON object `{"type": .., "payload": {..}}`. Some peers put
//! fields such as `id` or `timestamp` at the top level instead of inside the
//! payload; [`RelayMessage::from_value`] folds those into the payload before
//! decoding so both shapes are accepted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ClientError, Result};

pub const PROTOCOL_VERSION: u32 = 1;

pub const CODE_WORKSTATION_OFFLINE: &str = "WORKSTATION_OFFLINE";
pub const CODE_TUNNEL_NOT_FOUND: &str = "TUNNEL_NOT_FOUND";
pub const CODE_UNAUTHENTICATED: &str = "UNAUTHENTICATED";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectPayload {
    pub session_group_id: String,
    pub auth_key: String,
    pub device_id: String,
    #[serde(default)]
    pub reconnect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedPayload {
    pub session_group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub auth_key: String,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSuccessPayload {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspaces_root: Option<String>,
    #[serde(default)]
    pub restored_subscriptions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampPayload {
    #[serde(default)]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAckPayload {
    pub id: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub remote_uptime_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionGroupPayload {
    #[serde(default)]
    pub session_group_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub id: String,
}

/// Snapshot of one host session, as reported by `session.created` and `sync.state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_device_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatePayload {
    pub id: String,
    #[serde(default)]
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreatePayload {
    pub cols: u16,
    pub rows: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDataPayload {
    pub session_id: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
    pub device_id: String,
}

/// Outcome of a resize request. A rejected request still reports the
/// session's current dimensions so the requester can reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeResult {
    pub success: bool,
    pub cols: u16,
    pub rows: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResizedPayload {
    pub session_id: String,
    #[serde(flatten)]
    pub result: ResizeResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRefPayload {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RelayMessage {
    #[serde(rename = "connect")]
    Connect(ConnectPayload),
    #[serde(rename = "connected")]
    Connected(ConnectedPayload),
    #[serde(rename = "auth")]
    Auth(AuthPayload),
    #[serde(rename = "auth.success")]
    AuthSuccess(AuthSuccessPayload),
    #[serde(rename = "auth.error")]
    AuthError(MessagePayload),
    #[serde(rename = "error")]
    Error(ErrorPayload),
    #[serde(rename = "ping")]
    Ping(TimestampPayload),
    #[serde(rename = "pong")]
    Pong(TimestampPayload),
    #[serde(rename = "heartbeat")]
    Heartbeat(HeartbeatPayload),
    #[serde(rename = "heartbeat.ack")]
    HeartbeatAck(HeartbeatAckPayload),
    #[serde(rename = "connection.workstation_offline")]
    WorkstationOffline(SessionGroupPayload),
    #[serde(rename = "connection.workstation_online")]
    WorkstationOnline(SessionGroupPayload),
    #[serde(rename = "forward.session_output")]
    ForwardSessionOutput(Value),
    #[serde(rename = "sync")]
    Sync(SyncPayload),
    #[serde(rename = "sync.state")]
    SyncState(SyncStatePayload),
    #[serde(rename = "session.create")]
    SessionCreate(SessionCreatePayload),
    #[serde(rename = "session.created")]
    SessionCreated(SessionInfo),
    #[serde(rename = "session.input")]
    SessionInput(SessionDataPayload),
    #[serde(rename = "session.output")]
    SessionOutput(SessionDataPayload),
    #[serde(rename = "session.resize")]
    SessionResize(ResizeRequest),
    #[serde(rename = "session.resized")]
    SessionResized(SessionResizedPayload),
    #[serde(rename = "session.close")]
    SessionClose(SessionRefPayload),
    #[serde(rename = "session.closed")]
    SessionClosed(SessionRefPayload),
}

const KNOWN_TYPES: &[&str] = &[
    "connect",
    "connected",
    "auth",
    "auth.success",
    "auth.error",
    "error",
    "ping",
    "pong",
    "heartbeat",
    "heartbeat.ack",
    "connection.workstation_offline",
    "connection.workstation_online",
    "forward.session_output",
    "sync",
    "sync.state",
    "session.create",
    "session.created",
    "session.input",
    "session.output",
    "session.resize",
    "session.resized",
    "session.close",
    "session.closed",
];

/// Types a client interprets itself. Everything else it receives is
/// application data and only needs its `type` string.
const CONTROL_TYPES: &[&str] = &[
    "connected",
    "auth.success",
    "auth.error",
    "error",
    "ping",
    "pong",
    "heartbeat.ack",
    "connection.workstation_offline",
    "connection.workstation_online",
];

/// A decoded inbound frame. Frames the reader does not interpret are passed
/// through untouched so the application can.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Known(RelayMessage),
    Unknown(Value),
}

impl RelayMessage {
    pub fn is_known_type(kind: &str) -> bool {
        KNOWN_TYPES.contains(&kind)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Connected(_) => "connected",
            Self::Auth(_) => "auth",
            Self::AuthSuccess(_) => "auth.success",
            Self::AuthError(_) => "auth.error",
            Self::Error(_) => "error",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Heartbeat(_) => "heartbeat",
            Self::HeartbeatAck(_) => "heartbeat.ack",
            Self::WorkstationOffline(_) => "connection.workstation_offline",
            Self::WorkstationOnline(_) => "connection.workstation_online",
            Self::ForwardSessionOutput(_) => "forward.session_output",
            Self::Sync(_) => "sync",
            Self::SyncState(_) => "sync.state",
            Self::SessionCreate(_) => "session.create",
            Self::SessionCreated(_) => "session.created",
            Self::SessionInput(_) => "session.input",
            Self::SessionOutput(_) => "session.output",
            Self::SessionResize(_) => "session.resize",
            Self::SessionResized(_) => "session.resized",
            Self::SessionClose(_) => "session.close",
            Self::SessionClosed(_) => "session.closed",
        }
    }

    /// Decode a text frame.
    pub fn parse(text: &str) -> Result<Inbound> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Decode an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Inbound> {
        let Value::Object(mut object) = value else {
            return Err(ClientError::MalformedMessage(
                "envelope must be a JSON object".into(),
            ));
        };
        let kind = match object.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => {
                return Err(ClientError::MalformedMessage(
                    "envelope is missing a string `type`".into(),
                ))
            }
        };
        if !Self::is_known_type(&kind) {
            return Ok(Inbound::Unknown(Value::Object(object)));
        }

        fold_top_level_fields(&mut object);
        let normalized = Value::Object(object);
        serde_json::from_value::<RelayMessage>(normalized)
            .map(Inbound::Known)
            .map_err(|err| ClientError::MalformedMessage(format!("{kind}: {err}")))
    }

    /// Client-side decoding: only connection control types are decoded
    /// strictly. Any other envelope with a string `type` is passed through as
    /// [`Inbound::Unknown`], whatever its payload shape.
    pub fn from_control_value(value: Value) -> Result<Inbound> {
        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.as_str(),
            _ if !value.is_object() => {
                return Err(ClientError::MalformedMessage(
                    "envelope must be a JSON object".into(),
                ))
            }
            _ => {
                return Err(ClientError::MalformedMessage(
                    "envelope is missing a string `type`".into(),
                ))
            }
        };
        if CONTROL_TYPES.contains(&kind) {
            Self::from_value(value)
        } else {
            Ok(Inbound::Unknown(value))
        }
    }

    pub fn to_value(&self) -> Value {
        // Serializing these plain data types cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }
}

/// Move top-level fields other than `type`/`payload` into the payload object,
/// without overwriting keys the payload already carries.
fn fold_top_level_fields(object: &mut Map<String, Value>) {
    let extras: Vec<(String, Value)> = object
        .iter()
        .filter(|(key, _)| key.as_str() != "type" && key.as_str() != "payload")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let payload = object
        .entry("payload")
        .or_insert_with(|| Value::Object(Map::new()));
    if payload.is_null() {
        *payload = Value::Object(Map::new());
    }
    if let Value::Object(inner) = payload {
        for (key, value) in extras {
            inner.entry(key).or_insert(value);
        }
    }
    object.retain(|key, _| key == "type" || key == "payload");
}

/// Unwrap a `forward.session_output` envelope whose payload is either a
/// JSON-encoded string or an already-structured object. Any other value is
/// returned unchanged.
pub fn unwrap_forwarded(value: Value) -> Result<Value> {
    let is_forward = value.get("type").and_then(Value::as_str) == Some("forward.session_output");
    if !is_forward {
        return Ok(value);
    }
    match value.get("payload") {
        Some(Value::String(encoded)) => Ok(serde_json::from_str(encoded)?),
        Some(inner @ Value::Object(_)) => Ok(inner.clone()),
        _ => Err(ClientError::MalformedMessage(
            "forward.session_output without payload".into(),
        )),
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
