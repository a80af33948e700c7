use std::io::{self, Write};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::{fmt, EnvFilter};

use crate::client::ClientEvent;

/// Install the global subscriber. `RUST_LOG` wins over `--log-level`.
pub fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(true)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Writes one JSON object per line to stdout for scripted consumers.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    json_output: bool,
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }

    pub fn emit<T: Serialize>(&self, event_type: &str, payload: T) {
        if !self.json_output {
            return;
        }
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{}", event_line(event_type, payload));
    }

    pub fn emit_client_event(&self, event: &ClientEvent) {
        if self.json_output {
            self.emit(event.kind(), client_event_payload(event));
        } else {
            tracing::info!(target = "session_relay::events", kind = event.kind(), payload = %client_event_payload(event));
        }
    }
}

fn event_line<T: Serialize>(event_type: &str, payload: T) -> Value {
    json!({
        "ts": Utc::now().to_rfc3339(),
        "type": event_type,
        "payload": payload,
    })
}

pub fn client_event_payload(event: &ClientEvent) -> Value {
    match event {
        ClientEvent::StateChanged(state) => json!({ "state": state.to_string() }),
        ClientEvent::Connected {
            relay_version,
            protocol_version,
        } => json!({ "relay_version": relay_version, "protocol_version": protocol_version }),
        ClientEvent::Authenticated(success) => json!(success),
        ClientEvent::Message(message) => message.clone(),
        ClientEvent::Disconnected { reason }
        | ClientEvent::HostOffline { reason }
        | ClientEvent::Degraded { reason } => json!({ "reason": reason }),
        ClientEvent::HostOnline => json!({}),
        ClientEvent::Verified { rtt_ms } => json!({ "rtt_ms": rtt_ms }),
        ClientEvent::Stale { missed } => json!({ "missed": missed }),
        ClientEvent::Reconnecting { attempt, delay_ms } => {
            json!({ "attempt": attempt, "delay_ms": delay_ms })
        }
    }
}
