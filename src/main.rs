use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    sync::broadcast,
};

use session_relay::{
    client::{ClientEvent, RelayClient},
    config::{Cli, Commands, ConnectArgs, ServeArgs},
    delivery::{Command, CommandSender, SendOutcome},
    events::{init_logging, EventEmitter},
    host::HostService,
    server,
    transport::WsConnector,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let emitter = EventEmitter::new(cli.json_output);

    match cli.command {
        Commands::Connect(args) => run_connect(args, emitter).await,
        Commands::Serve(args) => run_serve(args).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = args.host_config()?;
    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    let host = HostService::spawn(config);
    server::serve(listener, host, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!(target = "session_relay::server", "received ctrl-c, shutting down");
    })
    .await
}

async fn run_connect(args: ConnectArgs, emitter: EventEmitter) -> Result<()> {
    let credentials = args.credentials();
    let client = RelayClient::spawn(WsConnector, args.profile.client_config());
    let sender = Arc::new(CommandSender::new(client.clone(), Default::default()));
    let drain = sender.spawn_drain_on_connect(client.subscribe_state());

    let events = tokio::spawn(print_events(client.subscribe_events(), emitter.clone()));

    let request = client.connect(credentials).await?;
    tracing::info!(target = "session_relay::client", ?request, "connect requested");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                handle_input_line(line, &client, &sender, args.max_retries, &emitter).await;
            }
        }
    }

    client.disconnect().await;
    drain.abort();
    events.abort();
    Ok(())
}

/// One stdin line: either a `/command` or a JSON envelope to deliver.
async fn handle_input_line(
    line: &str,
    client: &RelayClient,
    sender: &CommandSender<RelayClient>,
    max_retries: u32,
    emitter: &EventEmitter,
) {
    match line {
        "/sync" => match client.request_sync().await {
            Ok(id) => emitter.emit("sync_requested", serde_json::json!({ "id": id })),
            Err(error) => tracing::warn!(target = "session_relay::client", error = %error, "sync failed"),
        },
        "/path-changed" => client.network_path_changed(),
        "/state" => emitter.emit("state", serde_json::json!({ "state": client.state().to_string() })),
        _ => {
            let payload: Value = match serde_json::from_str(line) {
                Ok(payload) => payload,
                Err(error) => {
                    tracing::warn!(target = "session_relay::client", error = %error, "ignoring input that is not JSON");
                    return;
                }
            };
            let label = payload
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("message")
                .to_string();
            let mut command = Command::new(label, payload).with_max_retries(max_retries);
            if let Some(session_id) = command
                .payload
                .pointer("/payload/session_id")
                .and_then(Value::as_str)
                .map(str::to_string)
            {
                command = command.for_session(session_id);
            }
            match sender.send(command).await {
                SendOutcome::Sent => {}
                SendOutcome::Queued => emitter.emit("queued", serde_json::json!({ "queued": sender.queued() })),
                SendOutcome::Failed(reason) => emitter.emit("send_failed", serde_json::json!({ "reason": reason })),
            }
        }
    }
}

async fn print_events(mut events: broadcast::Receiver<ClientEvent>, emitter: EventEmitter) {
    loop {
        match events.recv().await {
            Ok(event) => emitter.emit_client_event(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(target = "session_relay::events", skipped, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
