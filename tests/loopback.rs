//! End-to-end: a real host served over WebSocket and a real client dialing it.

use std::{sync::Arc, time::Duration};

use serde_json::{json, Value};
use session_relay::{
    client::{ClientEvent, RelayClient},
    config::{BatcherConfig, ClientConfig, HostConfig, SessionConfig},
    host::HostService,
    server,
    state::{ConnectionState, Credentials},
    transport::WsConnector,
};
use tokio::{net::TcpListener, sync::broadcast, time::timeout};

async fn start_host(root: &std::path::Path) -> (String, Arc<HostService>) {
    let host = HostService::spawn(HostConfig {
        session_group_id: "grp".into(),
        auth_key: "secret".into(),
        host_name: "devbox".into(),
        host_version: "0.1.0".into(),
        workspaces_root: root.to_path_buf(),
        session: SessionConfig {
            program: "cat".into(),
            args: Vec::new(),
            default_working_dir: root.to_path_buf(),
            batcher: BatcherConfig::default(),
        },
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = Arc::clone(&host);
    tokio::spawn(async move {
        let _ = server::serve(listener, serving, std::future::pending()).await;
    });
    (format!("ws://{addr}/ws"), host)
}

async fn next_message(
    events: &mut broadcast::Receiver<ClientEvent>,
    kind: &str,
) -> Value {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ClientEvent::Message(message)) = events.recv().await {
                if message["type"] == kind {
                    return message;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {kind} message"))
}

#[tokio::test]
async fn client_drives_a_session_through_the_host() {
    let root = tempfile::tempdir().unwrap();
    let (url, host) = start_host(root.path()).await;

    let client = RelayClient::spawn(WsConnector, ClientConfig::default());
    let mut events = client.subscribe_events();
    client
        .connect(Credentials::new(url, "grp", "secret", "phone"))
        .await
        .unwrap();
    client
        .wait_for(ConnectionState::is_authenticated, Duration::from_secs(5))
        .await
        .unwrap();

    client
        .send(json!({"type": "session.create", "payload": {"cols": 80, "rows": 24}}))
        .await
        .unwrap();
    let created = next_message(&mut events, "session.created").await;
    let session_id = created["payload"]["session_id"].as_str().unwrap().to_string();
    assert_eq!(host.sessions().len(), 1);

    client
        .send(json!({"type": "session.input", "payload": {"session_id": session_id, "data": "over the wire\n"}}))
        .await
        .unwrap();
    let mut seen = String::new();
    while !seen.contains("over the wire") {
        let output = next_message(&mut events, "session.output").await;
        assert_eq!(output["payload"]["session_id"], session_id.as_str());
        seen.push_str(output["payload"]["data"].as_str().unwrap());
    }

    client
        .send(json!({"type": "session.close", "payload": {"session_id": session_id}}))
        .await
        .unwrap();
    let closed = next_message(&mut events, "session.closed").await;
    assert_eq!(closed["payload"]["session_id"], session_id.as_str());

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn wrong_key_ends_in_error_without_retry() {
    let root = tempfile::tempdir().unwrap();
    let (url, _host) = start_host(root.path()).await;

    let client = RelayClient::spawn(WsConnector, ClientConfig::default());
    client
        .connect(Credentials::new(url, "grp", "wrong", "phone"))
        .await
        .unwrap();
    let state = client
        .wait_for(|state| matches!(state, ConnectionState::Error(_)), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(state, ConnectionState::Error(_)));

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(matches!(client.state(), ConnectionState::Error(_)));
}

#[tokio::test]
async fn unknown_session_group_reports_host_offline() {
    let root = tempfile::tempdir().unwrap();
    let (url, _host) = start_host(root.path()).await;

    let client = RelayClient::spawn(WsConnector, ClientConfig::default());
    let mut events = client.subscribe_events();
    client
        .connect(Credentials::new(url, "elsewhere", "secret", "phone"))
        .await
        .unwrap();

    let offline = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ClientEvent::HostOffline { reason }) = events.recv().await {
                return reason;
            }
        }
    })
    .await
    .unwrap();
    assert!(!offline.is_empty());
    assert!(matches!(client.state(), ConnectionState::Error(_)));
}
