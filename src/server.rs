use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::broadcast};

use crate::host::HostService;

pub fn router(host: Arc<HostService>) -> Router {
    Router::new()
        .route("/health", routing::get(health))
        .route("/ws", routing::get(host_ws))
        .with_state(host)
}

/// Serve until `shutdown` resolves, then close every session.
pub async fn serve(
    listener: TcpListener,
    host: Arc<HostService>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(target = "session_relay::server", %addr, "session host listening");
    axum::serve(listener, router(Arc::clone(&host)))
        .with_graceful_shutdown(shutdown)
        .await?;
    host.shutdown();
    tracing::info!(target = "session_relay::server", "session host stopped");
    Ok(())
}

async fn health(State(host): State<Arc<HostService>>) -> axum::Json<Value> {
    axum::Json(json!({
        "status": "ok",
        "session_group_id": host.config().session_group_id,
        "sessions": host.sessions().len(),
        "uptime_ms": host.uptime_ms(),
    }))
}

async fn host_ws(ws: WebSocketUpgrade, State(host): State<Arc<HostService>>) -> impl IntoResponse {
    let output = host.subscribe_output();
    ws.on_upgrade(move |socket| handle_socket(socket, host, output))
}

async fn handle_socket(
    socket: WebSocket,
    host: Arc<HostService>,
    mut output: broadcast::Receiver<String>,
) {
    let mut connection = host.connection();
    let (mut sink, mut stream) = socket.split();
    tracing::debug!(target = "session_relay::server", "client socket opened");

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(error)) => {
                        tracing::debug!(target = "session_relay::server", error = %error, "socket read failed");
                        break;
                    }
                };
                let mut failed = false;
                for reply in connection.handle_text(&text) {
                    if sink.send(Message::Text(reply.to_text().into())).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break;
                }
            }
            frame = output.recv() => match frame {
                Ok(frame) => {
                    if !connection.is_authenticated() {
                        continue;
                    }
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(target = "session_relay::server", skipped, "client lagged; dropped session output");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    tracing::debug!(
        target = "session_relay::server",
        device_id = connection.device_id().unwrap_or("-"),
        "client socket closed"
    );
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::router;
    use crate::{
        config::{BatcherConfig, HostConfig, SessionConfig},
        host::HostService,
    };

    #[tokio::test]
    async fn health_reports_session_count() {
        let root = tempfile::tempdir().unwrap();
        let host = HostService::spawn(HostConfig {
            session_group_id: "grp".into(),
            auth_key: "secret".into(),
            host_name: "devbox".into(),
            host_version: "0.1.0".into(),
            workspaces_root: root.path().to_path_buf(),
            session: SessionConfig {
                program: "cat".into(),
                args: Vec::new(),
                default_working_dir: root.path().to_path_buf(),
                batcher: BatcherConfig::default(),
            },
        });

        let response = router(host)
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .method("GET")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
        assert_eq!(body["session_group_id"], "grp");
    }

    #[tokio::test]
    async fn ws_route_requires_upgrade() {
        let root = tempfile::tempdir().unwrap();
        let host = HostService::spawn(HostConfig {
            session_group_id: "grp".into(),
            auth_key: "secret".into(),
            host_name: "devbox".into(),
            host_version: "0.1.0".into(),
            workspaces_root: root.path().to_path_buf(),
            session: SessionConfig {
                program: "cat".into(),
                args: Vec::new(),
                default_working_dir: root.path().to_path_buf(),
                batcher: BatcherConfig::default(),
            },
        });
        let response = router(host)
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
