//! Transport abstraction owned by the connection actor.
//!
//! A [`Connector`] opens one transport and hands back a [`TransportHandle`]:
//! a pair of channels carrying text frames. The WebSocket implementation runs
//! its socket loop on a spawned task; tests substitute an in-memory connector.

use std::future::Future;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::{ClientError, Result};

const OUTBOUND_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 1024;

/// Events surfaced by an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Closed { reason: Option<String> },
}

/// Both ends of one open transport, exclusively owned by the connection actor.
/// Dropping the handle closes the transport.
#[derive(Debug)]
pub struct TransportHandle {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

impl TransportHandle {
    /// Queue a frame for writing without waiting.
    pub fn write(&self, text: String) -> Result<()> {
        self.outbound.try_send(text).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                ClientError::TransportClosed("outbound buffer full".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                ClientError::TransportClosed("writer task gone".into())
            }
        })
    }
}

pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: String) -> impl Future<Output = Result<TransportHandle>> + Send;
}

/// Dials the relay over WebSocket (TLS via rustls for `wss://`).
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: String) -> impl Future<Output = Result<TransportHandle>> + Send {
        async move {
            let (ws, _) = connect_async(url.as_str()).await?;
            let (mut write, mut read) = ws.split();
            let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
            let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(INBOUND_CAPACITY);

            tokio::spawn(async move {
                let reason = loop {
                    tokio::select! {
                        out = outbound_rx.recv() => {
                            match out {
                                Some(text) => {
                                    if let Err(error) = write.send(Message::Text(text)).await {
                                        tracing::warn!(target = "session_relay::transport", error = %error, "ws write failed");
                                        break Some(error.to_string());
                                    }
                                }
                                None => {
                                    let _ = write.close().await;
                                    tracing::debug!(target = "session_relay::transport", "transport handle dropped; socket closed");
                                    return;
                                }
                            }
                        }
                        frame = read.next() => {
                            match frame {
                                Some(Ok(Message::Text(text))) => {
                                    if inbound_tx.send(TransportEvent::Text(text)).await.is_err() {
                                        let _ = write.close().await;
                                        return;
                                    }
                                }
                                Some(Ok(Message::Close(frame))) => {
                                    break frame.map(|f| f.reason.to_string());
                                }
                                None => break None,
                                Some(Err(error)) => {
                                    tracing::warn!(target = "session_relay::transport", error = %error, "ws read error");
                                    break Some(error.to_string());
                                }
                                Some(Ok(_)) => {}
                            }
                        }
                    }
                };
                let _ = inbound_tx.send(TransportEvent::Closed { reason }).await;
            });

            Ok(TransportHandle {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        }
    }
}
