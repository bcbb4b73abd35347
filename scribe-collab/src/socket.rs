//! WebSocket signaling transport for the pub/sub gateway.
//!
//! Speaks a small JSON frame protocol with the signaling server:
//! outbound `{"type": "subscribe" | "unsubscribe", "channel": ...}`,
//! inbound `{"channel": ..., "event": ..., "payload": ...}`. A writer task
//! forwards queued frames to the socket; a reader task pumps deliveries
//! into the gateway's dispatch loop.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::pubsub::{PubSubError, SignalConnection, SignalConnector, SignalEvent};

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientFrame<'a> {
    Subscribe { channel: &'a str },
    Unsubscribe { channel: &'a str },
}

#[derive(Debug, Deserialize)]
struct ServerFrame {
    channel: String,
    event: String,
    payload: serde_json::Value,
}

/// Connector dialing a signaling server over WebSocket.
pub struct SocketConnector {
    url: String,
    handshake_window: Duration,
}

impl SocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            handshake_window: Duration::from_secs(10),
        }
    }

    pub fn with_handshake_window(mut self, window: Duration) -> Self {
        self.handshake_window = window;
        self
    }
}

#[async_trait]
impl SignalConnector for SocketConnector {
    async fn connect(&self) -> Result<Box<dyn SignalConnection>, PubSubError> {
        let connect = tokio_tungstenite::connect_async(&self.url);
        let (ws_stream, _) = tokio::time::timeout(self.handshake_window, connect)
            .await
            .map_err(|_| {
                PubSubError::Connection(format!(
                    "handshake window ({:?}) elapsed for {}",
                    self.handshake_window, self.url
                ))
            })?
            .map_err(|e| PubSubError::Connection(e.to_string()))?;

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward queued frames to the socket.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: decode deliveries into gateway events.
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerFrame>(text.as_str()) {
                            Ok(frame) => {
                                let delivered = incoming_tx.send(SignalEvent {
                                    channel: frame.channel,
                                    event: frame.event,
                                    payload: frame.payload,
                                });
                                if delivered.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Signal: undecodable frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::info!("Signal: socket closed");
        });

        log::info!("Signal: connected to {}", self.url);
        Ok(Box::new(SocketConnection {
            out_tx,
            incoming: Some(incoming_rx),
            reader,
            writer,
        }))
    }
}

struct SocketConnection {
    out_tx: mpsc::UnboundedSender<String>,
    incoming: Option<mpsc::UnboundedReceiver<SignalEvent>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SocketConnection {
    fn send_frame(&self, frame: &ClientFrame<'_>) -> Result<(), PubSubError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| PubSubError::Channel(e.to_string()))?;
        self.out_tx
            .send(text)
            .map_err(|_| PubSubError::Channel("socket writer gone".into()))
    }
}

#[async_trait]
impl SignalConnection for SocketConnection {
    async fn open_channel(&self, channel: &str) -> Result<(), PubSubError> {
        self.send_frame(&ClientFrame::Subscribe { channel })
    }

    async fn close_channel(&self, channel: &str) {
        // Best effort; the connection may already be on its way down.
        let _ = self.send_frame(&ClientFrame::Unsubscribe { channel });
    }

    fn take_incoming(&mut self) -> Option<mpsc::UnboundedReceiver<SignalEvent>> {
        self.incoming.take()
    }

    fn shutdown(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}
