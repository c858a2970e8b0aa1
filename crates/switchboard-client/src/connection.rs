use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use switchboard_core::{ClientMessage, ServerMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// Keeps the relay's idle reaper away from quiet endpoints.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("timed out connecting to {0}")]
    Timeout(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Reliable, ordered message channel to the relay over one WebSocket.
pub struct SignalingConnection {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SignalingConnection {
    /// `url` is the relay's WebSocket endpoint, e.g. `ws://127.0.0.1:8090/ws`.
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self, ConnectionError> {
        let (stream, _) = match timeout(connect_timeout, connect_async(url)).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout(url.to_string())),
        };
        debug!(%url, "connected to relay");
        let (mut sink, mut source) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<ServerMessage>();

        let writer = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            // first tick completes immediately
            heartbeat.tick().await;
            loop {
                let message = tokio::select! {
                    message = outbound_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                    _ = heartbeat.tick() => ClientMessage::Ping,
                };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode client frame");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(error = %err, "relay socket error");
                        break;
                    }
                };
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "unparseable relay frame"),
                }
            }
            debug!("relay reader finished");
        });

        Ok(Self {
            outbound,
            inbound,
            reader,
            writer,
        })
    }

    /// Splits into the channel halves, leaving the pump tasks running.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        (self.outbound, self.inbound)
    }

    /// Drops the socket immediately, as an abrupt disconnect would.
    pub fn abort(self) {
        self.reader.abort();
        self.writer.abort();
    }
}
