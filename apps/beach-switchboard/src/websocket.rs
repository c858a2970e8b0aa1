use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use switchboard_core::{ClientMessage, EndpointId, ServerMessage, SignalingError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::EndpointSender;
use crate::router::SignalingRouter;
use crate::AppState;

/// WebSocket upgrade handler for `/ws`.
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.router))
}

/// One socket, one endpoint. Frames are dispatched in arrival order and the
/// endpoint is disconnected only after the read loop ends.
async fn handle_socket(socket: WebSocket, router: SignalingRouter) {
    let connection_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to encode relay frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(connection = %connection_id, "writer task finished");
    });

    counter!("switchboard_connections_total").increment(1);
    debug!(connection = %connection_id, "websocket connected");

    let mut connection = Connection {
        id: connection_id,
        router,
        tx,
        identity: None,
    };

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    debug!(connection = %connection_id, "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => {
                debug!(connection = %connection_id, "client closed websocket");
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                debug!(connection = %connection_id, error = %err, "websocket receive error");
                break;
            }
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => connection.handle(message),
            Err(err) => {
                counter!("switchboard_frames_rejected_total").increment(1);
                warn!(connection = %connection_id, error = %err, "unparseable client frame");
                connection.reply(ServerMessage::Error {
                    message: format!("invalid message format: {err}"),
                });
            }
        }
    }

    connection.close();
    writer.abort();
}

struct Connection {
    id: Uuid,
    router: SignalingRouter,
    tx: EndpointSender,
    identity: Option<EndpointId>,
}

impl Connection {
    fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Register { id } => self.register(id),
            message => {
                let Some(identity) = self.identity.clone() else {
                    if matches!(message, ClientMessage::Ping) {
                        self.reply(ServerMessage::Pong);
                    } else {
                        self.reply_error(&SignalingError::NotRegistered);
                    }
                    return;
                };
                if let Err(err) = self.router.dispatch(&identity, message) {
                    self.reply_error(&err);
                }
            }
        }
    }

    fn register(&mut self, requested: Option<EndpointId>) {
        if let Some(current) = &self.identity {
            if self.router.registry().is_held_by(current, &self.tx) {
                counter!("switchboard_protocol_violations_total").increment(1);
                warn!(connection = %self.id, endpoint = %current, "register on registered socket");
                self.reply(ServerMessage::Error {
                    message: format!("already registered as {current}"),
                });
                return;
            }
        }

        match self.router.connect(requested, self.tx.clone()) {
            Ok(registration) => {
                info!(
                    connection = %self.id,
                    endpoint = %registration.id,
                    active = registration.active,
                    "endpoint registered"
                );
                self.identity = Some(registration.id);
            }
            Err(err) => {
                counter!(
                    "switchboard_registrations_rejected_total",
                    "reason" => err.metric_label()
                )
                .increment(1);
                warn!(connection = %self.id, error = %err, "registration refused");
                self.reply_error(&err);
            }
        }
    }

    fn reply(&self, message: ServerMessage) {
        let _ = self.tx.send(message);
    }

    fn reply_error(&self, err: &SignalingError) {
        self.reply(ServerMessage::Error {
            message: err.to_string(),
        });
    }

    fn close(self) {
        if let Some(identity) = &self.identity {
            if self.router.registry().is_held_by(identity, &self.tx) {
                self.router.disconnect(identity);
            }
        }
        debug!(connection = %self.id, "websocket disconnected");
    }
}
