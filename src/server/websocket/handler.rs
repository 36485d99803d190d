//! WebSocket route handler.
//!
//! Handles the upgrade, the message loop and session cleanup.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::messages::{feed, msg_types, system, ClientMessage, ServerMessage};
use crate::error::RegistryError;
use crate::hub::HubEvent;
use crate::server::state::GuardedHub;

const OUTGOING_CHANNEL_SIZE: usize = 32;

/// Route handler for `GET /v1/ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<GuardedHub>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: GuardedHub) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    debug!("WebSocket connected: {}", connection_id);

    let (outgoing_tx, outgoing_rx) = mpsc::channel::<ServerMessage>(OUTGOING_CHANNEL_SIZE);
    let (ws_sink, ws_stream) = socket.split();

    let connected_msg = ServerMessage::new(
        msg_types::CONNECTED,
        system::Connected {
            connection_id: connection_id.clone(),
            server_version: format!("{}-{}", env!("CARGO_PKG_VERSION"), env!("GIT_HASH")),
        },
    );

    // Forward outgoing messages to the socket in their own task.
    let outgoing_handle = tokio::spawn(forward_outgoing(ws_sink, outgoing_rx, connected_msg));

    let session_id = process_incoming(ws_stream, &hub, &outgoing_tx).await;

    debug!("WebSocket disconnected: {}", connection_id);
    outgoing_handle.abort();
    if let Some(session_id) = session_id {
        hub.disconnect(&session_id);
    }
}

/// Forward messages from the outgoing channel to the WebSocket.
async fn forward_outgoing(
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outgoing_rx: mpsc::Receiver<ServerMessage>,
    initial_msg: ServerMessage,
) {
    if let Ok(json) = serde_json::to_string(&initial_msg) {
        if ws_sink.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    while let Some(msg) = outgoing_rx.recv().await {
        match serde_json::to_string(&msg) {
            Ok(json) => {
                if ws_sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("Failed to serialize WebSocket message: {}", e);
            }
        }
    }
}

/// Process incoming messages until the socket closes.
///
/// Returns the session id this connection subscribed as, if any.
async fn process_incoming(
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    hub: &GuardedHub,
    outgoing_tx: &mpsc::Sender<ServerMessage>,
) -> Option<String> {
    let mut session_id: Option<String> = None;

    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => {
                    handle_client_message(msg, hub, outgoing_tx, &mut session_id).await;
                }
                Err(e) => {
                    debug!("Failed to parse client message: {}", e);
                    let error_msg = ServerMessage::new(
                        msg_types::ERROR,
                        system::Error::new("parse_error", format!("Invalid message format: {}", e)),
                    );
                    let _ = outgoing_tx.send(error_msg).await;
                }
            },
            Ok(Message::Binary(_)) => {
                debug!("Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // Tungstenite answers protocol-level pings itself.
            }
            Ok(Message::Close(_)) => {
                debug!("Received close frame");
                break;
            }
            Err(e) => {
                debug!("WebSocket error: {}", e);
                break;
            }
        }
    }
    session_id
}

async fn handle_client_message(
    msg: ClientMessage,
    hub: &GuardedHub,
    outgoing_tx: &mpsc::Sender<ServerMessage>,
    session_id: &mut Option<String>,
) {
    match msg.msg_type.as_str() {
        msg_types::SUBSCRIBE => match serde_json::from_value::<feed::SubscribePayload>(msg.payload)
        {
            Ok(payload) => {
                match hub.subscribe(&payload.session_id, payload.from_sequence) {
                    Ok(feed_rx) => {
                        *session_id = Some(payload.session_id);
                        tokio::spawn(pump_feed(feed_rx, outgoing_tx.clone()));
                    }
                    Err(RegistryError::DeliveryGap(reason)) => {
                        let _ = outgoing_tx
                            .send(ServerMessage::new(
                                msg_types::MUST_RESYNC,
                                feed::MustResync { message: reason },
                            ))
                            .await;
                    }
                    Err(e) => {
                        let _ = outgoing_tx
                            .send(ServerMessage::new(
                                msg_types::ERROR,
                                system::Error::new(e.code(), e.to_string()),
                            ))
                            .await;
                    }
                }
            }
            Err(e) => {
                let _ = outgoing_tx
                    .send(ServerMessage::new(
                        msg_types::ERROR,
                        system::Error::new(
                            "invalid_payload",
                            format!("Invalid subscribe payload: {}", e),
                        ),
                    ))
                    .await;
            }
        },

        msg_types::ACK => match serde_json::from_value::<feed::AckPayload>(msg.payload) {
            Ok(payload) => match session_id {
                Some(id) => hub.ack(id, payload.sequence),
                None => {
                    let _ = outgoing_tx
                        .send(ServerMessage::new(
                            msg_types::ERROR,
                            system::Error::new("not_subscribed", "Ack before subscribe"),
                        ))
                        .await;
                }
            },
            Err(e) => {
                let _ = outgoing_tx
                    .send(ServerMessage::new(
                        msg_types::ERROR,
                        system::Error::new("invalid_payload", format!("Invalid ack payload: {}", e)),
                    ))
                    .await;
            }
        },

        msg_types::UNSUBSCRIBE => {
            if let Some(id) = session_id.take() {
                hub.unsubscribe(&id);
            }
        }

        msg_types::PING => {
            if let Some(id) = session_id {
                hub.heartbeat(id);
            }
            let _ = outgoing_tx
                .send(ServerMessage::new(msg_types::PONG, system::Pong))
                .await;
        }

        other => {
            debug!("Unknown message type: {}", other);
            let _ = outgoing_tx
                .send(ServerMessage::new(
                    msg_types::ERROR,
                    system::Error::new("unknown_type", format!("Unknown message type: {}", other)),
                ))
                .await;
        }
    }
}

/// Translate hub events into wire messages. Ends when either side closes.
async fn pump_feed(mut feed_rx: mpsc::Receiver<HubEvent>, outgoing_tx: mpsc::Sender<ServerMessage>) {
    while let Some(event) = feed_rx.recv().await {
        let msg = match event {
            HubEvent::Change(record) => ServerMessage::new(msg_types::SKILL_CHANGED, record),
            HubEvent::CatchUpComplete { through } => ServerMessage::new(
                msg_types::CATCH_UP_COMPLETE,
                feed::CatchUpComplete { through },
            ),
        };
        if outgoing_tx.send(msg).await.is_err() {
            return;
        }
    }
}
