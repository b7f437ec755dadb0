//! WebSocket stream of domain events for kitchen and floor screens
//!
//! `GET /api/events/ws?table_id=3` forwards events for one table;
//! without the parameter every event is forwarded.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::models::event::DomainEvent;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub table_id: Option<i32>,
}

/// Client → server control message
#[derive(Debug, Clone, Deserialize)]
pub struct WsControl {
    /// ping | unsubscribe
    pub action: String,
}

/// Server → client message
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    #[serde(rename = "subscribed")]
    Subscribed { table_id: Option<i32> },
    #[serde(rename = "event")]
    Event { event: DomainEvent },
    #[serde(rename = "pong")]
    Pong,
}

impl WsMessage {
    fn to_frame(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(text) => Some(Message::Text(text.into())),
            Err(e) => {
                error!("Failed to serialize WebSocket message: {}", e);
                None
            }
        }
    }
}

pub async fn events_websocket(
    ws: WebSocketUpgrade,
    Query(query): Query<EventsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let rx = state.broadcaster.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, query.table_id))
}

fn wants_event(table_filter: Option<i32>, event: &DomainEvent) -> bool {
    table_filter.is_none_or(|table_id| event.table_id() == table_id)
}

async fn handle_socket(
    socket: WebSocket,
    mut events: broadcast::Receiver<DomainEvent>,
    table_filter: Option<i32>,
) {
    let (mut sender, mut receiver) = socket.split();
    info!(table_id = ?table_filter, "New events WebSocket connection");

    if let Some(frame) = (WsMessage::Subscribed { table_id: table_filter }).to_frame() {
        if sender.send(frame).await.is_err() {
            return;
        }
    }

    let mut heartbeat = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            result = events.recv() => {
                match result {
                    Ok(event) => {
                        if !wants_event(table_filter, &event) {
                            continue;
                        }
                        if let Some(frame) = (WsMessage::Event { event }).to_frame() {
                            if let Err(e) = sender.send(frame).await {
                                debug!("WebSocket send error: {}", e);
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} broadcast events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Broadcast channel closed");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if let Err(e) = sender.send(Message::Ping(axum::body::Bytes::new())).await {
                    debug!("Heartbeat failed: {}", e);
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(control) = serde_json::from_str::<WsControl>(&text) {
                            match control.action.as_str() {
                                "ping" => {
                                    if let Some(frame) = WsMessage::Pong.to_frame() {
                                        let _ = sender.send(frame).await;
                                    }
                                }
                                "unsubscribe" => {
                                    info!("Client unsubscribed");
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket closed by client");
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket receive error: {}", e);
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(table_id = ?table_filter, "Events WebSocket connection closed");
}
