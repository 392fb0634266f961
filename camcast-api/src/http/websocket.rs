//! WebSocket signaling handler
//!
//! Frames are JSON text. Incoming frames feed `SignalingSession::run`;
//! replies and notifications go through a bounded queue drained by a writer
//! task, so a slow client cannot stall its room.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info};

use crate::gateway::SignalStream;
use crate::http::AppState;
use crate::protocol::ServerMessage;

/// Outbound frames buffered per connection
const OUTBOUND_BUFFER: usize = 256;

/// WebSocket stream implementation of `SignalStream`
struct WebSocketStream {
    receiver: futures::stream::SplitStream<WebSocket>,
    sender: mpsc::Sender<String>,
    is_alive: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl SignalStream for WebSocketStream {
    async fn recv(&mut self) -> Option<Result<String, String>> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.to_string())),
                Some(Ok(Message::Binary(bytes))) => {
                    return Some(
                        String::from_utf8(bytes.to_vec())
                            .map_err(|e| format!("Binary frame is not UTF-8: {e}")),
                    );
                }
                Some(Ok(Message::Close(_))) => return None,
                Some(Err(e)) => return Some(Err(format!("WebSocket error: {e}"))),
                None => return None,
                // Ping/pong are answered by axum
                Some(Ok(_)) => {}
            }
        }
    }

    fn send(&self, message: ServerMessage) -> Result<(), String> {
        let text = message.encode()?;

        // Use try_send to provide backpressure for slow clients
        self.sender.try_send(text).map_err(|e| match e {
            TrySendError::Full(_) => {
                "Channel full: WebSocket client too slow to consume messages".to_string()
            }
            TrySendError::Closed(_) => "Channel closed: WebSocket client disconnected".to_string(),
        })
    }

    fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }
}

/// Upgrade `GET /ws` to a signaling connection
pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (session, notifications) = state.gateway.connect();
    let peer_id = session.peer_id().clone();
    info!(peer_id = %peer_id, "WebSocket connection established");

    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let is_alive = Arc::new(AtomicBool::new(true));

    let (mut sink, receiver) = socket.split();

    // Spawn task to handle server messages -> WebSocket
    let writer_alive = Arc::clone(&is_alive);
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                error!("Failed to send WebSocket message: {}", e);
                writer_alive.store(false, Ordering::Relaxed);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut stream = WebSocketStream {
        receiver,
        sender: tx,
        is_alive,
    };
    session.run(&mut stream, notifications).await;

    // Closing the queue lets the writer flush and exit
    drop(stream);
    if let Err(e) = writer.await {
        debug!(peer_id = %peer_id, error = %e, "Writer task ended abnormally");
    }

    info!(peer_id = %peer_id, "WebSocket connection closed");
}
