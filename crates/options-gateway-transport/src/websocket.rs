//! WebSocket transport: one request per text frame, one response each.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::{Dispatcher, protocol::RpcResponse};

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(dispatcher): State<Arc<Dispatcher>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, dispatcher))
}

async fn handle_socket(socket: WebSocket, dispatcher: Arc<Dispatcher>) {
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending responses to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<RpcResponse>();

    let send_task = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let json = match serde_json::to_string(&response) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize response: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    tracing::debug!("WebSocket client connected");
    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        // Requests run concurrently; clients correlate responses by id.
        let dispatcher = Arc::clone(&dispatcher);
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = dispatcher.handle_text(&text).await;
            let _ = tx.send(response);
        });
    }

    drop(tx);
    if let Err(e) = send_task.await {
        tracing::debug!("WebSocket send task ended: {e}");
    }
    tracing::debug!("WebSocket client disconnected");
}
