use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use crate::error::Result;
use crate::proctoring::{ConnectionHandle, MonitorView};

/// Pushes the current view on connect and again on every change. The
/// feed is one-way; anything the dashboard sends is ignored.
pub async fn handle_live_websocket(websocket: WebSocket, handle: ConnectionHandle) {
    tracing::info!("Dashboard live feed connected");

    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let sender_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_sender.send(message).await {
                tracing::debug!(error = %e, "Failed to push view to dashboard");
                break;
            }
        }
    });

    let mut views = handle.subscribe_view();
    let publisher_task = tokio::spawn(async move {
        loop {
            let view = views.borrow_and_update().clone();
            match encode_view(&view) {
                Ok(message) => {
                    if tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, "Failed to encode monitor view"),
            }
            if views.changed().await.is_err() {
                tracing::debug!("Monitor stopped, ending live feed");
                break;
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) if message.is_close() => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Dashboard WebSocket error");
                break;
            }
        }
    }

    publisher_task.abort();
    sender_task.abort();
    tracing::info!("Dashboard live feed closed");
}

fn encode_view(view: &MonitorView) -> Result<Message> {
    Ok(Message::text(serde_json::to_string(view)?))
}
