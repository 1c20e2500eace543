use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use common::analysis::{ResultMessage, PING, PONG};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::AnalyticsState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AnalyticsState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AnalyticsState) {
    let mut subscription = state.results().subscribe().await;
    let subscriber_id = subscription.id();
    info!(subscriber = subscriber_id, "real-time client connected");

    let (mut sender, mut receiver) = socket.split();
    // Replies from the receive side go out through the single writer
    let (reply_tx, mut reply_rx) = mpsc::channel::<Message>(8);

    let mut send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                result = subscription.recv() => match result {
                    Some(result) => {
                        let envelope = ResultMessage::AiResult((*result).clone());
                        match serde_json::to_string(&envelope) {
                            Ok(json) => Message::Text(json),
                            Err(e) => {
                                warn!(error = %e, "failed to serialize result");
                                continue;
                            }
                        }
                    }
                    // Dropped by the store
                    None => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
            };

            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) if text.trim() == PING => {
                    if reply_tx.send(Message::Text(PONG.to_string())).await.is_err() {
                        break;
                    }
                }
                Message::Text(text) => {
                    debug!(len = text.len(), "ignoring client message");
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.results().unsubscribe(subscriber_id).await;
    info!(subscriber = subscriber_id, "real-time client disconnected");
}
