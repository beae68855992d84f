use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use livewire_core::Outbound;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Bridges one socket to the dispatcher. A writer task drains the
/// connection's outbound queue; this task reads client frames until the
/// socket closes.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let dispatcher = state.dispatcher;
    let (id, mut outbound) = match dispatcher.connect().await {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!(error = %e, "WebSocket connection refused");
            return;
        }
    };
    tracing::info!(connection_id = %id, "WebSocket connected");

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let (message, last) = match frame {
                Outbound::Text(text) => (Message::Text(text.to_string()), false),
                Outbound::Ping => (Message::Ping(Vec::new()), false),
                Outbound::Close => (Message::Close(None), true),
            };
            if sink.send(message).await.is_err() || last {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => dispatcher.handle_client_message(&id, &text).await,
            Ok(Message::Binary(data)) => {
                let text = String::from_utf8_lossy(&data);
                dispatcher.handle_client_message(&id, &text).await;
            }
            Ok(Message::Pong(_)) | Ok(Message::Ping(_)) => dispatcher.client_alive(&id).await,
            Ok(Message::Close(_)) => {
                tracing::debug!(connection_id = %id, "Client closed the socket");
                break;
            }
            Err(e) => {
                tracing::debug!(connection_id = %id, error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    dispatcher.disconnect(&id).await;
    writer.abort();
    tracing::info!(connection_id = %id, "WebSocket disconnected");
}
