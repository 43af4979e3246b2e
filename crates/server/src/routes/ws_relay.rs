use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use shared::{RelayClientMessage, RelayServerMessage, RELAY_AUTH_CLOSE_CODE};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::state::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Auth-first protocol: the first frame must be a valid `auth`, otherwise the
/// socket is closed with code 4001. Only authenticated clients join the
/// broker's delivery set.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();

    let authed = match socket.recv().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
            Ok(RelayClientMessage::Auth { api_key }) => {
                state.config.auth.api_keys.contains(&api_key)
            }
            _ => false,
        },
        _ => false,
    };

    if !authed {
        let reply = RelayServerMessage::AuthError {
            error: "invalid API key".into(),
        };
        let _ = socket
            .send(Message::Text(serde_json::to_string(&reply).unwrap().into()))
            .await;
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: RELAY_AUTH_CLOSE_CODE,
                reason: "auth failed".into(),
            })))
            .await;
        tracing::warn!("Relay client rejected: {}", connection_id);
        return;
    }

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<RelayServerMessage>(64);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = serde_json::to_string(&msg).unwrap();
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    if tx.send(RelayServerMessage::AuthOk).await.is_err() {
        send_task.abort();
        return;
    }
    state.broker.register(connection_id, tx.clone());

    while let Some(Ok(msg)) = receiver.next().await {
        if let Message::Text(text) = msg {
            match serde_json::from_str::<RelayClientMessage>(&text) {
                Ok(RelayClientMessage::Ack { id, success, error }) => {
                    state.broker.resolve_ack(&id, success, error);
                }
                Ok(RelayClientMessage::QueryResponse { id, data, error }) => {
                    state.broker.resolve_query(&id, data, error);
                }
                Ok(RelayClientMessage::Heartbeat) => {
                    if tx.send(RelayServerMessage::HeartbeatAck).await.is_err() {
                        break;
                    }
                }
                Ok(RelayClientMessage::Auth { .. }) => {
                    // Already authenticated; re-auth frames are ignored.
                }
                Err(e) => {
                    tracing::warn!("Relay client {} sent invalid frame: {}", connection_id, e);
                }
            }
        }
    }

    state.broker.unregister(&connection_id);
    send_task.abort();
    tracing::info!("Relay client disconnected: {}", connection_id);
}
