use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::{SyncCommand, SyncEnvelope, SyncServerMessage};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;
use crate::workspace::WorkspaceHandle;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(workspace): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let handle = state.workspaces.get_or_spawn(&workspace).await?;
    Ok(ws.on_upgrade(|socket| handle_socket(socket, handle)))
}

async fn handle_socket(socket: WebSocket, handle: WorkspaceHandle) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = Uuid::new_v4();

    // Channel for messages to this client: correlated responses plus change
    // events broadcast by the actor.
    let (tx, mut rx) = mpsc::channel::<SyncServerMessage>(256);
    if handle.attach(connection_id, tx.clone()).await.is_err() {
        return;
    }

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = serde_json::to_string(&msg).unwrap();
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    tracing::info!("{}: sync client connected: {}", handle.slug, connection_id);

    while let Some(Ok(msg)) = receiver.next().await {
        if let Message::Text(text) = msg {
            let reply = handle_frame(&handle, connection_id, &text).await;
            if tx.send(reply).await.is_err() {
                break;
            }
        }
    }

    handle.detach(connection_id).await;
    send_task.abort();
    tracing::info!("{}: sync client disconnected: {}", handle.slug, connection_id);
}

/// Parse and apply one inbound frame. Every frame gets exactly one response,
/// carrying data or an error, never both; the connection stays open on any
/// failure.
async fn handle_frame(
    handle: &WorkspaceHandle,
    connection_id: Uuid,
    text: &str,
) -> SyncServerMessage {
    let raw: Value = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => return SyncServerMessage::error("", format!("invalid frame: {e}")),
    };
    let request_id = raw
        .get("requestId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let Some(message_type) = raw.get("type").and_then(Value::as_str) else {
        return SyncServerMessage::error(request_id, "missing message type");
    };
    if !SyncCommand::is_known_type(message_type) {
        let err = AppError::UnknownMessageType(message_type.to_string());
        return SyncServerMessage::error(request_id, err.to_string());
    }

    let envelope: SyncEnvelope = match serde_json::from_value(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            return SyncServerMessage::error(request_id, format!("validation error: {e}"));
        }
    };

    match handle.mutate(Some(connection_id), envelope.command).await {
        Ok(data) => SyncServerMessage::ok(request_id, data),
        Err(e) => SyncServerMessage::error(request_id, e.to_string()),
    }
}
