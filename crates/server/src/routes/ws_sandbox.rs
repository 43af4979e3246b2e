use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use shared::{SandboxClientMessage, SandboxServerMessage};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::crypto;
use crate::error::AppError;
use crate::sandbox::{self, ExecutionHost};
use crate::state::AppState;
use crate::workspace::WorkspaceHandle;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxWsParams {
    pub api_key: String,
}

/// Per-sandbox tagged connection. The caller's API key rides along as a
/// query parameter so the agent-key cipher can be re-derived for `execute`
/// requests without further exchange.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path((workspace, session_id)): Path<(String, Uuid)>,
    Query(params): Query<SandboxWsParams>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    if !state.config.auth.api_keys.is_empty()
        && !state.config.auth.api_keys.contains(&params.api_key)
    {
        return Err(AppError::Auth("unknown API key".into()));
    }

    let handle = state.workspaces.get_or_spawn(&workspace).await?;
    let host = state
        .hosts
        .get(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("sandbox session '{session_id}'")))?;

    let cipher_key = crypto::derive_key(&params.api_key, &workspace);
    let agent_command = state.config.sandbox.agent_command.clone();
    Ok(ws.on_upgrade(move |socket| {
        handle_socket(socket, handle, session_id, host, cipher_key, agent_command)
    }))
}

async fn handle_socket(
    socket: WebSocket,
    handle: WorkspaceHandle,
    session_id: Uuid,
    host: Arc<ExecutionHost>,
    cipher_key: [u8; crypto::KEY_LEN],
    agent_command: String,
) {
    let (mut sender, mut receiver) = socket.split();

    // Events may be produced faster than the socket drains them; the channel
    // buffers instead of dropping.
    let (tx, mut rx) = mpsc::channel::<SandboxServerMessage>(256);
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = serde_json::to_string(&msg).unwrap();
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    tracing::info!("{}: sandbox client connected: {}", handle.slug, session_id);

    while let Some(Ok(msg)) = receiver.next().await {
        if let Message::Text(text) = msg {
            let parsed: Result<SandboxClientMessage, _> = serde_json::from_str(&text);
            match parsed {
                Ok(SandboxClientMessage::Tool { id, name, input }) => {
                    let reply = match sandbox::execute_tool(&host, &name, &input).await {
                        Ok(out) => SandboxServerMessage::tool_ok(id, out.output, out.exit_code),
                        Err(e) => SandboxServerMessage::tool_err(id, e.to_string(), None),
                    };
                    if tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Ok(SandboxClientMessage::Execute {
                    task,
                    context,
                    anthropic_api_key,
                    token_type: _,
                }) => {
                    match sandbox::resolve_api_key(&anthropic_api_key, &cipher_key) {
                        Ok(api_key) => {
                            // The run owns its own channel clone: it streams to
                            // completion even if this connection goes away.
                            tokio::spawn(sandbox::execute_agent(
                                host.clone(),
                                agent_command.clone(),
                                api_key,
                                task,
                                context,
                                tx.clone(),
                            ));
                        }
                        Err(e) => {
                            let reply = SandboxServerMessage::Error {
                                message: e.to_string(),
                            };
                            if tx.send(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Ok(SandboxClientMessage::Heartbeat) => {
                    // An expired session cannot be revived; the client must
                    // hear that instead of a hollow ack.
                    let reply = match handle.sandbox_heartbeat(session_id).await {
                        Ok(_) => SandboxServerMessage::HeartbeatAck,
                        Err(e) => SandboxServerMessage::Error {
                            message: e.to_string(),
                        },
                    };
                    if tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Ok(SandboxClientMessage::Ping) => {
                    if tx.send(SandboxServerMessage::Pong).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let reply = SandboxServerMessage::Error {
                        message: format!("invalid frame: {e}"),
                    };
                    if tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    send_task.abort();
    tracing::info!("{}: sandbox client disconnected: {}", handle.slug, session_id);
}
