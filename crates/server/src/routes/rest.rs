//! Bulk REST reads, REST-originated mutations, and relay entry points.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::SyncCommand;
use uuid::Uuid;

use crate::config::Config;
use crate::error::AppError;
use crate::state::AppState;
use crate::workspace::ReadQuery;

async fn read(
    state: &AppState,
    workspace: &str,
    query: ReadQuery,
) -> Result<Json<Value>, AppError> {
    let handle = state.workspaces.get_or_spawn(workspace).await?;
    Ok(Json(handle.read(query).await?))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
) -> Result<Json<Value>, AppError> {
    read(&state, &workspace, ReadQuery::Sessions).await
}

pub async fn get_session(
    State(state): State<AppState>,
    Path((workspace, id)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    read(&state, &workspace, ReadQuery::Session(id)).await
}

pub async fn list_sources(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
) -> Result<Json<Value>, AppError> {
    read(&state, &workspace, ReadQuery::Sources).await
}

pub async fn get_statuses(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
) -> Result<Json<Value>, AppError> {
    read(&state, &workspace, ReadQuery::Statuses).await
}

pub async fn get_labels(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
) -> Result<Json<Value>, AppError> {
    read(&state, &workspace, ReadQuery::Labels).await
}

pub async fn list_skills(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
) -> Result<Json<Value>, AppError> {
    read(&state, &workspace, ReadQuery::Skills).await
}

pub async fn list_plans(
    State(state): State<AppState>,
    Path((workspace, session_id)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    read(&state, &workspace, ReadQuery::Plans(session_id)).await
}

pub async fn list_projects(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
) -> Result<Json<Value>, AppError> {
    read(&state, &workspace, ReadQuery::Projects).await
}

pub async fn list_sandboxes(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
) -> Result<Json<Value>, AppError> {
    read(&state, &workspace, ReadQuery::Sandboxes).await
}

pub async fn get_sandbox(
    State(state): State<AppState>,
    Path((workspace, id)): Path<(String, Uuid)>,
) -> Result<Json<Value>, AppError> {
    read(&state, &workspace, ReadQuery::Sandbox(id)).await
}

// ----------------------------------------------------------------------------
// REST-originated mutations
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRequest {
    pub flagged: bool,
    #[serde(default)]
    pub icon_url: Option<String>,
}

/// Flag/unflag over plain HTTP. Applied like a sync mutation but broadcast to
/// every connected peer (there is no sender to exclude). Icon resolution is
/// fire-and-forget side work; it never blocks or fails the response.
pub async fn flag_session(
    State(state): State<AppState>,
    Path((workspace, id)): Path<(String, String)>,
    Json(req): Json<FlagRequest>,
) -> Result<Json<Value>, AppError> {
    let handle = state.workspaces.get_or_spawn(&workspace).await?;
    let data = handle
        .mutate(
            None,
            SyncCommand::SessionUpdateMeta {
                id: id.clone(),
                name: None,
                flagged: Some(req.flagged),
                meta: None,
            },
        )
        .await?;

    if let Some(icon_url) = req.icon_url {
        let blobs = state.blobs.clone();
        tokio::spawn(async move {
            match fetch_icon(&icon_url).await {
                Ok(bytes) => {
                    let name = format!("{}.icon", Uuid::new_v4());
                    if let Err(e) = blobs.put("icons", &name, &bytes).await {
                        tracing::warn!("Failed to store icon from {}: {}", icon_url, e);
                    }
                }
                Err(e) => tracing::warn!("Failed to fetch icon from {}: {}", icon_url, e),
            }
        });
    }

    Ok(Json(data))
}

async fn fetch_icon(url: &str) -> Result<Vec<u8>, AppError> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(bytes.to_vec())
}

// ----------------------------------------------------------------------------
// Repo credentials
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoAuthRequest {
    pub repo_key: String,
    pub repo_url: String,
}

pub async fn check_repo_auth(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
    Json(req): Json<RepoAuthRequest>,
) -> Result<Json<Value>, AppError> {
    let handle = state.workspaces.get_or_spawn(&workspace).await?;
    let ready = handle.check_repo_auth(req.repo_key, req.repo_url).await?;
    if ready {
        Ok(Json(json!({ "ready": true })))
    } else {
        Ok(Json(json!({ "ready": false, "needsAuth": true })))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreCredentialRequest {
    pub repo_key: String,
    pub repo_url: String,
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn store_credential(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
    Json(req): Json<StoreCredentialRequest>,
) -> Result<Json<Value>, AppError> {
    let handle = state.workspaces.get_or_spawn(&workspace).await?;
    handle
        .store_credential(req.repo_key, req.repo_url, req.token, req.expires_at)
        .await?;
    Ok(Json(json!({ "stored": true })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearCredentialRequest {
    pub repo_key: String,
}

pub async fn clear_credential(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
    Json(req): Json<ClearCredentialRequest>,
) -> Result<Json<Value>, AppError> {
    let handle = state.workspaces.get_or_spawn(&workspace).await?;
    handle.clear_credential(req.repo_key).await?;
    Ok(Json(json!({ "cleared": true })))
}

// ----------------------------------------------------------------------------
// Sandbox lifecycle
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxRequest {
    pub repo_key: String,
    #[serde(default)]
    pub branch: Option<String>,
}

pub async fn create_sandbox(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
    Json(req): Json<CreateSandboxRequest>,
) -> Result<Json<Value>, AppError> {
    let handle = state.workspaces.get_or_spawn(&workspace).await?;
    let info = handle.create_sandbox(req.repo_key, req.branch).await?;
    Ok(Json(json!({
        "sessionId": info.id,
        "hostId": info.host_id,
        "wsUrl": format!("/ws/sandbox/{}/{}", workspace, info.id),
        "status": info.status,
        "expiresAt": info.expires_at,
    })))
}

pub async fn sandbox_heartbeat(
    State(state): State<AppState>,
    Path((workspace, id)): Path<(String, Uuid)>,
) -> Result<Json<Value>, AppError> {
    let handle = state.workspaces.get_or_spawn(&workspace).await?;
    let info = handle.sandbox_heartbeat(id).await?;
    Ok(Json(serde_json::to_value(info)?))
}

pub async fn terminate_sandbox(
    State(state): State<AppState>,
    Path((workspace, id)): Path<(String, Uuid)>,
) -> Result<Json<Value>, AppError> {
    let handle = state.workspaces.get_or_spawn(&workspace).await?;
    handle.terminate_sandbox(id).await?;
    Ok(Json(json!({ "terminated": true })))
}

// ----------------------------------------------------------------------------
// Relay entry points
// ----------------------------------------------------------------------------

/// Relay entry points accept one of the configured API keys, as a bearer
/// token or an `x-api-key` header. An empty key list disables the check
/// (single-user deployments behind their own perimeter).
fn require_api_key(headers: &HeaderMap, config: &Config) -> Result<(), AppError> {
    if config.auth.api_keys.is_empty() {
        return Ok(());
    }
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()));
    match presented {
        Some(key) if config.auth.api_keys.iter().any(|k| k == key) => Ok(()),
        _ => Err(AppError::Auth("missing or unknown API key".into())),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayActionRequest {
    pub url: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Value>,
}

pub async fn relay_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RelayActionRequest>,
) -> Result<Json<Value>, AppError> {
    require_api_key(&headers, &state.config)?;
    state
        .broker
        .deliver_action(req.url, req.id, req.attachments)
        .await?;
    Ok(Json(json!({ "delivered": true })))
}

#[derive(Deserialize)]
pub struct RelayQueryParams {
    #[serde(default)]
    pub workspace: Option<String>,
}

pub async fn relay_query(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Query(params): Query<RelayQueryParams>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    require_api_key(&headers, &state.config)?;
    let data = state.broker.query(resource, params.workspace).await?;
    Ok(Json(data))
}
