//! Per-workspace single-writer actors.
//!
//! All durable state for a workspace is owned by exactly one tokio task; every
//! reader and writer (WebSocket handlers, REST handlers, sweep timers,
//! provisioning tasks) talks to it through a [`WorkspaceHandle`]. This gives
//! strict serialization of mutations per workspace without any cross-workspace
//! contention.

mod actor;

pub use actor::{ActorCommand, ReadQuery};

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use shared::{SandboxSessionInfo, SandboxStatus, SyncCommand, SyncServerMessage};
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::config::Config;
use crate::db::WorkspaceStore;
use crate::error::AppError;
use crate::sandbox::HostRegistry;

const ACTOR_QUEUE_DEPTH: usize = 256;

/// Lazily spawns and caches one actor per workspace slug.
pub struct WorkspaceRegistry {
    config: Arc<Config>,
    data_dir: PathBuf,
    hosts: Arc<HostRegistry>,
    handles: DashMap<String, WorkspaceHandle>,
    // Serializes actor creation so two first-contact requests for the same
    // slug cannot both open the store.
    spawn_lock: Mutex<()>,
}

impl WorkspaceRegistry {
    pub fn new(config: Arc<Config>, hosts: Arc<HostRegistry>) -> Self {
        let data_dir = PathBuf::from(&config.data.dir);
        Self {
            config,
            data_dir,
            hosts,
            handles: DashMap::new(),
            spawn_lock: Mutex::new(()),
        }
    }

    /// Resolve the actor for a workspace, spawning it on first contact.
    pub async fn get_or_spawn(&self, slug: &str) -> Result<WorkspaceHandle, AppError> {
        validate_slug(slug)?;

        if let Some(handle) = self.handles.get(slug) {
            return Ok(handle.clone());
        }

        let _guard = self.spawn_lock.lock().await;
        if let Some(handle) = self.handles.get(slug) {
            return Ok(handle.clone());
        }

        let store = WorkspaceStore::open(&self.data_dir, slug).await?;
        let handle = actor::spawn(
            slug.to_string(),
            store,
            self.config.clone(),
            self.hosts.clone(),
        );
        self.handles.insert(slug.to_string(), handle.clone());
        tracing::info!("Workspace actor started: {}", slug);
        Ok(handle)
    }
}

/// Workspace slugs become sqlite file names; restrict them accordingly.
fn validate_slug(slug: &str) -> Result<(), AppError> {
    let ok = !slug.is_empty()
        && slug.len() <= 64
        && slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid workspace slug '{slug}'")))
    }
}

/// Cheap cloneable address of one workspace actor.
#[derive(Clone)]
pub struct WorkspaceHandle {
    pub slug: Arc<str>,
    tx: mpsc::Sender<ActorCommand>,
}

impl WorkspaceHandle {
    pub(crate) fn new(slug: Arc<str>, tx: mpsc::Sender<ActorCommand>) -> Self {
        Self { slug, tx }
    }

    async fn send(&self, cmd: ActorCommand) -> Result<(), AppError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| AppError::Internal("workspace actor is gone".into()))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, AppError>>) -> ActorCommand,
    ) -> Result<T, AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(make(reply_tx)).await?;
        reply_rx
            .await
            .map_err(|_| AppError::Internal("workspace actor dropped the reply".into()))?
    }

    pub async fn attach(
        &self,
        conn_id: Uuid,
        sender: mpsc::Sender<SyncServerMessage>,
    ) -> Result<(), AppError> {
        self.send(ActorCommand::Attach { conn_id, sender }).await
    }

    pub async fn detach(&self, conn_id: Uuid) {
        let _ = self.send(ActorCommand::Detach { conn_id }).await;
    }

    /// Apply a sync mutation. `origin` is excluded from the broadcast; REST
    /// callers pass `None` so every connected peer hears the change.
    pub async fn mutate(
        &self,
        origin: Option<Uuid>,
        command: SyncCommand,
    ) -> Result<Value, AppError> {
        self.request(|reply| ActorCommand::Mutate {
            origin,
            command,
            reply,
        })
        .await
    }

    pub async fn read(&self, query: ReadQuery) -> Result<Value, AppError> {
        self.request(|reply| ActorCommand::Read { query, reply }).await
    }

    /// Repo auth check: true when a usable (present, decryptable, unexpired)
    /// credential is stored.
    pub async fn check_repo_auth(&self, repo_key: String, repo_url: String) -> Result<bool, AppError> {
        self.request(|reply| ActorCommand::CheckRepoAuth {
            repo_key,
            repo_url,
            reply,
        })
        .await
    }

    pub async fn store_credential(
        &self,
        repo_key: String,
        repo_url: String,
        token: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        self.request(|reply| ActorCommand::StoreCredential {
            repo_key,
            repo_url,
            token,
            expires_at,
            reply,
        })
        .await
    }

    pub async fn clear_credential(&self, repo_key: String) -> Result<(), AppError> {
        self.request(|reply| ActorCommand::ClearCredential { repo_key, reply })
            .await
    }

    pub async fn create_sandbox(
        &self,
        repo_key: String,
        branch: Option<String>,
    ) -> Result<SandboxSessionInfo, AppError> {
        self.request(|reply| ActorCommand::CreateSandbox {
            repo_key,
            branch,
            reply,
        })
        .await
    }

    pub async fn sandbox_heartbeat(&self, id: Uuid) -> Result<SandboxSessionInfo, AppError> {
        self.request(|reply| ActorCommand::SandboxHeartbeat { id, reply })
            .await
    }

    pub async fn terminate_sandbox(&self, id: Uuid) -> Result<(), AppError> {
        self.request(|reply| ActorCommand::TerminateSandbox { id, reply })
            .await
    }

    pub(crate) async fn update_sandbox_status(&self, id: Uuid, status: SandboxStatus) {
        let _ = self.send(ActorCommand::UpdateSandboxStatus { id, status }).await;
    }

    pub(crate) async fn sweep(&self) {
        let _ = self.send(ActorCommand::Sweep).await;
    }
}

pub(crate) fn actor_channel() -> (mpsc::Sender<ActorCommand>, mpsc::Receiver<ActorCommand>) {
    mpsc::channel(ACTOR_QUEUE_DEPTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_validation() {
        assert!(validate_slug("team-a").is_ok());
        assert!(validate_slug("Workspace_1").is_ok());
        assert!(validate_slug("").is_err());
        assert!(validate_slug("a/b").is_err());
        assert!(validate_slug("../escape").is_err());
        assert!(validate_slug(&"x".repeat(65)).is_err());
    }
}
