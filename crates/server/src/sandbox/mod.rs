//! Ephemeral repo-bound sandbox sessions: credential storage, host
//! lifecycle, and TTL-based cleanup. Embedded in the workspace actor so all
//! row mutations stay serialized.

mod agent;
mod host;
mod tools;

pub use agent::{execute_agent, resolve_api_key, PLAINTEXT_KEY_PREFIX};
pub use host::{ExecutionHost, HostRegistry};
pub use tools::{execute_tool, ToolOutput};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use shared::{SandboxSessionInfo, SandboxStatus};
use uuid::Uuid;

use crate::config::Config;
use crate::crypto;
use crate::db::WorkspaceStore;
use crate::error::AppError;
use crate::workspace::WorkspaceHandle;

const NO_CREDENTIALS: &str = "No GitHub credentials stored for this repository";

pub struct SandboxManager {
    slug: Arc<str>,
    config: Arc<Config>,
    hosts: Arc<HostRegistry>,
}

impl SandboxManager {
    pub fn new(slug: Arc<str>, config: Arc<Config>, hosts: Arc<HostRegistry>) -> Self {
        Self {
            slug,
            config,
            hosts,
        }
    }

    fn credential_key(&self, repo_key: &str) -> [u8; crypto::KEY_LEN] {
        crypto::derive_key(
            &self.config.auth.credential_secret,
            &format!("{}:{}", self.slug, repo_key),
        )
    }

    /// Decrypt a project's stored credential if it is present, unexpired and
    /// intact. All three failure modes collapse to `None` so callers cannot
    /// tell "missing" from "invalid".
    fn usable_credential(&self, row: &crate::db::ProjectRow) -> Option<String> {
        let ciphertext = row.credential.as_deref()?;
        if row.credential_expired(Utc::now()) {
            return None;
        }
        crypto::decrypt(ciphertext, &self.credential_key(&row.repo_key)).ok()
    }

    /// True when a usable credential is stored. Lazily creates the project
    /// row on first contact.
    pub async fn check_auth(
        &self,
        store: &WorkspaceStore,
        repo_key: &str,
        repo_url: &str,
    ) -> Result<bool, AppError> {
        let row = store.ensure_project(repo_key, repo_url).await?;
        Ok(self.usable_credential(&row).is_some())
    }

    pub async fn store_credential(
        &self,
        store: &WorkspaceStore,
        repo_key: &str,
        repo_url: &str,
        token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        store.ensure_project(repo_key, repo_url).await?;
        let ciphertext = crypto::encrypt(token, &self.credential_key(repo_key))?;
        store
            .set_project_credential(repo_key, &ciphertext, expires_at)
            .await
    }

    /// Insert the session row and kick off provisioning in the background.
    /// Fails fast without a usable credential; the caller polls status (or
    /// heartbeats) to observe `cloning → ready`.
    pub async fn begin_create(
        &self,
        store: &WorkspaceStore,
        handle: WorkspaceHandle,
        repo_key: &str,
        branch: Option<String>,
    ) -> Result<SandboxSessionInfo, AppError> {
        let project = store
            .get_project(repo_key)
            .await?
            .ok_or_else(|| AppError::Auth(NO_CREDENTIALS.into()))?;
        let credential = self
            .usable_credential(&project)
            .ok_or_else(|| AppError::Auth(NO_CREDENTIALS.into()))?;

        let session_id = Uuid::new_v4();
        let host_id = format!("host-{}", Uuid::new_v4());
        let branch = branch.unwrap_or_else(|| project.default_branch.clone());
        let expires_at = Utc::now() + Duration::seconds(self.config.sandbox.session_ttl_secs as i64);

        let row = store
            .insert_sandbox(&session_id.to_string(), repo_key, &host_id, &branch, expires_at)
            .await?;

        let hosts = self.hosts.clone();
        let repo_url = project.repo_url.clone();
        let default_branch = project.default_branch.clone();
        let git_binary = self.config.sandbox.git_binary.clone();
        let clone_branch = branch.clone();
        let slug = self.slug.clone();
        tokio::spawn(async move {
            handle
                .update_sandbox_status(session_id, SandboxStatus::Cloning)
                .await;
            let checkout = (clone_branch != default_branch).then_some(clone_branch.as_str());
            match ExecutionHost::provision(host_id, &repo_url, &credential, checkout, &git_binary)
                .await
            {
                Ok(host) => {
                    hosts.insert(session_id, host);
                    handle
                        .update_sandbox_status(session_id, SandboxStatus::Ready)
                        .await;
                    tracing::info!("{}: sandbox {} ready", slug, session_id);
                }
                Err(e) => {
                    tracing::error!("{}: sandbox {} provisioning failed: {}", slug, session_id, e);
                    handle
                        .update_sandbox_status(session_id, SandboxStatus::Expired)
                        .await;
                }
            }
        });

        row.into_info()
    }

    /// Extend the session's TTL; idle sessions go back to ready. Expired
    /// sessions cannot be revived.
    pub async fn heartbeat(
        &self,
        store: &WorkspaceStore,
        id: Uuid,
    ) -> Result<SandboxSessionInfo, AppError> {
        let row = store.require_sandbox(&id.to_string()).await?;
        if row.status()? == SandboxStatus::Expired {
            return Err(AppError::Validation(format!("sandbox session '{id}' is expired")));
        }
        let expires_at = Utc::now() + Duration::seconds(self.config.sandbox.session_ttl_secs as i64);
        store.touch_sandbox(&id.to_string(), expires_at).await?;
        store.require_sandbox(&id.to_string()).await?.into_info()
    }

    /// Best-effort teardown: drop the host if it still exists, then delete
    /// the row. "Already gone" at either step is not an error.
    pub async fn terminate(&self, store: &WorkspaceStore, id: Uuid) -> Result<(), AppError> {
        if self.hosts.remove(&id).is_some() {
            tracing::info!("{}: sandbox {} host destroyed", self.slug, id);
        }
        store.delete_sandbox(&id.to_string()).await?;
        Ok(())
    }

    /// Status report from a provisioning task; illegal transitions are
    /// rejected so a late report cannot resurrect an expired session.
    pub async fn update_status(
        &self,
        store: &WorkspaceStore,
        id: Uuid,
        status: SandboxStatus,
    ) -> Result<(), AppError> {
        let row = store.require_sandbox(&id.to_string()).await?;
        let current = row.status()?;
        if !current.can_transition_to(status) {
            return Err(AppError::Validation(format!(
                "illegal status transition {} -> {}",
                current.as_str(),
                status.as_str()
            )));
        }
        store.set_sandbox_status(&id.to_string(), status).await
    }

    /// One sweep pass: force-expire overdue sessions, hard-delete rows past
    /// the grace window. Returns whether any rows remain at all; the caller
    /// reschedules while they do, since expired rows still owe a grace-window
    /// delete.
    pub async fn sweep(&self, store: &WorkspaceStore, now: DateTime<Utc>) -> Result<bool, AppError> {
        for row in store.sandboxes_past_expiry(now).await? {
            if let Ok(id) = Uuid::parse_str(&row.id) {
                self.hosts.remove(&id);
            }
            store.set_sandbox_status(&row.id, SandboxStatus::Expired).await?;
            tracing::info!("{}: sandbox {} expired by sweep", self.slug, row.id);
        }

        let cutoff = now - Duration::seconds(self.config.sandbox.expired_grace_secs as i64);
        for row in store.sandboxes_expired_before(cutoff).await? {
            if let Ok(id) = Uuid::parse_str(&row.id) {
                self.hosts.remove(&id);
            }
            store.delete_sandbox(&row.id).await?;
            tracing::info!("{}: sandbox {} hard-deleted after grace", self.slug, row.id);
        }

        Ok(store.count_sandboxes().await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (SandboxManager, Arc<HostRegistry>) {
        let hosts = Arc::new(HostRegistry::new());
        let manager = SandboxManager::new(
            Arc::from("test-ws"),
            Arc::new(Config::default()),
            hosts.clone(),
        );
        (manager, hosts)
    }

    #[tokio::test]
    async fn test_check_auth_without_credential() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        let (manager, _) = manager();
        let ready = manager
            .check_auth(&store, "o/r", "https://github.com/o/r")
            .await
            .unwrap();
        assert!(!ready);
        // Row was lazily created.
        assert!(store.get_project("o/r").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_credential_then_check_auth() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        let (manager, _) = manager();
        manager
            .store_credential(&store, "o/r", "https://github.com/o/r", "ghp_token", None)
            .await
            .unwrap();

        assert!(manager
            .check_auth(&store, "o/r", "https://github.com/o/r")
            .await
            .unwrap());

        // Plaintext never reaches the row.
        let row = store.get_project("o/r").await.unwrap().unwrap();
        assert_ne!(row.credential.as_deref(), Some("ghp_token"));
    }

    #[tokio::test]
    async fn test_corrupt_credential_presents_as_needs_auth() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        let (manager, _) = manager();
        store.ensure_project("o/r", "https://github.com/o/r").await.unwrap();
        store
            .set_project_credential("o/r", "not-a-valid-ciphertext", None)
            .await
            .unwrap();

        assert!(!manager
            .check_auth(&store, "o/r", "https://github.com/o/r")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_expired_credential_presents_as_needs_auth() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        let (manager, _) = manager();
        manager
            .store_credential(
                &store,
                "o/r",
                "https://github.com/o/r",
                "ghp_token",
                Some(Utc::now() - Duration::seconds(60)),
            )
            .await
            .unwrap();

        assert!(!manager
            .check_auth(&store, "o/r", "https://github.com/o/r")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_sweep_expires_and_deletes_after_grace() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        let (manager, _) = manager();
        let overdue = Utc::now() - Duration::seconds(10);
        store
            .insert_sandbox("11111111-1111-1111-1111-111111111111", "o/r", "h1", "main", overdue)
            .await
            .unwrap();

        // First pass: force-expire. The row still exists, so the sweep must
        // keep running even though nothing is active anymore.
        let remaining = manager.sweep(&store, Utc::now()).await.unwrap();
        assert!(remaining);
        let row = store
            .get_sandbox("11111111-1111-1111-1111-111111111111")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status().unwrap(), SandboxStatus::Expired);

        // Second pass, past the grace window: hard delete, then stand down.
        let later = Utc::now() + Duration::seconds(manager.config.sandbox.expired_grace_secs as i64 + 1);
        let remaining = manager.sweep(&store, later).await.unwrap();
        assert!(!remaining);
        assert!(store
            .get_sandbox("11111111-1111-1111-1111-111111111111")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_rejects_expired_session() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        let (manager, _) = manager();
        let id = Uuid::new_v4();
        store
            .insert_sandbox(&id.to_string(), "o/r", "h1", "main", Utc::now())
            .await
            .unwrap();
        store
            .set_sandbox_status(&id.to_string(), SandboxStatus::Expired)
            .await
            .unwrap();

        // The message is what the sandbox socket relays as an error event.
        let err = manager.heartbeat(&store, id).await.unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn test_update_status_rejects_illegal_transition() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        let (manager, _) = manager();
        let id = Uuid::new_v4();
        store
            .insert_sandbox(&id.to_string(), "o/r", "h1", "main", Utc::now())
            .await
            .unwrap();
        store
            .set_sandbox_status(&id.to_string(), SandboxStatus::Expired)
            .await
            .unwrap();

        // A late provisioning report cannot revive an expired session.
        assert!(manager
            .update_status(&store, id, SandboxStatus::Ready)
            .await
            .is_err());
    }
}
