use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use shared::{
    ChangeAction, ChangeEvent, EntityKind, SandboxSessionInfo, SandboxStatus, SyncCommand,
    SyncServerMessage,
};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::Config;
use crate::db::WorkspaceStore;
use crate::error::AppError;
use crate::sandbox::{HostRegistry, SandboxManager};

use super::{actor_channel, WorkspaceHandle};

pub enum ActorCommand {
    Attach {
        conn_id: Uuid,
        sender: mpsc::Sender<SyncServerMessage>,
    },
    Detach {
        conn_id: Uuid,
    },
    Mutate {
        origin: Option<Uuid>,
        command: SyncCommand,
        reply: oneshot::Sender<Result<Value, AppError>>,
    },
    Read {
        query: ReadQuery,
        reply: oneshot::Sender<Result<Value, AppError>>,
    },
    CheckRepoAuth {
        repo_key: String,
        repo_url: String,
        reply: oneshot::Sender<Result<bool, AppError>>,
    },
    StoreCredential {
        repo_key: String,
        repo_url: String,
        token: String,
        expires_at: Option<DateTime<Utc>>,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    ClearCredential {
        repo_key: String,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    CreateSandbox {
        repo_key: String,
        branch: Option<String>,
        reply: oneshot::Sender<Result<SandboxSessionInfo, AppError>>,
    },
    SandboxHeartbeat {
        id: Uuid,
        reply: oneshot::Sender<Result<SandboxSessionInfo, AppError>>,
    },
    TerminateSandbox {
        id: Uuid,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    /// Status report from a background provisioning task. Illegal transitions
    /// (anything out of `expired`, or backwards) are dropped.
    UpdateSandboxStatus {
        id: Uuid,
        status: SandboxStatus,
    },
    Sweep,
}

#[derive(Debug, Clone)]
pub enum ReadQuery {
    Sessions,
    Session(String),
    Sources,
    Statuses,
    Labels,
    Skills,
    Plans(String),
    Projects,
    Sandboxes,
    Sandbox(Uuid),
}

pub(super) fn spawn(
    slug: String,
    store: WorkspaceStore,
    config: Arc<Config>,
    hosts: Arc<HostRegistry>,
) -> WorkspaceHandle {
    let slug: Arc<str> = slug.into();
    let (tx, rx) = actor_channel();
    let handle = WorkspaceHandle::new(slug.clone(), tx);

    let actor = WorkspaceActor {
        slug: slug.clone(),
        store,
        sandbox: SandboxManager::new(slug, config.clone(), hosts),
        config,
        peers: HashMap::new(),
        handle: handle.clone(),
        sweep_scheduled: false,
    };
    tokio::spawn(actor.run(rx));
    handle
}

struct WorkspaceActor {
    slug: Arc<str>,
    store: WorkspaceStore,
    sandbox: SandboxManager,
    config: Arc<Config>,
    peers: HashMap<Uuid, mpsc::Sender<SyncServerMessage>>,
    handle: WorkspaceHandle,
    sweep_scheduled: bool,
}

impl WorkspaceActor {
    async fn run(mut self, mut rx: mpsc::Receiver<ActorCommand>) {
        // Sandbox rows can survive a restart; resume sweeping if any do.
        // Expired rows are included, they still owe a grace-window delete.
        match self.store.count_sandboxes().await {
            Ok(n) if n > 0 => self.schedule_sweep(),
            Ok(_) => {}
            Err(e) => tracing::error!("{}: startup sandbox count failed: {}", self.slug, e),
        }

        while let Some(cmd) = rx.recv().await {
            self.handle_command(cmd).await;
        }
        tracing::info!("Workspace actor stopped: {}", self.slug);
    }

    async fn handle_command(&mut self, cmd: ActorCommand) {
        match cmd {
            ActorCommand::Attach { conn_id, sender } => {
                self.peers.insert(conn_id, sender);
                tracing::debug!("{}: sync peer attached: {}", self.slug, conn_id);
            }
            ActorCommand::Detach { conn_id } => {
                self.peers.remove(&conn_id);
                tracing::debug!("{}: sync peer detached: {}", self.slug, conn_id);
            }
            ActorCommand::Mutate {
                origin,
                command,
                reply,
            } => {
                let result = self.apply(command).await;
                let result = match result {
                    Ok((data, event)) => {
                        if let Some(event) = event {
                            self.broadcast(origin, event).await;
                        }
                        Ok(data)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            ActorCommand::Read { query, reply } => {
                let _ = reply.send(self.read(query).await);
            }
            ActorCommand::CheckRepoAuth {
                repo_key,
                repo_url,
                reply,
            } => {
                let result = self
                    .sandbox
                    .check_auth(&self.store, &repo_key, &repo_url)
                    .await;
                let _ = reply.send(result);
            }
            ActorCommand::StoreCredential {
                repo_key,
                repo_url,
                token,
                expires_at,
                reply,
            } => {
                let result = self
                    .sandbox
                    .store_credential(&self.store, &repo_key, &repo_url, &token, expires_at)
                    .await;
                let _ = reply.send(result);
            }
            ActorCommand::ClearCredential { repo_key, reply } => {
                let result = self.store.clear_project_credential(&repo_key).await;
                let _ = reply.send(result);
            }
            ActorCommand::CreateSandbox {
                repo_key,
                branch,
                reply,
            } => {
                let result = self
                    .sandbox
                    .begin_create(&self.store, self.handle.clone(), &repo_key, branch)
                    .await;
                if result.is_ok() {
                    self.schedule_sweep();
                }
                let _ = reply.send(result);
            }
            ActorCommand::SandboxHeartbeat { id, reply } => {
                let result = self.sandbox.heartbeat(&self.store, id).await;
                let _ = reply.send(result);
            }
            ActorCommand::TerminateSandbox { id, reply } => {
                let result = self.sandbox.terminate(&self.store, id).await;
                let _ = reply.send(result);
            }
            ActorCommand::UpdateSandboxStatus { id, status } => {
                if let Err(e) = self.sandbox.update_status(&self.store, id, status).await {
                    tracing::warn!("{}: sandbox {} status update dropped: {}", self.slug, id, e);
                }
            }
            ActorCommand::Sweep => {
                self.sweep_scheduled = false;
                match self.sandbox.sweep(&self.store, Utc::now()).await {
                    Ok(active_remaining) => {
                        if active_remaining {
                            self.schedule_sweep();
                        }
                    }
                    Err(e) => {
                        tracing::error!("{}: sandbox sweep failed: {}", self.slug, e);
                        self.schedule_sweep();
                    }
                }
            }
        }
    }

    /// Arm the sweep timer. Idempotent; the timer only reschedules itself
    /// while sandbox session rows remain.
    fn schedule_sweep(&mut self) {
        if self.sweep_scheduled {
            return;
        }
        self.sweep_scheduled = true;
        let handle = self.handle.clone();
        let interval = Duration::from_secs(self.config.sandbox.sweep_interval_secs);
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            handle.sweep().await;
        });
    }

    /// Send a change event to every attached sync peer except the originator.
    /// Sends are awaited in command order so each peer observes events in the
    /// order mutations were applied.
    async fn broadcast(&mut self, origin: Option<Uuid>, event: ChangeEvent) {
        let mut dead = Vec::new();
        for (conn_id, sender) in &self.peers {
            if Some(*conn_id) == origin {
                continue;
            }
            let msg = SyncServerMessage::Broadcast {
                event: event.clone(),
            };
            if sender.send(msg).await.is_err() {
                dead.push(*conn_id);
            }
        }
        for conn_id in dead {
            self.peers.remove(&conn_id);
        }
    }

    /// Apply a mutation against the store. Returns the response payload and
    /// the change event to broadcast; both carry the persisted result, never
    /// the raw input.
    async fn apply(&self, command: SyncCommand) -> Result<(Value, Option<ChangeEvent>), AppError> {
        use SyncCommand::*;
        match command {
            SessionCreate { id, name, meta } => {
                let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
                let record = self
                    .store
                    .create_session(&id, name.as_deref(), &meta)
                    .await?;
                self.changed(EntityKind::Session, ChangeAction::Created, &record)
            }
            SessionSave {
                id,
                name,
                meta,
                messages,
            } => {
                let (record, created) = self
                    .store
                    .save_session(&id, name.as_deref(), &meta, &messages)
                    .await?;
                self.changed(EntityKind::Session, action_for(created), &record)
            }
            SessionDelete { id } => {
                if !self.store.delete_session(&id).await? {
                    return Err(AppError::NotFound(format!("session '{id}'")));
                }
                self.deleted(EntityKind::Session, json!({ "id": id }))
            }
            SessionUpdateMeta {
                id,
                name,
                flagged,
                meta,
            } => {
                let record = self
                    .store
                    .update_session_meta(&id, name.as_deref(), flagged, meta.as_ref())
                    .await?;
                self.changed(EntityKind::Session, ChangeAction::Updated, &record)
            }
            SessionUpdateSdkId { id, sdk_session_id } => {
                let record = self
                    .store
                    .update_session_sdk_id(&id, &sdk_session_id)
                    .await?;
                self.changed(EntityKind::Session, ChangeAction::Updated, &record)
            }
            SessionClearMessages { id } => {
                let record = self.store.clear_session_messages(&id).await?;
                self.changed(EntityKind::Session, ChangeAction::Updated, &record)
            }
            SourceCreate { slug, config } => {
                let record = self.store.create_source(&slug, &config).await?;
                self.changed(EntityKind::Source, ChangeAction::Created, &record)
            }
            SourceSaveConfig { slug, config } => {
                let record = self.store.save_source_config(&slug, &config).await?;
                self.changed(EntityKind::Source, ChangeAction::Updated, &record)
            }
            SourceSaveGuide { slug, guide } => {
                let record = self.store.save_source_guide(&slug, &guide).await?;
                self.changed(EntityKind::Source, ChangeAction::Updated, &record)
            }
            SourceDelete { slug } => {
                if !self.store.delete_source(&slug).await? {
                    return Err(AppError::NotFound(format!("source '{slug}'")));
                }
                self.deleted(EntityKind::Source, json!({ "slug": slug }))
            }
            StatusesSave(config) => {
                let saved = self.store.save_statuses(&config).await?;
                self.changed(EntityKind::Statuses, ChangeAction::Updated, &saved)
            }
            LabelsSave(config) => {
                let saved = self.store.save_labels(&config).await?;
                self.changed(EntityKind::Labels, ChangeAction::Updated, &saved)
            }
            SkillSave {
                slug,
                content,
                meta,
            } => {
                let (record, created) = self.store.upsert_skill(&slug, &content, &meta).await?;
                self.changed(EntityKind::Skill, action_for(created), &record)
            }
            SkillDelete { slug } => {
                if !self.store.delete_skill(&slug).await? {
                    return Err(AppError::NotFound(format!("skill '{slug}'")));
                }
                self.deleted(EntityKind::Skill, json!({ "slug": slug }))
            }
            PlanSave {
                session_id,
                name,
                content,
            } => {
                let (record, created) = self.store.save_plan(&session_id, &name, &content).await?;
                self.changed(EntityKind::Plan, action_for(created), &record)
            }
            PlanDelete { session_id, name } => {
                if !self.store.delete_plan(&session_id, &name).await? {
                    return Err(AppError::NotFound(format!(
                        "plan '{name}' for session '{session_id}'"
                    )));
                }
                self.deleted(
                    EntityKind::Plan,
                    json!({ "sessionId": session_id, "name": name }),
                )
            }
        }
    }

    fn changed<T: serde::Serialize>(
        &self,
        entity: EntityKind,
        action: ChangeAction,
        record: &T,
    ) -> Result<(Value, Option<ChangeEvent>), AppError> {
        let data = serde_json::to_value(record)?;
        let event = ChangeEvent {
            entity,
            action,
            data: data.clone(),
        };
        Ok((data, Some(event)))
    }

    fn deleted(
        &self,
        entity: EntityKind,
        data: Value,
    ) -> Result<(Value, Option<ChangeEvent>), AppError> {
        let event = ChangeEvent {
            entity,
            action: ChangeAction::Deleted,
            data: data.clone(),
        };
        Ok((data, Some(event)))
    }

    async fn read(&self, query: ReadQuery) -> Result<Value, AppError> {
        let value = match query {
            ReadQuery::Sessions => serde_json::to_value(self.store.list_sessions().await?)?,
            ReadQuery::Session(id) => {
                let record = self
                    .store
                    .get_session(&id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("session '{id}'")))?;
                serde_json::to_value(record)?
            }
            ReadQuery::Sources => serde_json::to_value(self.store.list_sources().await?)?,
            ReadQuery::Statuses => serde_json::to_value(self.store.get_statuses().await?)?,
            ReadQuery::Labels => serde_json::to_value(self.store.get_labels().await?)?,
            ReadQuery::Skills => serde_json::to_value(self.store.list_skills().await?)?,
            ReadQuery::Plans(session_id) => {
                serde_json::to_value(self.store.list_plans(&session_id).await?)?
            }
            ReadQuery::Projects => {
                let infos = self
                    .store
                    .list_projects()
                    .await?
                    .into_iter()
                    .map(|row| row.into_info())
                    .collect::<Result<Vec<_>, _>>()?;
                serde_json::to_value(infos)?
            }
            ReadQuery::Sandboxes => {
                let infos = self
                    .store
                    .list_sandboxes()
                    .await?
                    .into_iter()
                    .map(|row| row.into_info())
                    .collect::<Result<Vec<_>, _>>()?;
                serde_json::to_value(infos)?
            }
            ReadQuery::Sandbox(id) => {
                let row = self.store.require_sandbox(&id.to_string()).await?;
                serde_json::to_value(row.into_info()?)?
            }
        };
        Ok(value)
    }
}

fn action_for(created: bool) -> ChangeAction {
    if created {
        ChangeAction::Created
    } else {
        ChangeAction::Updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::HostRegistry;

    async fn test_handle() -> WorkspaceHandle {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        spawn(
            "test-ws".into(),
            store,
            Arc::new(Config::default()),
            Arc::new(HostRegistry::new()),
        )
    }

    fn create_cmd(id: &str) -> SyncCommand {
        SyncCommand::SessionCreate {
            id: Some(id.into()),
            name: Some("Test".into()),
            meta: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_mutation_broadcasts_to_other_peers_only() {
        let handle = test_handle().await;

        let peer_a = Uuid::new_v4();
        let peer_b = Uuid::new_v4();
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        handle.attach(peer_a, tx_a).await.unwrap();
        handle.attach(peer_b, tx_b).await.unwrap();

        let data = handle.mutate(Some(peer_a), create_cmd("s1")).await.unwrap();
        assert_eq!(data["id"], "s1");

        // B hears the event; the payload equals what the mutator read back.
        let msg = rx_b.recv().await.unwrap();
        let SyncServerMessage::Broadcast { event } = msg else {
            panic!("expected broadcast");
        };
        assert_eq!(event.entity, EntityKind::Session);
        assert_eq!(event.action, ChangeAction::Created);
        assert_eq!(event.data, data);

        // A (the originator) hears nothing.
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rest_mutation_broadcasts_to_all() {
        let handle = test_handle().await;
        handle.mutate(None, create_cmd("s1")).await.unwrap();

        let peer = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(16);
        handle.attach(peer, tx).await.unwrap();

        // No originator: every attached peer hears it.
        handle
            .mutate(
                None,
                SyncCommand::SessionUpdateMeta {
                    id: "s1".into(),
                    name: None,
                    flagged: Some(true),
                    meta: None,
                },
            )
            .await
            .unwrap();

        let SyncServerMessage::Broadcast { event } = rx.recv().await.unwrap() else {
            panic!("expected broadcast");
        };
        assert_eq!(event.data["flagged"], true);
    }

    #[tokio::test]
    async fn test_create_delete_then_update_fails() {
        let handle = test_handle().await;
        handle.mutate(None, create_cmd("s1")).await.unwrap();
        handle
            .mutate(None, SyncCommand::SessionDelete { id: "s1".into() })
            .await
            .unwrap();

        let err = handle
            .mutate(
                None,
                SyncCommand::SessionUpdateSdkId {
                    id: "s1".into(),
                    sdk_session_id: "sdk-1".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = handle
            .read(ReadQuery::Session("s1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_statuses_save_is_idempotent() {
        let handle = test_handle().await;
        let peer = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(16);
        handle.attach(peer, tx).await.unwrap();

        let config: shared::StatusConfig = serde_json::from_value(serde_json::json!({
            "version": 1,
            "statuses": [{"id": "open", "label": "Open"}],
        }))
        .unwrap();

        let first = handle
            .mutate(None, SyncCommand::StatusesSave(config.clone()))
            .await
            .unwrap();
        let second = handle
            .mutate(None, SyncCommand::StatusesSave(config))
            .await
            .unwrap();
        assert_eq!(first, second);

        // Two broadcasts with identical data, not one and not a merge.
        let SyncServerMessage::Broadcast { event: e1 } = rx.recv().await.unwrap() else {
            panic!("expected broadcast");
        };
        let SyncServerMessage::Broadcast { event: e2 } = rx.recv().await.unwrap() else {
            panic!("expected broadcast");
        };
        assert_eq!(e1.data, e2.data);
    }

    #[tokio::test]
    async fn test_detached_peer_stops_hearing() {
        let handle = test_handle().await;
        let peer = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(16);
        handle.attach(peer, tx).await.unwrap();
        handle.detach(peer).await;

        handle.mutate(None, create_cmd("s1")).await.unwrap();
        // Channel was dropped by the actor on detach.
        assert!(rx.recv().await.is_none());
    }
}
