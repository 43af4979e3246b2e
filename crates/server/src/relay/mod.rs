//! Process-wide relay broker: bridges one-shot HTTP requests to connected
//! bridge clients over WebSocket, correlating acks and query responses by id.

use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use shared::RelayServerMessage;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::AppError;

pub struct RelayBroker {
    clients: DashMap<Uuid, mpsc::Sender<RelayServerMessage>>,
    pending_acks: DashMap<String, oneshot::Sender<Result<(), String>>>,
    pending_queries: DashMap<String, oneshot::Sender<Result<Value, String>>>,
    action_timeout: Duration,
    query_timeout: Duration,
}

impl RelayBroker {
    pub fn new(action_timeout: Duration, query_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            pending_acks: DashMap::new(),
            pending_queries: DashMap::new(),
            action_timeout,
            query_timeout,
        }
    }

    pub fn register(&self, conn_id: Uuid, sender: mpsc::Sender<RelayServerMessage>) {
        self.clients.insert(conn_id, sender);
        tracing::info!("Relay client registered: {}", conn_id);
    }

    pub fn unregister(&self, conn_id: &Uuid) {
        self.clients.remove(conn_id);
        tracing::info!("Relay client unregistered: {}", conn_id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Deliver an action to every connected client; the first ack settles the
    /// call. Fails with `NotFound` when no client is connected and `Timeout`
    /// when nobody acks in time.
    pub async fn deliver_action(
        &self,
        url: String,
        id: Option<String>,
        attachments: Vec<Value>,
    ) -> Result<(), AppError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let (tx, rx) = oneshot::channel();
        self.pending_acks.insert(id.clone(), tx);

        let msg = RelayServerMessage::Action {
            url,
            id: Some(id.clone()),
            attachments,
        };
        if !self.fan_out(msg).await {
            self.pending_acks.remove(&id);
            return Err(AppError::NotFound("no connected relay clients".into()));
        }

        match tokio::time::timeout(self.action_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(AppError::Internal(format!("relay client rejected action: {e}"))),
            // Sender dropped without resolving; treat like a timeout.
            Ok(Err(_)) | Err(_) => {
                self.pending_acks.remove(&id);
                Err(AppError::Timeout("action was not acknowledged".into()))
            }
        }
    }

    /// Pull read-only data from a connected client. Unanswered queries time
    /// out server-side.
    pub async fn query(
        &self,
        resource: String,
        workspace_slug: Option<String>,
    ) -> Result<Value, AppError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_queries.insert(id.clone(), tx);

        let msg = RelayServerMessage::Query {
            id: id.clone(),
            resource,
            workspace_slug,
        };
        if !self.fan_out(msg).await {
            self.pending_queries.remove(&id);
            return Err(AppError::NotFound("no connected relay clients".into()));
        }

        match tokio::time::timeout(self.query_timeout, rx).await {
            Ok(Ok(Ok(data))) => Ok(data),
            Ok(Ok(Err(e))) => Err(AppError::Internal(format!("relay client query failed: {e}"))),
            Ok(Err(_)) | Err(_) => {
                self.pending_queries.remove(&id);
                Err(AppError::Timeout("query was not answered".into()))
            }
        }
    }

    /// First ack wins; later acks for the same id are dropped.
    pub fn resolve_ack(&self, id: &str, success: bool, error: Option<String>) {
        if let Some((_, tx)) = self.pending_acks.remove(id) {
            let result = if success {
                Ok(())
            } else {
                Err(error.unwrap_or_else(|| "unspecified error".into()))
            };
            let _ = tx.send(result);
        }
    }

    pub fn resolve_query(&self, id: &str, data: Option<Value>, error: Option<String>) {
        if let Some((_, tx)) = self.pending_queries.remove(id) {
            let result = match (data, error) {
                (Some(data), None) => Ok(data),
                (_, Some(e)) => Err(e),
                (None, None) => Ok(Value::Null),
            };
            let _ = tx.send(result);
        }
    }

    /// Send to every connected client, pruning dead channels. Returns false
    /// when nothing was delivered.
    async fn fan_out(&self, msg: RelayServerMessage) -> bool {
        let senders: Vec<(Uuid, mpsc::Sender<RelayServerMessage>)> = self
            .clients
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut delivered = false;
        for (conn_id, sender) in senders {
            if sender.send(msg.clone()).await.is_ok() {
                delivered = true;
            } else {
                self.clients.remove(&conn_id);
            }
        }
        delivered
    }
}
