//! Client-side bridge to a Loft server: a reconnecting WebSocket with
//! request/response correlation, change-event fan-out, and handlers for
//! broker-initiated actions and queries.
//!
//! One bridge instance speaks to one endpoint. Pointed at a workspace sync
//! socket it is a mutation/read client; pointed at the relay control socket
//! (with an API key) it authenticates and serves actions and queries.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use shared::{
    ChangeEvent, RelayClientMessage, RelayServerMessage, SyncCommand, SyncEnvelope,
    SyncServerMessage,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Delay before reconnect attempt number `failures + 1`: exponential from the
/// initial delay, capped, and reset to the start on a successful connect.
pub fn backoff_delay(failures: u32) -> Duration {
    let exp = INITIAL_RECONNECT_DELAY
        .checked_mul(2u32.saturating_pow(failures))
        .unwrap_or(MAX_RECONNECT_DELAY);
    std::cmp::min(exp, MAX_RECONNECT_DELAY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("not connected")]
    NotConnected,

    #[error("request timed out")]
    RequestTimeout,

    #[error("connection lost")]
    ConnectionLost,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("server error: {0}")]
    Remote(String),

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub url: String,
    pub attachments: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub resource: String,
    pub workspace_slug: Option<String>,
}

pub type ActionHandler =
    Arc<dyn Fn(ActionRequest) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;
pub type QueryHandler =
    Arc<dyn Fn(QueryRequest) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

type ChangeListener = Box<dyn Fn(&ChangeEvent) + Send + Sync>;
type StateListener = Box<dyn Fn(BridgeState) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub url: String,
    /// When set, an `auth` frame is sent first and `auth_ok` is required
    /// before the connection counts as established.
    pub api_key: Option<String>,
}

/// Inbound frames are internally tagged by `type` with disjoint tag sets
/// across the two channel vocabularies, so one untagged union covers both.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InboundFrame {
    Sync(SyncServerMessage),
    Relay(RelayServerMessage),
}

pub struct RelayBridge {
    inner: Arc<Inner>,
}

struct Inner {
    config: BridgeConfig,
    state_tx: watch::Sender<BridgeState>,
    state_rx: watch::Receiver<BridgeState>,
    pending: DashMap<String, oneshot::Sender<Result<Value, BridgeError>>>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    // Fired by disconnect() to break the live connection's read loop.
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    auto_reconnect: AtomicBool,
    connect_lock: Mutex<()>,
    change_listeners: StdMutex<Vec<(u64, ChangeListener)>>,
    state_listeners: StdMutex<Vec<(u64, StateListener)>>,
    next_listener_id: AtomicU64,
    action_handler: StdMutex<Option<ActionHandler>>,
    query_handler: StdMutex<Option<QueryHandler>>,
    supervisor_active: AtomicBool,
}

impl RelayBridge {
    pub fn new(config: BridgeConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(BridgeState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                state_tx,
                state_rx,
                pending: DashMap::new(),
                outbound: Mutex::new(None),
                shutdown: Mutex::new(None),
                auto_reconnect: AtomicBool::new(false),
                connect_lock: Mutex::new(()),
                change_listeners: StdMutex::new(Vec::new()),
                state_listeners: StdMutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                action_handler: StdMutex::new(None),
                query_handler: StdMutex::new(None),
                supervisor_active: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.inner.state_rx.borrow()
    }

    /// Establish the connection. Idempotent: while already connecting or
    /// connected this waits for the in-flight attempt instead of opening a
    /// second socket. Auto-reconnect stays armed until [`disconnect`].
    ///
    /// [`disconnect`]: RelayBridge::disconnect
    pub async fn connect(&self) -> Result<(), BridgeError> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.state() == BridgeState::Connected {
            return Ok(());
        }
        self.inner.auto_reconnect.store(true, Ordering::SeqCst);

        if self.inner.supervisor_active.swap(true, Ordering::SeqCst) {
            // A supervisor is already reconnecting in the background; wait
            // for it instead of racing it with a second socket.
            let mut rx = self.inner.state_rx.clone();
            loop {
                if *rx.borrow() == BridgeState::Connected {
                    return Ok(());
                }
                if !self.inner.supervisor_active.load(Ordering::SeqCst) {
                    return Err(BridgeError::NotConnected);
                }
                let _ = tokio::time::timeout(Duration::from_millis(100), rx.changed()).await;
            }
        }

        let (first_tx, first_rx) = oneshot::channel();
        tokio::spawn(Inner::run(self.inner.clone(), first_tx));
        first_rx.await.map_err(|_| BridgeError::ConnectionLost)?
    }

    /// Close the socket, reject anything in flight, and suppress all future
    /// auto-reconnects until the next `connect()`. Returns once the bridge
    /// has settled in the disconnected state.
    pub async fn disconnect(&self) {
        self.inner.auto_reconnect.store(false, Ordering::SeqCst);
        self.inner.outbound.lock().await.take();
        let was_live = match self.inner.shutdown.lock().await.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        };
        if was_live || self.inner.supervisor_active.load(Ordering::SeqCst) {
            let mut rx = self.inner.state_rx.clone();
            while *rx.borrow_and_update() != BridgeState::Disconnected {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Send one sync command and wait for its correlated response.
    pub async fn send(&self, command: SyncCommand) -> Result<Value, BridgeError> {
        let outbound = self
            .inner
            .outbound
            .lock()
            .await
            .clone()
            .ok_or(BridgeError::NotConnected)?;

        let request_id = Uuid::new_v4().to_string();
        let envelope = SyncEnvelope {
            request_id: request_id.clone(),
            command,
        };
        let frame =
            serde_json::to_string(&envelope).map_err(|e| BridgeError::Transport(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(request_id.clone(), tx);
        if outbound.send(frame).await.is_err() {
            self.inner.pending.remove(&request_id);
            return Err(BridgeError::NotConnected);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::ConnectionLost),
            Err(_) => {
                self.inner.pending.remove(&request_id);
                Err(BridgeError::RequestTimeout)
            }
        }
    }

    /// Subscribe to change events broadcast by other peers.
    pub fn on_remote_change(
        &self,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .change_listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, Box::new(callback)));
        Subscription {
            inner: self.inner.clone(),
            kind: ListenerKind::Change,
            id,
        }
    }

    /// Subscribe to connection state transitions.
    pub fn on_state_change(
        &self,
        callback: impl Fn(BridgeState) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .state_listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, Box::new(callback)));
        Subscription {
            inner: self.inner.clone(),
            kind: ListenerKind::State,
            id,
        }
    }

    /// Handler for broker-delivered actions; the result is acked back.
    pub fn set_action_handler(
        &self,
        handler: impl Fn(ActionRequest) -> BoxFuture<'static, Result<(), String>>
            + Send
            + Sync
            + 'static,
    ) {
        *self
            .inner
            .action_handler
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(handler));
    }

    /// Handler for broker-initiated read queries.
    pub fn set_query_handler(
        &self,
        handler: impl Fn(QueryRequest) -> BoxFuture<'static, Result<Value, String>>
            + Send
            + Sync
            + 'static,
    ) {
        *self
            .inner
            .query_handler
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(handler));
    }
}

enum ListenerKind {
    Change,
    State,
}

/// Handle returned by the subscribe methods; dropping it keeps the listener,
/// `unsubscribe` removes it.
pub struct Subscription {
    inner: Arc<Inner>,
    kind: ListenerKind,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        match self.kind {
            ListenerKind::Change => {
                self.inner
                    .change_listeners
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .retain(|(id, _)| *id != self.id);
            }
            ListenerKind::State => {
                self.inner
                    .state_listeners
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl Inner {
    fn set_state(&self, state: BridgeState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            let listeners = self
                .state_listeners
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            for (_, listener) in listeners.iter() {
                // A panicking listener must not take down the dispatch loop
                // or its neighbors.
                let _ = catch_unwind(AssertUnwindSafe(|| listener(state)));
            }
        }
    }

    fn emit_change(&self, event: &ChangeEvent) {
        let listeners = self
            .change_listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        for (_, listener) in listeners.iter() {
            let _ = catch_unwind(AssertUnwindSafe(|| listener(event)));
        }
    }

    fn reject_pending(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(BridgeError::ConnectionLost));
            }
        }
    }

    /// Connection supervisor: one attempt per iteration, exponential backoff
    /// between failed attempts, reset after any successful connect. The first
    /// attempt's outcome is reported through `first`; a first-attempt failure
    /// stops the loop so the caller decides whether to retry.
    async fn run(inner: Arc<Inner>, first: oneshot::Sender<Result<(), BridgeError>>) {
        let mut first = Some(first);
        let mut failures: u32 = 0;

        loop {
            if !inner.auto_reconnect.load(Ordering::SeqCst) {
                break;
            }
            inner.set_state(BridgeState::Connecting);

            match Self::run_connection(&inner, &mut first).await {
                Ok(()) => {
                    // Was connected, then closed. Start backoff from scratch.
                    failures = 0;
                    inner.set_state(BridgeState::Disconnected);
                }
                Err(e) => {
                    inner.set_state(BridgeState::Disconnected);
                    if let Some(tx) = first.take() {
                        inner.supervisor_active.store(false, Ordering::SeqCst);
                        let _ = tx.send(Err(e));
                        return;
                    }
                    tracing::warn!("Bridge connection attempt failed: {}", e);
                    failures += 1;
                }
            }

            if !inner.auto_reconnect.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(backoff_delay(failures)).await;
        }
        inner.set_state(BridgeState::Disconnected);
        inner.supervisor_active.store(false, Ordering::SeqCst);
    }

    /// One connection lifetime: dial, optional auth handshake, then pump
    /// frames until the socket closes. Returns `Ok` only if the connection
    /// was fully established first.
    async fn run_connection(
        inner: &Arc<Inner>,
        first: &mut Option<oneshot::Sender<Result<(), BridgeError>>>,
    ) -> Result<(), BridgeError> {
        let (ws_stream, _) = connect_async(&inner.config.url)
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        if let Some(api_key) = &inner.config.api_key {
            let auth = RelayClientMessage::Auth {
                api_key: api_key.clone(),
            };
            let frame =
                serde_json::to_string(&auth).map_err(|e| BridgeError::Transport(e.to_string()))?;
            ws_sender
                .send(Message::Text(frame.into()))
                .await
                .map_err(|e| BridgeError::Transport(e.to_string()))?;

            loop {
                match ws_receiver.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<RelayServerMessage>(&text) {
                            Ok(RelayServerMessage::AuthOk) => break,
                            Ok(RelayServerMessage::AuthError { error }) => {
                                return Err(BridgeError::Auth(error));
                            }
                            _ => continue,
                        }
                    }
                    Some(Ok(_)) => continue,
                    _ => return Err(BridgeError::Transport("closed during auth".into())),
                }
            }
        }

        if !inner.auto_reconnect.load(Ordering::SeqCst) {
            // disconnect() raced the dial; drop the socket unannounced.
            return Ok(());
        }
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        *inner.shutdown.lock().await = Some(shutdown_tx);

        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        *inner.outbound.lock().await = Some(out_tx.clone());
        inner.set_state(BridgeState::Connected);
        if let Some(tx) = first.take() {
            let _ = tx.send(Ok(()));
        }
        tracing::info!("Bridge connected to {}", inner.config.url);

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            // Dropping the sender half closes the socket.
            let _ = ws_sender.close().await;
        });

        let heartbeat_task = inner.config.api_key.as_ref().map(|_| {
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let frame = match serde_json::to_string(&RelayClientMessage::Heartbeat) {
                    Ok(frame) => frame,
                    Err(_) => return,
                };
                loop {
                    tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                    if out_tx.send(frame.clone()).await.is_err() {
                        break;
                    }
                }
            })
        });

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<InboundFrame>(&text) {
                            Ok(frame) => inner.dispatch(frame, &out_tx).await,
                            Err(e) => tracing::warn!("Bridge received invalid frame: {}", e),
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break,
                },
            }
        }

        // Socket closed or shut down: reject everything in flight before
        // reconnecting.
        *inner.shutdown.lock().await = None;
        *inner.outbound.lock().await = None;
        inner.reject_pending();
        writer_task.abort();
        if let Some(task) = heartbeat_task {
            task.abort();
        }
        tracing::info!("Bridge disconnected from {}", inner.config.url);
        Ok(())
    }

    async fn dispatch(self: &Arc<Self>, frame: InboundFrame, out_tx: &mpsc::Sender<String>) {
        match frame {
            InboundFrame::Sync(SyncServerMessage::Response {
                request_id,
                data,
                error,
            }) => {
                if let Some((_, tx)) = self.pending.remove(&request_id) {
                    let result = match error {
                        Some(error) => Err(BridgeError::Remote(error)),
                        None => Ok(data.unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(result);
                }
            }
            InboundFrame::Sync(SyncServerMessage::Broadcast { event }) => {
                self.emit_change(&event);
            }
            InboundFrame::Relay(RelayServerMessage::Action {
                url,
                id,
                attachments,
            }) => {
                let handler = self
                    .action_handler
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone();
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let result = match handler {
                        Some(handler) => handler(ActionRequest { url, attachments }).await,
                        None => Err("no action handler registered".into()),
                    };
                    let Some(id) = id else { return };
                    let ack = match result {
                        Ok(()) => RelayClientMessage::Ack {
                            id,
                            success: true,
                            error: None,
                        },
                        Err(e) => RelayClientMessage::Ack {
                            id,
                            success: false,
                            error: Some(e),
                        },
                    };
                    if let Ok(frame) = serde_json::to_string(&ack) {
                        let _ = out_tx.send(frame).await;
                    }
                });
            }
            InboundFrame::Relay(RelayServerMessage::Query {
                id,
                resource,
                workspace_slug,
            }) => {
                let handler = self
                    .query_handler
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone();
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let result = match handler {
                        Some(handler) => {
                            handler(QueryRequest {
                                resource,
                                workspace_slug,
                            })
                            .await
                        }
                        None => Err("no query handler registered".into()),
                    };
                    let reply = match result {
                        Ok(data) => RelayClientMessage::QueryResponse {
                            id,
                            data: Some(data),
                            error: None,
                        },
                        Err(e) => RelayClientMessage::QueryResponse {
                            id,
                            data: None,
                            error: Some(e),
                        },
                    };
                    if let Ok(frame) = serde_json::to_string(&reply) {
                        let _ = out_tx.send(frame).await;
                    }
                });
            }
            InboundFrame::Relay(RelayServerMessage::AuthOk)
            | InboundFrame::Relay(RelayServerMessage::AuthError { .. })
            | InboundFrame::Relay(RelayServerMessage::HeartbeatAck) => {}
        }
    }
}
