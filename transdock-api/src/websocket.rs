//! WebSocket monitoring endpoint and event fan-out
//!
//! The orchestrator emits progress events into the broadcaster's queue; a
//! worker delivers them to connections filtered by their subscription sets.
//! Events are advisory: when the queue is full they are dropped.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::state::AppState;

/// Event categories a client can subscribe to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MigrationProgress,
    MigrationCompleted,
    MigrationFailed,
    MigrationCancelled,
    ZfsOperation,
    PoolHealth,
    SystemAlert,
    SystemStatus,
    ConnectionEstablished,
    SubscriptionUpdated,
    Pong,
    Error,
}

/// One server-to-client frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    pub event_type: EventType,
    pub data: serde_json::Value,
    pub timestamp: String,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl WsMessage {
    pub fn new(event_type: EventType, data: serde_json::Value, user_id: Option<String>) -> Self {
        Self {
            event_type,
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
            message_id: Uuid::new_v4().to_string(),
            user_id,
        }
    }
}

/// Client-to-server actions
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientAction {
    Subscribe { event_types: Vec<EventType> },
    Unsubscribe { event_types: Vec<EventType> },
    GetStatus,
    Ping,
}

struct Connection {
    sender: mpsc::UnboundedSender<WsMessage>,
    subscriptions: HashSet<EventType>,
    username: Option<String>,
}

/// Registry of live WebSocket connections.
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, Connection>>,
    connection_counter: AtomicU64,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connection_counter: AtomicU64::new(0),
        }
    }

    async fn register(
        &self,
        username: Option<String>,
    ) -> (String, mpsc::UnboundedReceiver<WsMessage>) {
        let seq = self.connection_counter.fetch_add(1, Ordering::SeqCst);
        let connection_id = format!("conn-{}-{}", seq, &Uuid::new_v4().to_string()[..8]);
        let (tx, rx) = mpsc::unbounded_channel();

        self.connections.write().await.insert(
            connection_id.clone(),
            Connection {
                sender: tx,
                subscriptions: HashSet::new(),
                username,
            },
        );

        info!("WebSocket connection registered: {}", connection_id);
        (connection_id, rx)
    }

    async fn unregister(&self, connection_id: &str) {
        self.connections.write().await.remove(connection_id);
        info!("WebSocket connection closed: {}", connection_id);
    }

    async fn subscribe(&self, connection_id: &str, event_types: &[EventType]) -> Vec<EventType> {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get_mut(connection_id) {
            conn.subscriptions.extend(event_types.iter().copied());
            conn.subscriptions.iter().copied().collect()
        } else {
            Vec::new()
        }
    }

    async fn unsubscribe(&self, connection_id: &str, event_types: &[EventType]) -> Vec<EventType> {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get_mut(connection_id) {
            for event_type in event_types {
                conn.subscriptions.remove(event_type);
            }
            conn.subscriptions.iter().copied().collect()
        } else {
            Vec::new()
        }
    }

    async fn send_to(&self, connection_id: &str, message: WsMessage) {
        let connections = self.connections.read().await;
        if let Some(conn) = connections.get(connection_id) {
            if conn.sender.send(message).is_err() {
                debug!("Connection {} channel closed", connection_id);
            }
        }
    }

    /// Deliver to every subscribed connection; a user-scoped message only
    /// reaches that user's connections.
    async fn dispatch(&self, message: &WsMessage) {
        let connections = self.connections.read().await;
        for (id, conn) in connections.iter() {
            if !conn.subscriptions.contains(&message.event_type) {
                continue;
            }
            if let Some(user) = &message.user_id {
                if conn.username.as_deref() != Some(user.as_str()) {
                    continue;
                }
            }
            if conn.sender.send(message.clone()).is_err() {
                debug!("Connection {} channel closed during dispatch", id);
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

const EVENT_QUEUE_CAPACITY: usize = 1000;

/// Single-writer/multi-reader event fan-out.
pub struct EventBroadcaster {
    manager: Arc<ConnectionManager>,
    queue_tx: mpsc::Sender<WsMessage>,
    queue_rx: Mutex<Option<mpsc::Receiver<WsMessage>>>,
    shutdown: CancellationToken,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EventBroadcaster {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            manager,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// Start the delivery worker.
    pub async fn start(&self) {
        let mut rx = match self.queue_rx.lock().await.take() {
            Some(rx) => rx,
            None => return, // already started
        };
        let manager = self.manager.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => manager.dispatch(&message).await,
                        None => break,
                    },
                }
            }
            debug!("Event broadcaster worker stopped");
        });

        *self.worker.lock().await = Some(handle);
        info!("Event broadcaster started");
    }

    /// Stop the worker; queued events are dropped.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
        info!("Event broadcaster stopped");
    }

    /// Non-blocking enqueue. Events are advisory; on overflow the newest
    /// event is dropped with a warning.
    pub fn emit(&self, event_type: EventType, data: serde_json::Value, user_id: Option<String>) {
        let message = WsMessage::new(event_type, data, user_id);
        if let Err(e) = self.queue_tx.try_send(message) {
            warn!("Dropping event, queue full or closed: {}", e);
        }
    }

    pub fn emit_migration_progress(
        &self,
        migration_id: &str,
        progress: f64,
        status: &str,
        details: serde_json::Value,
    ) {
        self.emit(
            EventType::MigrationProgress,
            serde_json::json!({
                "migration_id": migration_id,
                "progress": progress,
                "status": status,
                "details": details,
            }),
            None,
        );
    }
}

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    token: Option<String>,
}

/// GET /ws/monitor?token=…
pub async fn ws_monitor_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsAuthQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let username = match &query.token {
        Some(token) => match state.auth.verify_access_token(token) {
            Ok(claims) => Some(claims.sub),
            Err(e) => {
                warn!("WebSocket auth failed: {}", e);
                return crate::error::ApiError::AuthenticationFailed.into_response();
            }
        },
        None => None,
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, username))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, username: Option<String>) {
    let manager = state.connections.clone();
    let (connection_id, mut outbound_rx) = manager.register(username.clone()).await;

    let (mut sink, mut stream) = socket.split();

    manager
        .send_to(
            &connection_id,
            WsMessage::new(
                EventType::ConnectionEstablished,
                serde_json::json!({ "connection_id": connection_id }),
                username.clone(),
            ),
        )
        .await;

    // Forward queued messages to the client.
    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(_) => continue,
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                handle_client_message(&state, &manager, &connection_id, &text).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    send_task.abort();
    manager.unregister(&connection_id).await;
}

async fn handle_client_message(
    state: &Arc<AppState>,
    manager: &Arc<ConnectionManager>,
    connection_id: &str,
    text: &str,
) {
    let action: ClientAction = match serde_json::from_str(text) {
        Ok(action) => action,
        Err(e) => {
            manager
                .send_to(
                    connection_id,
                    WsMessage::new(
                        EventType::Error,
                        serde_json::json!({ "message": format!("invalid message: {}", e) }),
                        None,
                    ),
                )
                .await;
            return;
        }
    };

    match action {
        ClientAction::Subscribe { event_types } => {
            let current = manager.subscribe(connection_id, &event_types).await;
            manager
                .send_to(
                    connection_id,
                    WsMessage::new(
                        EventType::SubscriptionUpdated,
                        serde_json::json!({ "subscribed": current }),
                        None,
                    ),
                )
                .await;
        }
        ClientAction::Unsubscribe { event_types } => {
            let current = manager.unsubscribe(connection_id, &event_types).await;
            manager
                .send_to(
                    connection_id,
                    WsMessage::new(
                        EventType::SubscriptionUpdated,
                        serde_json::json!({ "subscribed": current }),
                        None,
                    ),
                )
                .await;
        }
        ClientAction::GetStatus => {
            let active = state
                .orchestrator
                .running_count()
                .await;
            manager
                .send_to(
                    connection_id,
                    WsMessage::new(
                        EventType::SystemStatus,
                        serde_json::json!({
                            "connections": manager.connection_count().await,
                            "running_migrations": active,
                        }),
                        None,
                    ),
                )
                .await;
        }
        ClientAction::Ping => {
            manager
                .send_to(
                    connection_id,
                    WsMessage::new(EventType::Pong, serde_json::json!({}), None),
                )
                .await;
        }
    }
}
