//! Relay server: one shared [`MemoryDatabase`] exposed over WebSocket at `/ws`

use super::protocol::{DbRequest, DbResponse};
use crate::config::RelayConfig;
use crate::errors::SyncResult;
use crate::sync::keys::path_segments;
use crate::sync::MemoryDatabase;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

struct RelayState {
    db: MemoryDatabase,
    clients: AtomicU64,
    next_client: AtomicU64,
}

pub struct RelayServer {
    config: RelayConfig,
    db: MemoryDatabase,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self::with_database(config, MemoryDatabase::new())
    }

    pub fn with_database(config: RelayConfig, db: MemoryDatabase) -> Self {
        Self { config, db }
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(RelayState {
            db: self.db.clone(),
            clients: AtomicU64::new(0),
            next_client: AtomicU64::new(1),
        });

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.socket_address()).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        info!("Bingo relay listening on ws://{}/ws", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Bingo relay stopped");
        Ok(())
    }
}

async fn health_handler(State(state): State<Arc<RelayState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "clients": state.clients.load(Ordering::SeqCst),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Per-connection bookkeeping, undone when the socket closes
#[derive(Default)]
struct Connection {
    watches: HashMap<u64, JoinHandle<()>>,
    on_disconnect: Vec<String>,
}

async fn handle_connection(socket: WebSocket, state: Arc<RelayState>) {
    let client_id = state.next_client.fetch_add(1, Ordering::SeqCst);
    let total = state.clients.fetch_add(1, Ordering::SeqCst) + 1;
    info!(client = client_id, total, "Relay client connected");

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<DbResponse>();

    let send_task = tokio::spawn(async move {
        while let Some(response) = out_rx.recv().await {
            let text = match serde_json::to_string(&response) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to serialize relay response: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut conn = Connection::default();
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<DbRequest>(&text) {
                Ok(request) => {
                    if let Some(response) = handle_request(&state.db, &mut conn, &out_tx, request) {
                        if out_tx.send(response).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => debug!(client = client_id, "Ignoring malformed request: {}", e),
            },
            Ok(Message::Close(_)) => {
                debug!(client = client_id, "Client requested close");
                break;
            }
            Err(e) => {
                debug!(client = client_id, "WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    for (_, task) in conn.watches.drain() {
        task.abort();
    }
    for path in conn.on_disconnect.drain(..) {
        if let Err(e) = state.db.remove(&path) {
            warn!(client = client_id, path = %path, "On-disconnect removal failed: {}", e);
        }
    }
    send_task.abort();

    let remaining = state.clients.fetch_sub(1, Ordering::SeqCst) - 1;
    info!(client = client_id, remaining, "Relay client disconnected");
}

fn reply(id: u64, result: SyncResult<Option<Value>>) -> DbResponse {
    match result {
        Ok(value) => DbResponse::Ok { id, value },
        Err(e) => DbResponse::Error {
            id,
            message: e.to_string(),
        },
    }
}

fn handle_request(
    db: &MemoryDatabase,
    conn: &mut Connection,
    out: &mpsc::UnboundedSender<DbResponse>,
    request: DbRequest,
) -> Option<DbResponse> {
    let response = match request {
        DbRequest::Set { id, path, value } => reply(id, db.set(&path, value).map(|_| None)),
        DbRequest::Get { id, path } => reply(id, db.get(&path)),
        DbRequest::Push { id, path, value } => {
            reply(id, db.push(&path, value).map(|key| Some(Value::String(key))))
        }
        DbRequest::Remove { id, path } => reply(id, db.remove(&path).map(|_| None)),
        DbRequest::Watch { id, path } => match db.watch(&path) {
            Ok(mut stream) => {
                // Acknowledge before the first event goes out
                if out.send(DbResponse::Ok { id, value: None }).is_err() {
                    return None;
                }
                let out = out.clone();
                let task = tokio::spawn(async move {
                    while let Some(value) = stream.next().await {
                        if out.send(DbResponse::Event { watch_id: id, value }).is_err() {
                            break;
                        }
                    }
                });
                if let Some(previous) = conn.watches.insert(id, task) {
                    previous.abort();
                }
                return None;
            }
            Err(e) => reply(id, Err(e)),
        },
        DbRequest::Unwatch { watch_id } => {
            if let Some(task) = conn.watches.remove(&watch_id) {
                task.abort();
            }
            return None;
        }
        DbRequest::OnDisconnectRemove { id, path } => {
            let result = path_segments(&path).map(|_| {
                conn.on_disconnect.push(path);
                None
            });
            reply(id, result)
        }
    };
    Some(response)
}
