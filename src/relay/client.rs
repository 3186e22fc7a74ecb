//! [`RealtimeDatabase`] client speaking the relay protocol over WebSocket

use super::protocol::{DbRequest, DbResponse};
use crate::errors::{SyncError, SyncResult};
use crate::sync::{RealtimeDatabase, WatchStream};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

type Pending = Arc<DashMap<u64, oneshot::Sender<DbResponse>>>;
type Watches = Arc<DashMap<u64, mpsc::UnboundedSender<Option<Value>>>>;

/// Connection to a relay. Dropping it closes the socket, which triggers the
/// relay's on-disconnect removals.
pub struct WsDatabase {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    watches: Watches,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl WsDatabase {
    /// Open a connection; `timeout` bounds the handshake and every request
    pub async fn connect(url: &str, timeout: Duration) -> SyncResult<Self> {
        let (socket, _) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| SyncError::Timeout {
                op: "connect",
                timeout_ms: timeout.as_millis() as u64,
            })??;
        info!(url = %url, "Connected to bingo relay");

        let (mut sink, mut stream) = socket.split();
        let (outgoing, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let pending: Pending = Arc::new(DashMap::new());
        let watches: Watches = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!("Relay write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = {
            let pending = pending.clone();
            let watches = watches.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(message) = stream.next().await {
                    let text = match message {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            warn!("Relay connection error: {}", e);
                            break;
                        }
                    };
                    match serde_json::from_str::<DbResponse>(&text) {
                        Ok(DbResponse::Event { watch_id, value }) => {
                            if let Some(watch) = watches.get(&watch_id) {
                                let _ = watch.send(value);
                            }
                        }
                        Ok(response) => {
                            let id = match &response {
                                DbResponse::Ok { id, .. } | DbResponse::Error { id, .. } => *id,
                                DbResponse::Event { .. } => continue,
                            };
                            if let Some((_, waiter)) = pending.remove(&id) {
                                let _ = waiter.send(response);
                            }
                        }
                        Err(e) => debug!("Ignoring malformed relay message: {}", e),
                    }
                }

                // Fail in-flight requests and end every watch stream
                closed.store(true, Ordering::SeqCst);
                pending.clear();
                watches.clear();
                info!("Disconnected from bingo relay");
            })
        };

        Ok(Self {
            outgoing,
            pending,
            watches,
            closed,
            next_id: AtomicU64::new(1),
            timeout,
            tasks: vec![writer, reader],
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn call(
        &self,
        op: &'static str,
        id: u64,
        request: DbRequest,
    ) -> SyncResult<Option<Value>> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let text = serde_json::to_string(&request)?;
        if self.outgoing.send(Message::Text(text)).is_err() {
            self.pending.remove(&id);
            return Err(SyncError::Closed);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Err(_) => {
                self.pending.remove(&id);
                Err(SyncError::Timeout {
                    op,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
            Ok(Err(_)) => Err(SyncError::Closed),
            Ok(Ok(DbResponse::Ok { value, .. })) => Ok(value),
            Ok(Ok(DbResponse::Error { message, .. })) => Err(SyncError::Remote(message)),
            Ok(Ok(DbResponse::Event { .. })) => Err(SyncError::Remote(format!(
                "unexpected event in reply to {}",
                op
            ))),
        }
    }
}

impl Drop for WsDatabase {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl RealtimeDatabase for WsDatabase {
    async fn set(&self, path: &str, value: Value) -> SyncResult<()> {
        let id = self.next_id();
        let path = path.to_string();
        self.call("set", id, DbRequest::Set { id, path, value }).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> SyncResult<Option<Value>> {
        let id = self.next_id();
        let path = path.to_string();
        self.call("get", id, DbRequest::Get { id, path }).await
    }

    async fn push(&self, path: &str, value: Value) -> SyncResult<String> {
        let id = self.next_id();
        let path = path.to_string();
        match self.call("push", id, DbRequest::Push { id, path, value }).await? {
            Some(Value::String(key)) => Ok(key),
            other => Err(SyncError::Remote(format!("push returned no key: {:?}", other))),
        }
    }

    async fn remove(&self, path: &str) -> SyncResult<()> {
        let id = self.next_id();
        let path = path.to_string();
        self.call("remove", id, DbRequest::Remove { id, path }).await?;
        Ok(())
    }

    async fn watch(&self, path: &str) -> SyncResult<WatchStream> {
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        // Registered first so the initial event cannot race the reply
        self.watches.insert(id, tx);

        let request = DbRequest::Watch {
            id,
            path: path.to_string(),
        };
        if let Err(e) = self.call("watch", id, request).await {
            self.watches.remove(&id);
            return Err(e);
        }

        let watches = self.watches.clone();
        let outgoing = self.outgoing.clone();
        Ok(WatchStream::new(rx, move || {
            watches.remove(&id);
            if let Ok(text) = serde_json::to_string(&DbRequest::Unwatch { watch_id: id }) {
                let _ = outgoing.send(Message::Text(text));
            }
        }))
    }

    async fn remove_on_disconnect(&self, path: &str) -> SyncResult<()> {
        let id = self.next_id();
        let path = path.to_string();
        self.call("on_disconnect_remove", id, DbRequest::OnDisconnectRemove { id, path })
            .await?;
        Ok(())
    }
}
