//! Multi-device transport over a real-time JSON tree.
//!
//! Snapshots live at `current/{id}`, the full host state at `games/{id}`.
//! Bingo calls and winners are append-only children under push keys, and
//! presence entries are cleaned up by the server when a player's connection
//! drops.

use super::keys::remote as paths;
use super::{CallStream, Delivery, SnapshotStream, SyncChannel, TransportKind};
use crate::clock::now_millis;
use crate::errors::{SyncError, SyncResult};
use crate::game::{BingoCall, CallKey, GameId, GameSnapshot, GameState, Presence, WinnerRecord};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Live view of one path. Yields the value at the path (`None` when absent)
/// on every change, starting with the current value. Ends when the
/// underlying connection is gone.
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<Option<Value>>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchStream {
    /// `cancel` runs once when the stream is dropped
    pub fn new<F>(rx: mpsc::UnboundedReceiver<Option<Value>>, cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub async fn next(&mut self) -> Option<Option<Value>> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`WatchStream::next`]
    pub fn try_next(&mut self) -> Option<Option<Value>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Minimal real-time tree API. Paths are `/`-separated; writing `null`
/// removes a node.
#[async_trait]
pub trait RealtimeDatabase: Send + Sync {
    async fn set(&self, path: &str, value: Value) -> SyncResult<()>;

    async fn get(&self, path: &str) -> SyncResult<Option<Value>>;

    /// Add a child under a fresh, time-ordered key and return the key
    async fn push(&self, path: &str, value: Value) -> SyncResult<String>;

    async fn remove(&self, path: &str) -> SyncResult<()>;

    async fn watch(&self, path: &str) -> SyncResult<WatchStream>;

    /// Ask the server to remove `path` once this connection is gone
    async fn remove_on_disconnect(&self, path: &str) -> SyncResult<()>;
}

/// Real-time-tree implementation of [`SyncChannel`]
#[derive(Clone)]
pub struct RemoteChannel {
    db: Arc<dyn RealtimeDatabase>,
}

impl RemoteChannel {
    pub fn new(db: Arc<dyn RealtimeDatabase>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<dyn RealtimeDatabase> {
        &self.db
    }
}

#[async_trait]
impl SyncChannel for RemoteChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Remote
    }

    async fn publish(&self, state: &GameState) -> SyncResult<GameSnapshot> {
        let game_id = state.game_id();
        let snapshot = state.snapshot(now_millis());

        self.db
            .set(&paths::game(game_id), serde_json::to_value(state)?)
            .await?;
        self.db
            .set(&paths::current(game_id), serde_json::to_value(&snapshot)?)
            .await?;

        debug!(game_id = %game_id, drawn = snapshot.total_drawn, "Published game state remotely");
        Ok(snapshot)
    }

    async fn load_state(&self, game_id: &GameId) -> SyncResult<Option<GameState>> {
        Ok(self
            .db
            .get(&paths::game(game_id))
            .await?
            .and_then(|value| GameState::from_json(&value.to_string())))
    }

    async fn subscribe(&self, game_id: &GameId) -> SyncResult<SnapshotStream> {
        let mut watch = self.db.watch(&paths::current(game_id)).await?;
        let game_id = game_id.clone();

        Ok(Delivery::spawn(move |tx| async move {
            while let Some(value) = watch.next().await {
                let Some(value) = value else {
                    continue;
                };
                match serde_json::from_value::<GameSnapshot>(value) {
                    Ok(snapshot) => {
                        if tx.send(snapshot).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => debug!(game_id = %game_id, "Ignoring malformed snapshot: {}", e),
                }
            }
            debug!(game_id = %game_id, "Remote snapshot subscription ended");
        }))
    }

    async fn submit_call(&self, game_id: &GameId, call: &BingoCall) -> SyncResult<CallKey> {
        let key = self
            .db
            .push(&paths::calls(game_id), serde_json::to_value(call)?)
            .await?;
        CallKey::new(key.clone()).ok_or(SyncError::InvalidKey(key))
    }

    async fn observe_calls(&self, game_id: &GameId) -> SyncResult<CallStream> {
        let mut watch = self.db.watch(&paths::calls(game_id)).await?;
        let game_id = game_id.clone();

        Ok(Delivery::spawn(move |tx| async move {
            let mut seen: HashSet<String> = HashSet::new();

            while let Some(value) = watch.next().await {
                let Some(Value::Object(entries)) = value else {
                    continue;
                };
                for (key, raw) in entries {
                    if seen.contains(&key) {
                        continue;
                    }
                    seen.insert(key.clone());

                    let (Some(call_key), Ok(call)) =
                        (CallKey::new(key.clone()), serde_json::from_value::<BingoCall>(raw))
                    else {
                        warn!(game_id = %game_id, key = %key, "Skipping malformed bingo call");
                        continue;
                    };
                    if !call.processed && tx.send((call_key, call)).await.is_err() {
                        return;
                    }
                }
            }
            debug!(game_id = %game_id, "Remote call subscription ended");
        }))
    }

    async fn mark_processed(&self, game_id: &GameId, key: &CallKey) -> SyncResult<()> {
        self.db
            .set(&paths::call_processed(game_id, key), Value::Bool(true))
            .await
    }

    async fn announce_winner(&self, game_id: &GameId, winner: &WinnerRecord) -> SyncResult<()> {
        self.db
            .push(&paths::winners(game_id), serde_json::to_value(winner)?)
            .await?;
        Ok(())
    }

    async fn join(&self, game_id: &GameId, presence: &Presence) -> SyncResult<()> {
        let path = paths::presence(game_id, &presence.player_id);
        self.db.set(&path, serde_json::to_value(presence)?).await?;
        self.db.remove_on_disconnect(&path).await
    }

    async fn leave(&self, game_id: &GameId, player_id: &str) -> SyncResult<()> {
        self.db.remove(&paths::presence(game_id, player_id)).await
    }
}
