//! Host/player synchronization channel
//!
//! One contract, two transports:
//! - `local`: shared key/value storage on one device, observed by polling
//! - `remote`: a real-time JSON tree, observed by push subscriptions
//!
//! `fallback` picks between them at startup and degrades to local for the
//! rest of the session once a remote operation fails. Controllers only ever
//! see `dyn SyncChannel`.

pub mod fallback;
pub mod keys;
pub mod liveness;
pub mod local;
pub mod memory_db;
pub mod remote;

use crate::errors::SyncResult;
use crate::game::{BingoCall, CallKey, GameId, GameSnapshot, GameState, Presence, WinnerRecord};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use tokio::{sync::mpsc, task::JoinHandle};

pub use fallback::{select_channel, select_with_database, ChannelSelection, FallbackChannel};
pub use liveness::{LinkState, Liveness};
pub use local::{FileStorage, LocalChannel, LocalStorage, MemoryStorage};
pub use memory_db::{MemoryDatabase, MemorySession};
pub use remote::{RealtimeDatabase, RemoteChannel, WatchStream};

const DELIVERY_BUFFER: usize = 64;

/// Which transport is currently carrying traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Single-device shared storage
    Local,
    /// Networked real-time tree
    Remote,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Local => write!(f, "local"),
            TransportKind::Remote => write!(f, "remote"),
        }
    }
}

/// Receiving end of a subscription. Dropping it stops the feeding task.
pub struct Delivery<T> {
    rx: mpsc::Receiver<T>,
    task: Option<JoinHandle<()>>,
}

pub type SnapshotStream = Delivery<GameSnapshot>;
pub type CallStream = Delivery<(CallKey, BingoCall)>;

impl<T: Send + 'static> Delivery<T> {
    /// Run `feed` on its own task, handing it the sending half
    pub(crate) fn spawn<F, Fut>(feed: F) -> Self
    where
        F: FnOnce(mpsc::Sender<T>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let task = tokio::spawn(feed(tx));
        Self {
            rx,
            task: Some(task),
        }
    }

    /// Next delivery; `None` once the feeding side has gone away
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Drop for Delivery<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Transport contract shared by host and players
#[async_trait]
pub trait SyncChannel: Send + Sync {
    /// Transport currently in use
    fn kind(&self) -> TransportKind;

    /// Make the host state visible to players. Republishing an unchanged
    /// state only refreshes the timestamp.
    async fn publish(&self, state: &GameState) -> SyncResult<GameSnapshot>;

    /// Full persisted state for `game_id`; malformed data reads as `None`
    async fn load_state(&self, game_id: &GameId) -> SyncResult<Option<GameState>>;

    /// Latest snapshot for `game_id` whenever it changes
    async fn subscribe(&self, game_id: &GameId) -> SyncResult<SnapshotStream>;

    /// Append a bingo call; never overwrites another call
    async fn submit_call(&self, game_id: &GameId, call: &BingoCall) -> SyncResult<CallKey>;

    /// Each unprocessed call for `game_id`, once per stream
    async fn observe_calls(&self, game_id: &GameId) -> SyncResult<CallStream>;

    async fn mark_processed(&self, game_id: &GameId, key: &CallKey) -> SyncResult<()>;

    /// Append to the winners broadcast log
    async fn announce_winner(&self, game_id: &GameId, winner: &WinnerRecord) -> SyncResult<()>;

    async fn join(&self, game_id: &GameId, presence: &Presence) -> SyncResult<()>;

    async fn leave(&self, game_id: &GameId, player_id: &str) -> SyncResult<()>;
}

/// Next transport switch reported by a fallback channel. Pends forever when
/// there is nothing to watch; a closed watch is cleared.
pub(crate) async fn next_transport_change(
    rx: &mut Option<tokio::sync::watch::Receiver<TransportKind>>,
) -> TransportKind {
    loop {
        let Some(watch) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match watch.changed().await {
            Ok(()) => return *watch.borrow_and_update(),
            Err(_) => *rx = None,
        }
    }
}
