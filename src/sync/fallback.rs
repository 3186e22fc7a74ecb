//! Transport selection and permanent degradation to local storage.
//!
//! The remote transport is used only after a probe write succeeds. The first
//! remote failure after that flips the channel to local for the rest of the
//! session; there is no retry.

use super::keys::remote::CONNECTION_TEST;
use super::local::{LocalChannel, LocalStorage};
use super::remote::{RealtimeDatabase, RemoteChannel};
use super::{CallStream, Delivery, SnapshotStream, SyncChannel, TransportKind};
use crate::clock::now_millis;
use crate::config::SyncConfig;
use crate::errors::{SyncError, SyncResult};
use crate::game::{BingoCall, CallKey, GameId, GameSnapshot, GameState, Presence, WinnerRecord};
use crate::relay::WsDatabase;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Run `$call` on the active transport. A remote error degrades the channel
/// and the same call is retried once on local.
macro_rules! route {
    ($self:ident, $op:literal, |$ch:ident| $call:expr) => {{
        if $self.is_degraded() {
            let $ch = &$self.local;
            $call.await
        } else {
            let $ch = &$self.remote;
            match $call.await {
                Ok(value) => Ok(value),
                Err(e) => {
                    $self.degrade($op, &e);
                    let $ch = &$self.local;
                    $call.await
                }
            }
        }
    }};
}

/// Returns true only for the call that actually switched
fn switch_to_local(kind_tx: &watch::Sender<TransportKind>) -> bool {
    kind_tx.send_if_modified(|kind| {
        let switched = *kind == TransportKind::Remote;
        *kind = TransportKind::Local;
        switched
    })
}

/// Remote channel with a local shadow that takes over on the first failure
pub struct FallbackChannel {
    remote: Arc<dyn SyncChannel>,
    local: Arc<dyn SyncChannel>,
    kind_tx: Arc<watch::Sender<TransportKind>>,
}

impl FallbackChannel {
    pub fn new(remote: Arc<dyn SyncChannel>, local: Arc<dyn SyncChannel>) -> Self {
        let (kind_tx, _) = watch::channel(TransportKind::Remote);
        Self {
            remote,
            local,
            kind_tx: Arc::new(kind_tx),
        }
    }

    pub fn is_degraded(&self) -> bool {
        *self.kind_tx.borrow() == TransportKind::Local
    }

    /// Observe the switch to local
    pub fn transport_changes(&self) -> watch::Receiver<TransportKind> {
        self.kind_tx.subscribe()
    }

    fn degrade(&self, op: &str, err: &SyncError) {
        if switch_to_local(&self.kind_tx) {
            warn!(
                op,
                "Remote transport failed ({}); using local storage for the rest of this session",
                err
            );
        }
    }
}

#[async_trait]
impl SyncChannel for FallbackChannel {
    fn kind(&self) -> TransportKind {
        if self.is_degraded() {
            TransportKind::Local
        } else {
            TransportKind::Remote
        }
    }

    async fn publish(&self, state: &GameState) -> SyncResult<GameSnapshot> {
        route!(self, "publish", |ch| ch.publish(state))
    }

    async fn load_state(&self, game_id: &GameId) -> SyncResult<Option<GameState>> {
        route!(self, "load_state", |ch| ch.load_state(game_id))
    }

    /// Follows the switch to local: when the remote feed ends or the channel
    /// degrades, delivery continues from a local subscription
    async fn subscribe(&self, game_id: &GameId) -> SyncResult<SnapshotStream> {
        let first = route!(self, "subscribe", |ch| ch.subscribe(game_id))?;
        Ok(self.follow(first, game_id.clone(), |local, game_id| async move {
            local.subscribe(&game_id).await
        }))
    }

    async fn submit_call(&self, game_id: &GameId, call: &BingoCall) -> SyncResult<CallKey> {
        route!(self, "submit_call", |ch| ch.submit_call(game_id, call))
    }

    async fn observe_calls(&self, game_id: &GameId) -> SyncResult<CallStream> {
        let first = route!(self, "observe_calls", |ch| ch.observe_calls(game_id))?;
        Ok(self.follow(first, game_id.clone(), |local, game_id| async move {
            local.observe_calls(&game_id).await
        }))
    }

    async fn mark_processed(&self, game_id: &GameId, key: &CallKey) -> SyncResult<()> {
        route!(self, "mark_processed", |ch| ch.mark_processed(game_id, key))
    }

    async fn announce_winner(&self, game_id: &GameId, winner: &WinnerRecord) -> SyncResult<()> {
        route!(self, "announce_winner", |ch| ch.announce_winner(game_id, winner))
    }

    async fn join(&self, game_id: &GameId, presence: &Presence) -> SyncResult<()> {
        route!(self, "join", |ch| ch.join(game_id, presence))
    }

    async fn leave(&self, game_id: &GameId, player_id: &str) -> SyncResult<()> {
        route!(self, "leave", |ch| ch.leave(game_id, player_id))
    }
}

impl FallbackChannel {
    /// Forward `first`; once the channel is degraded (or `first` ends while
    /// still remote) replace it with a local stream opened by `reopen`
    fn follow<T, F, Fut>(&self, first: Delivery<T>, game_id: GameId, reopen: F) -> Delivery<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn SyncChannel>, GameId) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = SyncResult<Delivery<T>>> + Send + 'static,
    {
        let local = self.local.clone();
        let mut kind_rx = self.kind_tx.subscribe();
        let on_local = self.is_degraded();
        let degraded_tx = self.kind_tx.clone();

        Delivery::spawn(move |tx| async move {
            let mut current = first;

            if !on_local {
                loop {
                    tokio::select! {
                        item = current.next() => match item {
                            Some(item) => {
                                if tx.send(item).await.is_err() {
                                    return;
                                }
                            }
                            None => {
                                if switch_to_local(&degraded_tx) {
                                    warn!(
                                        game_id = %game_id,
                                        "Remote feed ended; using local storage for the rest of \
                                         this session"
                                    );
                                }
                                break;
                            }
                        },
                        changed = kind_rx.changed() => {
                            if changed.is_err() || *kind_rx.borrow() == TransportKind::Local {
                                break;
                            }
                        }
                    }
                }

                current = match reopen(local, game_id.clone()).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(game_id = %game_id, "Local subscription failed: {}", e);
                        return;
                    }
                };
            }

            while let Some(item) = current.next().await {
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        })
    }
}

/// Outcome of transport selection at startup
pub struct ChannelSelection {
    pub channel: Arc<dyn SyncChannel>,
    /// Non-blocking notice for the user when the remote transport was skipped
    pub notice: Option<String>,
    /// Present while the remote transport is in use
    pub fallback: Option<Arc<FallbackChannel>>,
}

impl ChannelSelection {
    fn local(local: LocalChannel, notice: Option<String>) -> Self {
        Self {
            channel: Arc::new(local),
            notice,
            fallback: None,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.channel.kind()
    }
}

/// Write the connectivity probe; remote is usable only if this succeeds
async fn probe(db: &dyn RealtimeDatabase, who: &str) -> SyncResult<()> {
    let value = json!({
        "test": true,
        "timestamp": now_millis(),
        "host": who,
    });
    db.set(CONNECTION_TEST, value).await
}

/// Pick the transport for this session given an already opened database
pub async fn select_with_database(
    db: Option<Arc<dyn RealtimeDatabase>>,
    local: LocalChannel,
    who: &str,
) -> ChannelSelection {
    let Some(db) = db else {
        info!("No remote database configured; using local storage");
        return ChannelSelection::local(local, None);
    };

    if let Err(e) = probe(db.as_ref(), who).await {
        warn!("Remote connectivity probe failed: {}", e);
        return ChannelSelection::local(
            local,
            Some(format!("Online play unavailable ({}); running in single-device mode", e)),
        );
    }

    info!("Remote database reachable; using remote transport");
    let fallback = Arc::new(FallbackChannel::new(
        Arc::new(RemoteChannel::new(db)),
        Arc::new(local),
    ));
    ChannelSelection {
        channel: fallback.clone(),
        notice: None,
        fallback: Some(fallback),
    }
}

/// Pick the transport from configuration: connect to the relay when one is
/// configured, otherwise (or on any failure) use `storage`
pub async fn select_channel(
    config: &SyncConfig,
    storage: Arc<dyn LocalStorage>,
    who: &str,
) -> ChannelSelection {
    let local = LocalChannel::new(storage, config.poll_interval());

    let Some(url) = &config.remote_url else {
        return select_with_database(None, local, who).await;
    };

    match WsDatabase::connect(url, config.request_timeout()).await {
        Ok(db) => select_with_database(Some(Arc::new(db)), local, who).await,
        Err(e) => {
            warn!(url = %url, "Could not reach relay: {}", e);
            ChannelSelection::local(
                local,
                Some(format!("Online play unavailable ({}); running in single-device mode", e)),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::GameStateStore;
    use crate::sync::{MemoryDatabase, MemoryStorage, WatchStream};
    use rand::{rngs::StdRng, SeedableRng};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    const POLL: Duration = Duration::from_millis(10);

    /// Database that fails every operation after `ok_ops` successes
    struct FlakyDatabase {
        inner: crate::sync::MemorySession,
        remaining: AtomicUsize,
    }

    impl FlakyDatabase {
        fn new(db: &MemoryDatabase, ok_ops: usize) -> Self {
            Self {
                inner: db.connect(),
                remaining: AtomicUsize::new(ok_ops),
            }
        }

        fn gate(&self) -> SyncResult<()> {
            let left = self.remaining.load(Ordering::SeqCst);
            if left == 0 {
                return Err(SyncError::Unavailable("flaky".to_string()));
            }
            self.remaining.store(left - 1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl RealtimeDatabase for FlakyDatabase {
        async fn set(&self, path: &str, value: Value) -> SyncResult<()> {
            self.gate()?;
            self.inner.set(path, value).await
        }
        async fn get(&self, path: &str) -> SyncResult<Option<Value>> {
            self.gate()?;
            self.inner.get(path).await
        }
        async fn push(&self, path: &str, value: Value) -> SyncResult<String> {
            self.gate()?;
            self.inner.push(path, value).await
        }
        async fn remove(&self, path: &str) -> SyncResult<()> {
            self.gate()?;
            self.inner.remove(path).await
        }
        async fn watch(&self, path: &str) -> SyncResult<WatchStream> {
            self.gate()?;
            self.inner.watch(path).await
        }
        async fn remove_on_disconnect(&self, path: &str) -> SyncResult<()> {
            self.gate()?;
            self.inner.remove_on_disconnect(path).await
        }
    }

    fn local(storage: &MemoryStorage) -> LocalChannel {
        LocalChannel::new(Arc::new(storage.clone()), POLL)
    }

    fn store() -> GameStateStore {
        GameStateStore::with_rng(StdRng::seed_from_u64(3), "HOST-FB".to_string())
    }

    #[tokio::test]
    async fn test_no_remote_means_local() {
        let storage = MemoryStorage::new();
        let selection = select_with_database(None, local(&storage), "HOST-FB").await;
        assert_eq!(selection.kind(), TransportKind::Local);
        assert!(selection.notice.is_none());
    }

    #[tokio::test]
    async fn test_failed_probe_falls_back_with_notice() {
        let db = MemoryDatabase::new();
        let storage = MemoryStorage::new();
        let flaky: Arc<dyn RealtimeDatabase> = Arc::new(FlakyDatabase::new(&db, 0));

        let selection = select_with_database(Some(flaky), local(&storage), "HOST-FB").await;
        assert_eq!(selection.kind(), TransportKind::Local);
        assert!(selection.notice.is_some());
    }

    #[tokio::test]
    async fn test_successful_probe_selects_remote() {
        let db = MemoryDatabase::new();
        let storage = MemoryStorage::new();
        let session: Arc<dyn RealtimeDatabase> = Arc::new(db.connect());

        let selection = select_with_database(Some(session), local(&storage), "HOST-FB").await;
        assert_eq!(selection.kind(), TransportKind::Remote);
        assert!(db.get(CONNECTION_TEST).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remote_failure_degrades_permanently() {
        let db = MemoryDatabase::new();
        let storage = MemoryStorage::new();
        // Probe plus the two writes of one publish
        let flaky: Arc<dyn RealtimeDatabase> = Arc::new(FlakyDatabase::new(&db, 3));

        let selection = select_with_database(Some(flaky), local(&storage), "HOST-FB").await;
        let fallback = selection.fallback.clone().unwrap();
        let mut changes = fallback.transport_changes();
        let channel = selection.channel;
        let mut store = store();

        channel.publish(store.state()).await.unwrap();
        assert_eq!(channel.kind(), TransportKind::Remote);

        store.draw();
        let snapshot = channel.publish(store.state()).await.unwrap();
        assert_eq!(channel.kind(), TransportKind::Local);
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), TransportKind::Local);

        // The publish that failed remotely landed locally
        let local_state = local(&storage).load_state(store.game_id()).await.unwrap();
        assert_eq!(local_state.as_ref(), Some(store.state()));
        assert_eq!(snapshot.total_drawn, 1);
    }

    #[tokio::test]
    async fn test_subscription_follows_degradation() {
        let db = MemoryDatabase::new();
        let storage = MemoryStorage::new();
        let session: Arc<dyn RealtimeDatabase> = Arc::new(db.connect());
        let remote = Arc::new(RemoteChannel::new(session));
        let fallback = FallbackChannel::new(remote, Arc::new(local(&storage)));
        let mut store = store();

        let mut stream = fallback.subscribe(store.game_id()).await.unwrap();
        fallback.degrade("test", &SyncError::Closed);

        store.draw();
        fallback.publish(store.state()).await.unwrap();
        let snapshot = timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.total_drawn, 1);
    }
}
