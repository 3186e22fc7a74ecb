//! Single-device transport over shared key/value storage.
//!
//! The host writes namespaced keys; players poll on a fixed interval and
//! compare the last-update marker to decide whether anything changed.

use super::keys::local as keys;
use super::{CallStream, Delivery, SnapshotStream, SyncChannel, TransportKind};
use crate::clock::now_millis;
use crate::errors::{SyncError, SyncResult};
use crate::game::ids::generate_call_key;
use crate::game::{BingoCall, CallKey, GameId, GameSnapshot, GameState, Presence, WinnerRecord};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Browser-style string storage shared by everyone on one device
pub trait LocalStorage: Send + Sync {
    fn get_item(&self, key: &str) -> SyncResult<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> SyncResult<()>;
    fn remove_item(&self, key: &str) -> SyncResult<()>;
    /// Keys starting with `prefix`, sorted
    fn keys_with_prefix(&self, prefix: &str) -> SyncResult<Vec<String>>;
}

/// In-process storage; clones share the same map
#[derive(Clone, Default)]
pub struct MemoryStorage {
    items: Arc<DashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.items.get(key).map(|v| v.value().clone()))
    }

    fn set_item(&self, key: &str, value: &str) -> SyncResult<()> {
        self.items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> SyncResult<()> {
        self.items.remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> SyncResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .items
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// One file per key in a directory, so separate processes on the same
/// machine can share a game. Writes replace the file atomically.
#[derive(Clone, Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(dir: P) -> SyncResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> SyncResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SyncError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }
}

impl LocalStorage for FileStorage {
    fn get_item(&self, key: &str) -> SyncResult<Option<String>> {
        let path = self.path_for(key)?;
        match std::fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> SyncResult<()> {
        let path = self.path_for(key)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(value.as_bytes())?;
        tmp.persist(&path).map_err(|e| SyncError::from(e.error))?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> SyncResult<()> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> SyncResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                // Skips in-flight temp files, whose names start with '.'
                if name.starts_with(prefix) && self.path_for(name).is_ok() {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Assemble the latest snapshot from the individual keys. Anything missing
/// or malformed reads as "nothing published".
fn read_snapshot(storage: &dyn LocalStorage, game_id: &GameId) -> SyncResult<Option<GameSnapshot>> {
    let Some(last_update) = storage
        .get_item(&keys::last_update(game_id))?
        .and_then(|raw| raw.trim().parse::<u64>().ok())
    else {
        return Ok(None);
    };

    let drawn_numbers: Vec<u8> = match storage.get_item(&keys::drawn_numbers(game_id))? {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(list) => list,
            Err(e) => {
                debug!(game_id = %game_id, "Ignoring malformed drawn list: {}", e);
                return Ok(None);
            }
        },
        None => Vec::new(),
    };

    let current_number = storage
        .get_item(&keys::current_number(game_id))?
        .filter(|raw| raw != keys::NO_NUMBER)
        .and_then(|raw| raw.trim().parse::<u8>().ok())
        .or_else(|| drawn_numbers.first().copied());

    let state = storage
        .get_item(&keys::state(game_id))?
        .and_then(|raw| GameState::from_json(&raw));
    let (host_id, active, winners) = match state {
        Some(state) => (
            state.host_id().to_string(),
            state.is_active(),
            state.winners().to_vec(),
        ),
        None => (String::new(), true, read_winners(storage, game_id)?),
    };

    Ok(Some(GameSnapshot {
        game_id: game_id.clone(),
        host_id,
        current_number,
        total_drawn: drawn_numbers.len(),
        drawn_numbers,
        active,
        winners,
        last_update,
    }))
}

fn read_winners(storage: &dyn LocalStorage, game_id: &GameId) -> SyncResult<Vec<WinnerRecord>> {
    Ok(storage
        .get_item(&keys::winners(game_id))?
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default())
}

fn read_call(storage: &dyn LocalStorage, key: &str) -> SyncResult<Option<BingoCall>> {
    Ok(storage
        .get_item(key)?
        .and_then(|raw| serde_json::from_str(&raw).ok()))
}

/// Local-storage implementation of [`SyncChannel`]
#[derive(Clone)]
pub struct LocalChannel {
    storage: Arc<dyn LocalStorage>,
    poll_interval: Duration,
    last_marker: Arc<AtomicU64>,
}

impl LocalChannel {
    pub fn new(storage: Arc<dyn LocalStorage>, poll_interval: Duration) -> Self {
        Self {
            storage,
            poll_interval,
            last_marker: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn storage(&self) -> &Arc<dyn LocalStorage> {
        &self.storage
    }

    /// Strictly increasing, so two publishes in the same millisecond still
    /// look like two updates to a poller
    fn next_marker(&self) -> u64 {
        let now = now_millis();
        let mut prev = self.last_marker.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .last_marker
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

#[async_trait]
impl SyncChannel for LocalChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    async fn publish(&self, state: &GameState) -> SyncResult<GameSnapshot> {
        let game_id = state.game_id();
        let snapshot = state.snapshot(self.next_marker());
        let current = snapshot
            .current_number
            .map(|n| n.to_string())
            .unwrap_or_else(|| keys::NO_NUMBER.to_string());

        self.storage
            .set_item(&keys::state(game_id), &serde_json::to_string(state)?)?;
        self.storage.set_item(&keys::current_number(game_id), &current)?;
        self.storage.set_item(
            &keys::drawn_numbers(game_id),
            &serde_json::to_string(&snapshot.drawn_numbers)?,
        )?;
        // Marker goes last so a reader that sees it also sees the content
        self.storage
            .set_item(&keys::last_update(game_id), &snapshot.last_update.to_string())?;

        debug!(game_id = %game_id, drawn = snapshot.total_drawn, "Published game state locally");
        Ok(snapshot)
    }

    async fn load_state(&self, game_id: &GameId) -> SyncResult<Option<GameState>> {
        Ok(self
            .storage
            .get_item(&keys::state(game_id))?
            .and_then(|raw| GameState::from_json(&raw)))
    }

    async fn subscribe(&self, game_id: &GameId) -> SyncResult<SnapshotStream> {
        let storage = self.storage.clone();
        let game_id = game_id.clone();
        let period = self.poll_interval;

        Ok(Delivery::spawn(move |tx| async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_marker: Option<u64> = None;

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                match read_snapshot(storage.as_ref(), &game_id) {
                    Ok(Some(snapshot)) if last_marker != Some(snapshot.last_update) => {
                        last_marker = Some(snapshot.last_update);
                        if tx.send(snapshot).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(game_id = %game_id, "Error checking host state: {}", e),
                }
            }
        }))
    }

    async fn submit_call(&self, game_id: &GameId, call: &BingoCall) -> SyncResult<CallKey> {
        let key = generate_call_key(now_millis());
        self.storage
            .set_item(&keys::call(game_id, &key), &serde_json::to_string(call)?)?;
        Ok(key)
    }

    async fn observe_calls(&self, game_id: &GameId) -> SyncResult<CallStream> {
        let storage = self.storage.clone();
        let prefix = keys::call_prefix(game_id);
        let game_id = game_id.clone();
        let period = self.poll_interval;

        Ok(Delivery::spawn(move |tx| async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut seen: HashSet<String> = HashSet::new();

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                let storage_keys = match storage.keys_with_prefix(&prefix) {
                    Ok(keys) => keys,
                    Err(e) => {
                        warn!(game_id = %game_id, "Error listing bingo calls: {}", e);
                        continue;
                    }
                };

                for storage_key in storage_keys {
                    if seen.contains(&storage_key) {
                        continue;
                    }
                    let Some(call_key) = CallKey::new(&storage_key[prefix.len()..]) else {
                        seen.insert(storage_key);
                        continue;
                    };
                    match read_call(storage.as_ref(), &storage_key) {
                        Ok(Some(call)) => {
                            seen.insert(storage_key);
                            if !call.processed && tx.send((call_key, call)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {
                            debug!(key = %storage_key, "Skipping unreadable bingo call");
                            seen.insert(storage_key);
                        }
                        Err(e) => warn!(key = %storage_key, "Error reading bingo call: {}", e),
                    }
                }
            }
        }))
    }

    async fn mark_processed(&self, game_id: &GameId, key: &CallKey) -> SyncResult<()> {
        let storage_key = keys::call(game_id, key);
        match read_call(self.storage.as_ref(), &storage_key)? {
            Some(mut call) => {
                call.processed = true;
                self.storage
                    .set_item(&storage_key, &serde_json::to_string(&call)?)
            }
            None => {
                warn!(game_id = %game_id, call = %key, "Cannot mark missing bingo call processed");
                Ok(())
            }
        }
    }

    async fn announce_winner(&self, game_id: &GameId, winner: &WinnerRecord) -> SyncResult<()> {
        let mut winners = read_winners(self.storage.as_ref(), game_id)?;
        winners.push(winner.clone());
        self.storage
            .set_item(&keys::winners(game_id), &serde_json::to_string(&winners)?)
    }

    async fn join(&self, game_id: &GameId, presence: &Presence) -> SyncResult<()> {
        self.storage.set_item(
            &keys::presence(game_id, &presence.player_id),
            &serde_json::to_string(presence)?,
        )
    }

    async fn leave(&self, game_id: &GameId, player_id: &str) -> SyncResult<()> {
        self.storage.remove_item(&keys::presence(game_id, player_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{GameStateStore, WinningLine};
    use chrono::Utc;
    use rand::{rngs::StdRng, SeedableRng};
    use tokio::time::timeout;

    const POLL: Duration = Duration::from_millis(10);

    fn channel() -> (LocalChannel, MemoryStorage) {
        let storage = MemoryStorage::new();
        (LocalChannel::new(Arc::new(storage.clone()), POLL), storage)
    }

    fn store() -> GameStateStore {
        GameStateStore::with_rng(StdRng::seed_from_u64(42), "HOST-LOCAL".to_string())
    }

    fn call(player: &str) -> BingoCall {
        BingoCall {
            player_id: player.to_string(),
            player_name: player.to_string(),
            line: WinningLine::Row(0),
            timestamp: Utc::now(),
            marked_numbers: vec![1, 2, 3, 4],
            processed: false,
        }
    }

    #[test]
    fn test_memory_storage_prefix() {
        let storage = MemoryStorage::new();
        storage.set_item("a_1", "x").unwrap();
        storage.set_item("a_2", "y").unwrap();
        storage.set_item("b_1", "z").unwrap();
        assert_eq!(storage.keys_with_prefix("a_").unwrap(), vec!["a_1", "a_2"]);
        storage.remove_item("a_1").unwrap();
        assert_eq!(storage.get_item("a_1").unwrap(), None);
    }

    #[test]
    fn test_file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        assert_eq!(storage.get_item("bingo_ABCD").unwrap(), None);
        storage.set_item("bingo_ABCD", "{}").unwrap();
        storage.set_item("bingo_ABCD", "[1]").unwrap();
        assert_eq!(storage.get_item("bingo_ABCD").unwrap().as_deref(), Some("[1]"));
        assert_eq!(storage.keys_with_prefix("bingo_").unwrap(), vec!["bingo_ABCD"]);

        storage.remove_item("bingo_ABCD").unwrap();
        storage.remove_item("bingo_ABCD").unwrap();
        assert!(storage.keys_with_prefix("bingo_").unwrap().is_empty());
    }

    #[test]
    fn test_file_storage_rejects_bad_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        assert!(matches!(
            storage.set_item("../escape", "x"),
            Err(SyncError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_then_subscribe() {
        let (channel, _storage) = channel();
        let mut store = store();
        store.draw();
        let published = channel.publish(store.state()).await.unwrap();

        let mut stream = channel.subscribe(store.game_id()).await.unwrap();
        let snapshot = timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(snapshot.same_content(&published));
        assert_eq!(snapshot.host_id, "HOST-LOCAL");
    }

    #[tokio::test]
    async fn test_unchanged_marker_is_not_redelivered() {
        let (channel, _storage) = channel();
        let store = store();
        channel.publish(store.state()).await.unwrap();

        let mut stream = channel.subscribe(store.game_id()).await.unwrap();
        assert!(timeout(Duration::from_secs(1), stream.next()).await.unwrap().is_some());
        assert!(timeout(Duration::from_millis(60), stream.next()).await.is_err());

        // A heartbeat republish moves only the marker
        let refreshed = channel.publish(store.state()).await.unwrap();
        let next = timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.last_update, refreshed.last_update);
    }

    #[tokio::test]
    async fn test_markers_strictly_increase() {
        let (channel, _storage) = channel();
        let store = store();
        let a = channel.publish(store.state()).await.unwrap();
        let b = channel.publish(store.state()).await.unwrap();
        assert!(b.last_update > a.last_update);
    }

    #[tokio::test]
    async fn test_malformed_state_is_absent() {
        let (channel, storage) = channel();
        let game_id = GameId::new("ABCD").unwrap();
        storage.set_item(&keys::state(&game_id), "{broken").unwrap();
        assert!(channel.load_state(&game_id).await.unwrap().is_none());

        storage.set_item(&keys::last_update(&game_id), "17").unwrap();
        storage.set_item(&keys::drawn_numbers(&game_id), "not json").unwrap();
        assert!(read_snapshot(&storage, &game_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_calls_are_keyed_and_processed() {
        let (channel, _storage) = channel();
        let game_id = GameId::new("ABCD").unwrap();

        let k1 = channel.submit_call(&game_id, &call("P-1")).await.unwrap();
        let k2 = channel.submit_call(&game_id, &call("P-2")).await.unwrap();
        assert_ne!(k1, k2);

        let mut calls = channel.observe_calls(&game_id).await.unwrap();
        let mut got = Vec::new();
        for _ in 0..2 {
            let (key, call) = timeout(Duration::from_secs(1), calls.next())
                .await
                .unwrap()
                .unwrap();
            got.push((key, call.player_id));
        }
        got.sort();
        assert_eq!(got.len(), 2);

        channel.mark_processed(&game_id, &k1).await.unwrap();
        drop(calls);

        // A fresh observer only sees what is still unprocessed
        let mut calls = channel.observe_calls(&game_id).await.unwrap();
        let (key, _) = timeout(Duration::from_secs(1), calls.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, k2);
        assert!(timeout(Duration::from_millis(60), calls.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_calls_stay_in_their_own_game() {
        let (channel, storage) = channel();
        let short = GameId::new("AB").unwrap();
        let long = GameId::new("AB-CD").unwrap();

        channel.submit_call(&long, &call("P-LONG")).await.unwrap();
        // A key that only an underscore game id could have produced
        storage
            .set_item(
                &format!("{}CD_001a151303c2ada3068a70402", keys::call_prefix(&short)),
                &serde_json::to_string(&call("P-STRAY")).unwrap(),
            )
            .unwrap();

        let mut calls = channel.observe_calls(&short).await.unwrap();
        assert!(timeout(Duration::from_millis(60), calls.next()).await.is_err());

        let mut calls = channel.observe_calls(&long).await.unwrap();
        let (_, call) = timeout(Duration::from_secs(1), calls.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(call.player_id, "P-LONG");
    }

    #[tokio::test]
    async fn test_winners_and_presence() {
        let (channel, storage) = channel();
        let game_id = GameId::new("ABCD").unwrap();
        let record = WinnerRecord {
            player_name: "Ada".to_string(),
            player_id: "P-1".to_string(),
            line: WinningLine::FourCorners,
            confirmed_at: Utc::now(),
        };
        channel.announce_winner(&game_id, &record).await.unwrap();
        channel.announce_winner(&game_id, &record).await.unwrap();
        assert_eq!(read_winners(&storage, &game_id).unwrap().len(), 2);

        let presence = Presence {
            player_id: "P-1".to_string(),
            player_name: "Ada".to_string(),
            joined_at: Utc::now(),
        };
        channel.join(&game_id, &presence).await.unwrap();
        assert!(storage
            .get_item(&keys::presence(&game_id, "P-1"))
            .unwrap()
            .is_some());
        channel.leave(&game_id, "P-1").await.unwrap();
        assert!(storage
            .get_item(&keys::presence(&game_id, "P-1"))
            .unwrap()
            .is_none());
    }
}
