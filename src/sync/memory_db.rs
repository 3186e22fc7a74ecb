//! In-process real-time tree. Backs the relay server and stands in for the
//! networked database in tests and single-process games.

use super::keys::path_segments;
use super::remote::{RealtimeDatabase, WatchStream};
use crate::clock::now_millis;
use crate::errors::SyncResult;
use crate::game::ids::generate_call_key;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

struct Watcher {
    id: u64,
    segments: Vec<String>,
    tx: mpsc::UnboundedSender<Option<Value>>,
}

struct Tree {
    root: Value,
    watchers: Vec<Watcher>,
    next_watch_id: u64,
}

impl Tree {
    fn lookup(&self, segments: &[String]) -> Option<Value> {
        segments
            .iter()
            .try_fold(&self.root, |node, segment| node.get(segment.as_str()))
            .cloned()
    }

    fn write(&mut self, segments: &[String], value: Value) {
        if value.is_null() {
            if segments.is_empty() {
                self.root = Value::Object(Map::new());
            } else {
                remove_at(&mut self.root, segments);
            }
        } else {
            insert_at(&mut self.root, segments, value);
        }
        self.notify(segments);
    }

    /// Send fresh values to every watcher at, above or below `changed`
    fn notify(&mut self, changed: &[String]) {
        let mut values = Vec::new();
        for watcher in &self.watchers {
            let related =
                watcher.segments.starts_with(changed) || changed.starts_with(&watcher.segments);
            if related {
                values.push((watcher.id, self.lookup(&watcher.segments)));
            }
        }

        let mut closed = Vec::new();
        for (id, value) in values {
            if let Some(watcher) = self.watchers.iter().find(|w| w.id == id) {
                if watcher.tx.send(value).is_err() {
                    closed.push(id);
                }
            }
        }
        self.watchers.retain(|w| !closed.contains(&w.id));
    }
}

fn insert_at(node: &mut Value, segments: &[String], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map
            .entry(head.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        insert_at(child, rest, value);
    }
}

/// Remove a node and prune parents left empty
fn remove_at(node: &mut Value, segments: &[String]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let Value::Object(map) = node else {
        return;
    };
    if rest.is_empty() {
        map.remove(head);
        return;
    }
    if let Some(child) = map.get_mut(head) {
        remove_at(child, rest);
        if child.as_object().is_some_and(|m| m.is_empty()) {
            map.remove(head);
        }
    }
}

/// Shared JSON tree. Clones refer to the same tree.
#[derive(Clone)]
pub struct MemoryDatabase {
    tree: Arc<Mutex<Tree>>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree {
                root: Value::Object(Map::new()),
                watchers: Vec::new(),
                next_watch_id: 0,
            })),
        }
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        // Tree operations never panic mid-update, so a poisoned lock still
        // guards a consistent tree
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// New client connection with its own on-disconnect actions
    pub fn connect(&self) -> MemorySession {
        MemorySession {
            db: self.clone(),
            on_disconnect: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self, path: &str) -> SyncResult<Option<Value>> {
        let segments = path_segments(path)?;
        Ok(self.lock().lookup(&segments))
    }

    pub fn set(&self, path: &str, value: Value) -> SyncResult<()> {
        let segments = path_segments(path)?;
        self.lock().write(&segments, value);
        Ok(())
    }

    pub fn push(&self, path: &str, value: Value) -> SyncResult<String> {
        let mut segments = path_segments(path)?;
        let key = generate_call_key(now_millis());
        segments.push(key.as_str().to_string());
        self.lock().write(&segments, value);
        Ok(key.as_str().to_string())
    }

    pub fn remove(&self, path: &str) -> SyncResult<()> {
        self.set(path, Value::Null)
    }

    pub fn watch(&self, path: &str) -> SyncResult<WatchStream> {
        let segments = path_segments(path)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let id = {
            let mut tree = self.lock();
            let id = tree.next_watch_id;
            tree.next_watch_id += 1;
            let _ = tx.send(tree.lookup(&segments));
            tree.watchers.push(Watcher { id, segments, tx });
            id
        };

        let db = self.clone();
        Ok(WatchStream::new(rx, move || db.unwatch(id)))
    }

    fn unwatch(&self, id: u64) {
        self.lock().watchers.retain(|w| w.id != id);
    }

    pub fn watcher_count(&self) -> usize {
        self.lock().watchers.len()
    }
}

/// One client's view of a [`MemoryDatabase`]. Registered on-disconnect
/// removals run when the session is dropped.
pub struct MemorySession {
    db: MemoryDatabase,
    on_disconnect: Mutex<Vec<String>>,
}

impl MemorySession {
    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let paths = match self.on_disconnect.get_mut() {
            Ok(paths) => std::mem::take(paths),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        for path in paths {
            if let Err(e) = self.db.remove(&path) {
                debug!(path = %path, "On-disconnect removal failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl RealtimeDatabase for MemorySession {
    async fn set(&self, path: &str, value: Value) -> SyncResult<()> {
        self.db.set(path, value)
    }

    async fn get(&self, path: &str) -> SyncResult<Option<Value>> {
        self.db.get(path)
    }

    async fn push(&self, path: &str, value: Value) -> SyncResult<String> {
        self.db.push(path, value)
    }

    async fn remove(&self, path: &str) -> SyncResult<()> {
        self.db.remove(path)
    }

    async fn watch(&self, path: &str) -> SyncResult<WatchStream> {
        self.db.watch(path)
    }

    async fn remove_on_disconnect(&self, path: &str) -> SyncResult<()> {
        path_segments(path)?;
        self.on_disconnect
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(path.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_nested() {
        let db = MemoryDatabase::new();
        db.set("games/ABCD", json!({"active": true})).unwrap();
        assert_eq!(db.get("games/ABCD/active").unwrap(), Some(json!(true)));
        assert_eq!(db.get("games").unwrap(), Some(json!({"ABCD": {"active": true}})));
        assert_eq!(db.get("games/XXXX").unwrap(), None);
    }

    #[test]
    fn test_remove_prunes_empty_parents() {
        let db = MemoryDatabase::new();
        db.set("players/ABCD/P-1", json!({"playerName": "Ada"})).unwrap();
        db.remove("players/ABCD/P-1").unwrap();
        assert_eq!(db.get("players").unwrap(), None);
    }

    #[test]
    fn test_null_write_removes() {
        let db = MemoryDatabase::new();
        db.set("a/b", json!(1)).unwrap();
        db.set("a/b", Value::Null).unwrap();
        assert_eq!(db.get("a/b").unwrap(), None);
    }

    #[test]
    fn test_push_keys_are_ordered() {
        let db = MemoryDatabase::new();
        let a = db.push("log", json!(1)).unwrap();
        let b = db.push("log", json!(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(db.get("log").unwrap().unwrap().as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_paths_rejected() {
        let db = MemoryDatabase::new();
        assert!(db.set("a/b.c", json!(1)).is_err());
        assert!(db.get("a//b").is_err());
    }

    #[tokio::test]
    async fn test_watch_sees_current_then_changes() {
        let db = MemoryDatabase::new();
        db.set("current/ABCD", json!({"n": 1})).unwrap();

        let mut watch = db.watch("current/ABCD").unwrap();
        assert_eq!(watch.next().await, Some(Some(json!({"n": 1}))));

        db.set("current/ABCD/n", json!(2)).unwrap();
        assert_eq!(watch.next().await, Some(Some(json!({"n": 2}))));

        db.remove("current").unwrap();
        assert_eq!(watch.next().await, Some(None));

        // Unrelated writes stay quiet
        db.set("games/ABCD", json!(true)).unwrap();
        assert!(watch.try_next().is_none());
    }

    #[tokio::test]
    async fn test_dropping_watch_unregisters() {
        let db = MemoryDatabase::new();
        let watch = db.watch("x").unwrap();
        assert_eq!(db.watcher_count(), 1);
        drop(watch);
        assert_eq!(db.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_session_on_disconnect() {
        let db = MemoryDatabase::new();
        let session = db.connect();
        session.set("players/G/P-1", json!("Ada")).await.unwrap();
        session.remove_on_disconnect("players/G/P-1").await.unwrap();
        session.set("games/G", json!(1)).await.unwrap();

        drop(session);
        assert_eq!(db.get("players/G/P-1").unwrap(), None);
        assert_eq!(db.get("games/G").unwrap(), Some(json!(1)));
    }
}
