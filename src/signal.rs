// src/signal.rs
//
// Realtime signaling channel for NearCast.
//
// ─ Model ────────────────────────────────────────────────────────────────────
//
//   A flat, slash-delimited key space with last-writer-wins leaves, shared
//   by every session in a space. Writers may register a server-side
//   compensating action at write time ("when my connection dies, remove
//   this subtree"), which is the only recovery path for abrupt failures.
//
//   `SignalChannel` is the seam: production deployments back it with a
//   realtime sync service; `MemorySignal` is the reference backend used by
//   tests and by single-process embeddings.
//
// ─ Subscriptions ────────────────────────────────────────────────────────────
//
//   A subscription is a watch of one subtree. Every committed change to the
//   key space re-snapshots all live subscriptions, so consumers follow the
//   "recompute on every change" discipline rather than patching diffs —
//   which is exactly what the arbitration and presence layers need.
//
// ────────────────────────────────────────────────────────────────────────────

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info};

use crate::error::SignalError;

// ─── Channel seam ───────────────────────────────────────────────────────────

/// Disconnect-cleanup policy attached to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDisconnect {
    /// Leave the key in place if this connection dies.
    Keep,
    /// Remove the key (and anything under it) when this connection dies.
    Remove,
}

/// A subtree snapshot. Keys are relative to the subscribed prefix.
pub type SubtreeSnapshot = Arc<BTreeMap<String, Value>>;

/// One connection to the realtime signaling service.
///
/// All operations are asynchronous and may be slow; callers never hold locks
/// across them. Write errors are anomalies of the channel, not of the
/// caller: coordination components log and move on (§ error design).
#[async_trait]
pub trait SignalChannel: Send + Sync + 'static {
    /// Write one leaf (last writer wins), optionally registering removal of
    /// the key on disconnect.
    async fn put(
        &self,
        key: &str,
        value: Value,
        on_disconnect: OnDisconnect,
    ) -> Result<(), SignalError>;

    /// Remove one leaf, or an entire subtree if other keys nest under it.
    async fn remove(&self, key: &str) -> Result<(), SignalError>;

    /// Apply several leaf writes under a common prefix as one atomic,
    /// ordered update. This is the single-writer merge operation the
    /// consumption publisher relies on for per-kind ordering.
    async fn merge(&self, prefix: &str, entries: Vec<(String, Value)>) -> Result<(), SignalError>;

    /// Register disconnect-removal for a subtree without writing anything.
    /// Used once per session for its private namespace.
    async fn register_cleanup(&self, path: &str) -> Result<(), SignalError>;

    /// Watch a subtree. The subscription starts with the current snapshot.
    async fn subscribe(&self, prefix: &str) -> SignalSubscription;
}

/// A live watch over one subtree of the key space.
pub struct SignalSubscription {
    rx: watch::Receiver<SubtreeSnapshot>,
}

impl SignalSubscription {
    /// The most recent snapshot.
    pub fn current(&self) -> SubtreeSnapshot {
        self.rx.borrow().clone()
    }

    /// Wait until the subtree changes again. Returns `Closed` once the
    /// backing channel is gone.
    pub async fn changed(&mut self) -> Result<(), SignalError> {
        self.rx.changed().await.map_err(|_| SignalError::Closed)
    }

    /// Wait for the next change and return the fresh snapshot.
    pub async fn next(&mut self) -> Result<SubtreeSnapshot, SignalError> {
        self.changed().await?;
        Ok(self.current())
    }
}

// ─── In-memory backend ──────────────────────────────────────────────────────

struct SubEntry {
    prefix: String,
    tx: watch::Sender<SubtreeSnapshot>,
}

struct SignalState {
    store: RwLock<BTreeMap<String, Value>>,
    subs: Mutex<Vec<SubEntry>>,
    /// connection id → subtree roots to remove when that connection dies.
    cleanups: Mutex<HashMap<u64, Vec<String>>>,
    next_conn: AtomicU64,
}

/// The in-memory signaling service. One instance plays the role of the
/// realtime backend for every connected session.
///
/// Cheap to clone (interior `Arc`).
#[derive(Clone)]
pub struct MemorySignal {
    state: Arc<SignalState>,
}

impl MemorySignal {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SignalState {
                store: RwLock::new(BTreeMap::new()),
                subs: Mutex::new(Vec::new()),
                cleanups: Mutex::new(HashMap::new()),
                next_conn: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new connection. Sessions hold exactly one; dropping it without
    /// `disconnect()` models a crash whose cleanup the server performs when
    /// it notices (tests call `disconnect()` to make that deterministic).
    pub fn connect(&self) -> MemorySignalConn {
        let id = self.state.next_conn.fetch_add(1, Ordering::Relaxed);
        debug!(conn = id, "signal connection opened");
        MemorySignalConn {
            state: self.state.clone(),
            conn_id: id,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current value of one leaf, if any. Test/diagnostic helper.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.state.store.read().await.get(key).cloned()
    }
}

impl Default for MemorySignal {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalState {
    /// Apply `mutate` to the store and wake every live subscription with a
    /// fresh snapshot of its subtree.
    async fn commit(&self, mutate: impl FnOnce(&mut BTreeMap<String, Value>)) {
        let snapshot = {
            let mut store = self.store.write().await;
            mutate(&mut store);
            store.clone()
        };

        let mut subs = self.subs.lock().await;
        subs.retain(|s| s.tx.receiver_count() > 0);
        for sub in subs.iter() {
            // Only wake watchers whose subtree actually changed.
            let next = subtree(&snapshot, &sub.prefix);
            sub.tx.send_if_modified(|cur| {
                if *cur == next {
                    false
                } else {
                    *cur = next;
                    true
                }
            });
        }
    }

    async fn run_cleanup(&self, conn_id: u64) {
        let roots = {
            let mut cleanups = self.cleanups.lock().await;
            cleanups.remove(&conn_id).unwrap_or_default()
        };
        if roots.is_empty() {
            return;
        }
        info!(conn = conn_id, roots = roots.len(), "disconnect cleanup");
        self.commit(|store| {
            for root in &roots {
                remove_subtree(store, root);
            }
        })
        .await;
    }
}

/// One session's connection to a `MemorySignal` service.
///
/// Cheap to clone; clones share the connection identity (and therefore its
/// disconnect-cleanup set).
#[derive(Clone)]
pub struct MemorySignalConn {
    state: Arc<SignalState>,
    conn_id: u64,
    closed: Arc<AtomicBool>,
}

impl MemorySignalConn {
    /// Simulate the server noticing this connection die: runs all
    /// registered cleanups exactly once and rejects further writes.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return; // already disconnected
        }
        debug!(conn = self.conn_id, "signal connection closed");
        self.state.run_cleanup(self.conn_id).await;
    }

    fn ensure_open(&self) -> Result<(), SignalError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SignalError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SignalChannel for MemorySignalConn {
    async fn put(
        &self,
        key: &str,
        value: Value,
        on_disconnect: OnDisconnect,
    ) -> Result<(), SignalError> {
        self.ensure_open()?;
        if on_disconnect == OnDisconnect::Remove {
            self.register_cleanup(key).await?;
        }
        let key = key.to_string();
        self.state
            .commit(move |store| {
                store.insert(key, value);
            })
            .await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), SignalError> {
        self.ensure_open()?;
        let key = key.to_string();
        self.state
            .commit(move |store| {
                remove_subtree(store, &key);
            })
            .await;
        Ok(())
    }

    async fn merge(&self, prefix: &str, entries: Vec<(String, Value)>) -> Result<(), SignalError> {
        self.ensure_open()?;
        if entries.is_empty() {
            return Ok(());
        }
        let prefix = prefix.to_string();
        self.state
            .commit(move |store| {
                for (suffix, value) in entries {
                    store.insert(format!("{prefix}/{suffix}"), value);
                }
            })
            .await;
        Ok(())
    }

    async fn register_cleanup(&self, path: &str) -> Result<(), SignalError> {
        self.ensure_open()?;
        let mut cleanups = self.state.cleanups.lock().await;
        let roots = cleanups.entry(self.conn_id).or_default();
        if !roots.iter().any(|r| r == path) {
            roots.push(path.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, prefix: &str) -> SignalSubscription {
        let initial = {
            let store = self.state.store.read().await;
            subtree(&store, prefix)
        };
        let (tx, rx) = watch::channel(initial);
        self.state.subs.lock().await.push(SubEntry {
            prefix: prefix.to_string(),
            tx,
        });
        SignalSubscription { rx }
    }
}

// ─── Subtree helpers ────────────────────────────────────────────────────────

/// Snapshot the keys under `prefix`, relative to it. An empty prefix
/// snapshots the whole space under its absolute keys.
fn subtree(store: &BTreeMap<String, Value>, prefix: &str) -> SubtreeSnapshot {
    if prefix.is_empty() {
        return Arc::new(store.clone());
    }
    let lead = format!("{prefix}/");
    let map: BTreeMap<String, Value> = store
        .range(lead.clone()..)
        .take_while(|(k, _)| k.starts_with(&lead))
        .map(|(k, v)| (k[lead.len()..].to_string(), v.clone()))
        .collect();
    Arc::new(map)
}

/// Remove `path` itself and everything nested under it.
fn remove_subtree(store: &mut BTreeMap<String, Value>, path: &str) {
    store.remove(path);
    let lead = format!("{path}/");
    let nested: Vec<String> = store
        .range(lead.clone()..)
        .take_while(|(k, _)| k.starts_with(&lead))
        .map(|(k, _)| k.clone())
        .collect();
    for k in nested {
        store.remove(&k);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn last_writer_wins() {
        let service = MemorySignal::new();
        let a = service.connect();
        let b = service.connect();

        a.put("k", json!(1), OnDisconnect::Keep).await.unwrap();
        b.put("k", json!(2), OnDisconnect::Keep).await.unwrap();

        assert_eq!(service.get("k").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn subscription_snapshots_are_relative_and_wake_on_change() {
        let service = MemorySignal::new();
        let conn = service.connect();

        conn.put("room/a/x", json!(true), OnDisconnect::Keep)
            .await
            .unwrap();
        let mut sub = conn.subscribe("room/a").await;
        assert_eq!(sub.current().get("x"), Some(&json!(true)));

        conn.put("room/a/y", json!(false), OnDisconnect::Keep)
            .await
            .unwrap();
        let snap = sub.next().await.unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.get("y"), Some(&json!(false)));

        // Writes outside the prefix never wake the watch.
        conn.put("room/b/z", json!(3), OnDisconnect::Keep)
            .await
            .unwrap();
        let quiet = tokio::time::timeout(std::time::Duration::from_millis(50), sub.changed()).await;
        assert!(quiet.is_err(), "unrelated write must not wake the subtree");
    }

    #[tokio::test]
    async fn merge_is_one_atomic_update() {
        let service = MemorySignal::new();
        let conn = service.connect();
        let mut sub = conn.subscribe("peers").await;

        conn.merge(
            "peers",
            vec![("p1".into(), json!(true)), ("p2".into(), json!(false))],
        )
        .await
        .unwrap();

        // A single wakeup carries both entries.
        let snap = sub.next().await.unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.get("p1"), Some(&json!(true)));
        assert_eq!(snap.get("p2"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn disconnect_removes_registered_subtrees_once() {
        let service = MemorySignal::new();
        let a = service.connect();
        let b = service.connect();

        a.put("claims/u1/s1", json!(true), OnDisconnect::Remove)
            .await
            .unwrap();
        a.put("survivor", json!(1), OnDisconnect::Keep).await.unwrap();
        b.put("claims/u2/s2", json!(true), OnDisconnect::Remove)
            .await
            .unwrap();

        a.disconnect().await;
        // Idempotent: second disconnect must not touch anything.
        a.disconnect().await;

        assert_eq!(service.get("claims/u1/s1").await, None);
        assert_eq!(service.get("survivor").await, Some(json!(1)));
        assert_eq!(service.get("claims/u2/s2").await, Some(json!(true)));
    }

    #[tokio::test]
    async fn cleanup_registration_covers_subtrees() {
        let service = MemorySignal::new();
        let conn = service.connect();

        conn.register_cleanup("ns/u1/s1").await.unwrap();
        conn.put("ns/u1/s1/a/k1", json!(1), OnDisconnect::Keep)
            .await
            .unwrap();
        conn.put("ns/u1/s1/b", json!(2), OnDisconnect::Keep)
            .await
            .unwrap();
        conn.put("ns/u1/s2/other", json!(3), OnDisconnect::Keep)
            .await
            .unwrap();

        conn.disconnect().await;

        assert_eq!(service.get("ns/u1/s1/a/k1").await, None);
        assert_eq!(service.get("ns/u1/s1/b").await, None);
        assert_eq!(service.get("ns/u1/s2/other").await, Some(json!(3)));
    }

    #[tokio::test]
    async fn writes_after_disconnect_fail_closed() {
        let service = MemorySignal::new();
        let conn = service.connect();
        conn.disconnect().await;

        let err = conn.put("k", json!(1), OnDisconnect::Keep).await;
        assert!(matches!(err, Err(SignalError::Closed)));
    }
}
