// src/presence.rs
//
// Session presence and producer presence, read side and write side.
//
// Write side: every authenticated session drops one liveness row under
// `presence/{space}/{session}` with disconnect-removal registered, so peers
// (and the screen-share arbitrator) can tell live sessions from stale
// signaling rows.
//
// Read side: watchers that fold a signaling subtree into a typed watch
// stream, recomputed on every subtree change. Malformed rows are skipped,
// not fatal -- another client's bug must not take this one down.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SignalError;
use crate::media::{MediaKind, SessionId, SpaceId, UserId};
use crate::paths::{self, SessionPaths};
use crate::signal::{OnDisconnect, SignalChannel, SignalSubscription, SubtreeSnapshot};

// ─── Leaf values ────────────────────────────────────────────────────────────

/// `presence/{space}/{session}` leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: UserId,
}

/// `producingPeers/{space}/{kind}/{session}` leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducingPeer {
    pub user_id: UserId,
    pub paused: bool,
}

// ─── Write side ─────────────────────────────────────────────────────────────

/// Mark this session live in `space`. The row is removed by the channel
/// server if the connection dies.
pub async fn register_session(
    signal: &dyn SignalChannel,
    session: &SessionPaths,
    space: &SpaceId,
) -> Result<(), SignalError> {
    let value = serde_json::to_value(PresenceRecord {
        user_id: session.user_id.clone(),
    })?;
    signal
        .put(&session.presence_key(space), value, OnDisconnect::Remove)
        .await
}

/// Graceful leave: remove the liveness row without waiting for disconnect
/// cleanup.
pub async fn unregister_session(
    signal: &dyn SignalChannel,
    session: &SessionPaths,
    space: &SpaceId,
) -> Result<(), SignalError> {
    signal.remove(&session.presence_key(space)).await
}

// ─── Read side ──────────────────────────────────────────────────────────────

/// The sessions currently live in `space`, per the presence subtree.
pub async fn watch_active_sessions(
    signal: &dyn SignalChannel,
    space: &SpaceId,
    cancel: CancellationToken,
) -> (watch::Receiver<HashSet<SessionId>>, JoinHandle<()>) {
    let sub = signal.subscribe(&paths::presence_prefix(space)).await;
    spawn_subtree_watcher(sub, cancel, |snapshot| {
        snapshot
            .keys()
            .map(|session| SessionId::from(session.as_str()))
            .collect::<HashSet<_>>()
    })
}

/// The sessions currently producing `kind` in `space`, with their paused
/// flags.
pub async fn watch_producing_peers(
    signal: &dyn SignalChannel,
    space: &SpaceId,
    kind: MediaKind,
    cancel: CancellationToken,
) -> (
    watch::Receiver<BTreeMap<SessionId, ProducingPeer>>,
    JoinHandle<()>,
) {
    let sub = signal
        .subscribe(&paths::producing_peers_prefix(space, kind))
        .await;
    spawn_subtree_watcher(sub, cancel, |snapshot| {
        let mut peers = BTreeMap::new();
        for (session, value) in snapshot.iter() {
            match serde_json::from_value::<ProducingPeer>(value.clone()) {
                Ok(peer) => {
                    peers.insert(SessionId::from(session.as_str()), peer);
                }
                Err(_) => {
                    debug!(key = %session, "skipping malformed producing-peer row");
                }
            }
        }
        peers
    })
}

/// Fold a subtree subscription into a typed watch stream. The output only
/// updates when the folded value changes.
fn spawn_subtree_watcher<T, F>(
    mut sub: SignalSubscription,
    cancel: CancellationToken,
    fold: F,
) -> (watch::Receiver<T>, JoinHandle<()>)
where
    T: PartialEq + Send + Sync + 'static,
    F: Fn(&SubtreeSnapshot) -> T + Send + 'static,
{
    let (tx, rx) = watch::channel(fold(&sub.current()));
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                changed = sub.changed() => {
                    if changed.is_err() {
                        // Channel gone; the last value stays current.
                        break;
                    }
                    let value = fold(&sub.current());
                    tx.send_if_modified(|previous| {
                        if *previous == value {
                            false
                        } else {
                            *previous = value;
                            true
                        }
                    });
                }
            }
        }
    });
    (rx, join)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
