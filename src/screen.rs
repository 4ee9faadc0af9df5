// src/screen.rs
//
// Screen-share arbitration.
//
// Any session may claim `sharingScreen/{space}/{mediaPath}/{user}/{session}`
// at any time -- the storage layer does not enforce exclusivity. Exclusivity
// is computed by every observer independently: the arbitrator folds the
// claim subtree, the live-session set and the observer's own session id into
// "the one foreign session currently sharing this surface, if any".
//
// ─ Tie-break ────────────────────────────────────────────────────────────────
//
//   Concurrent claims are ordered by earliest `sinceUnixMs`, then by
//   (user, session) lexicographically. Every observer therefore elects the
//   same winner from the same snapshot; no observer ever elects itself.
//   Bare boolean claims (written by older clients) carry no timestamp and
//   sort after every timestamped claim.
//
// ─ Recovery ─────────────────────────────────────────────────────────────────
//
//   Claims are written with disconnect-removal registered, so a crashed
//   sharer's claim disappears when the channel server notices; observers
//   re-elect on that change. Stale claims from sessions that are gone but
//   not yet cleaned are additionally filtered against the live-session set.
//
// ────────────────────────────────────────────────────────────────────────────

use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SignalError;
use crate::events::{EventBus, NearCastEvent};
use crate::media::{MediaPathId, SessionId, SpaceId, UserId};
use crate::paths::{sharing_screen_prefix, SessionPaths};
use crate::signal::{OnDisconnect, SignalChannel};

// ─── Claim value ────────────────────────────────────────────────────────────

/// `sharingScreen/{space}/{mediaPath}/{user}/{session}` leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenShareClaim {
    pub sharing: bool,
    /// Claim time, unix milliseconds; the arbitration tie-break.
    pub since_unix_ms: i64,
}

impl ScreenShareClaim {
    /// Parse a claim leaf. Bare `true`/`false` (older writers) are accepted
    /// and sort after every timestamped claim.
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(sharing) => Some(Self {
                sharing: *sharing,
                since_unix_ms: i64::MAX,
            }),
            _ => serde_json::from_value(value.clone()).ok(),
        }
    }
}

// ─── Election ───────────────────────────────────────────────────────────────

struct Claimant {
    user_id: UserId,
    session_id: SessionId,
    since_unix_ms: i64,
}

/// Elect the active sharer from one claim-subtree snapshot.
///
/// Skips the observer's own session and any session not currently live;
/// among the rest, the earliest claim wins, ties broken by (user, session).
/// Pure; every observer running this over the same snapshot and live set
/// elects the same winner.
pub fn elect(
    claims: &BTreeMap<String, Value>,
    own_session: Option<&SessionId>,
    active_sessions: &HashSet<SessionId>,
) -> Option<SessionId> {
    claims
        .iter()
        .filter_map(|(key, value)| {
            let (user, session) = key.split_once('/')?;
            if session.contains('/') {
                debug!(key, "skipping malformed claim key");
                return None;
            }
            let claim = ScreenShareClaim::from_value(value)?;
            if !claim.sharing {
                return None;
            }
            Some(Claimant {
                user_id: UserId::from(user),
                session_id: SessionId::from(session),
                since_unix_ms: claim.since_unix_ms,
            })
        })
        .filter(|c| Some(&c.session_id) != own_session)
        .filter(|c| active_sessions.contains(&c.session_id))
        .min_by_key(|c| (c.since_unix_ms, c.user_id.clone(), c.session_id.clone()))
        .map(|winner| winner.session_id)
}

// ─── Arbitrator task ────────────────────────────────────────────────────────

/// The streams an arbitrator recomputes against.
pub struct ArbitratorInputs {
    pub active_sessions: watch::Receiver<HashSet<SessionId>>,
    /// The observer's own session, absent around re-auth.
    pub own_session: watch::Receiver<Option<SessionId>>,
}

/// Watch one surface's claims and keep the elected sharer current.
///
/// Recomputes on every claim change, live-set change or own-session change;
/// the output only updates (and `sharer.elected` is only emitted) when the
/// winner actually changes.
pub async fn spawn_active_sharer(
    signal: &dyn SignalChannel,
    space: &SpaceId,
    media_path: &MediaPathId,
    mut inputs: ArbitratorInputs,
    bus: EventBus,
    cancel: CancellationToken,
) -> (watch::Receiver<Option<SessionId>>, JoinHandle<()>) {
    let mut sub = signal.subscribe(&sharing_screen_prefix(space, media_path)).await;
    let space = space.clone();
    let media_path = media_path.clone();

    let initial = elect(
        &sub.current(),
        inputs.own_session.borrow().as_ref(),
        &inputs.active_sessions.borrow(),
    );
    let (tx, rx) = watch::channel(initial);

    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                changed = sub.changed() => {
                    if changed.is_err() { break; }
                }
                changed = inputs.active_sessions.changed() => {
                    if changed.is_err() { break; }
                }
                changed = inputs.own_session.changed() => {
                    if changed.is_err() { break; }
                }
            }

            let winner = elect(
                &sub.current(),
                inputs.own_session.borrow_and_update().as_ref(),
                &inputs.active_sessions.borrow_and_update(),
            );
            let modified = tx.send_if_modified(|current| {
                if *current == winner {
                    false
                } else {
                    *current = winner.clone();
                    true
                }
            });
            if modified {
                info!(
                    space = %space,
                    surface = %media_path,
                    sharer = winner.as_ref().map(|s| s.as_str()).unwrap_or("-"),
                    "active sharer changed"
                );
                bus.emit(NearCastEvent::sharer_elected(
                    space.as_str(),
                    media_path.as_str(),
                    winner.as_ref().map(|s| s.as_str()),
                ));
            }
        }
    });
    (rx, join)
}

/// Adapt the elected-sharer watch into a `Stream` that yields the current
/// value immediately and then every change.
pub fn observe_active_sharer(
    mut sharer: watch::Receiver<Option<SessionId>>,
) -> impl Stream<Item = Option<SessionId>> {
    async_stream::stream! {
        yield sharer.borrow_and_update().clone();
        while sharer.changed().await.is_ok() {
            yield sharer.borrow_and_update().clone();
        }
    }
}

// ─── Claim guard ────────────────────────────────────────────────────────────

/// A live screen-share claim owned by the local session.
///
/// `release` is the graceful stop; dropping without it leaves the claim to
/// the channel's disconnect cleanup (the abrupt path).
pub struct ScreenShareClaimGuard {
    signal: Arc<dyn SignalChannel>,
    key: String,
    space: SpaceId,
    media_path: MediaPathId,
    session_id: SessionId,
    bus: EventBus,
    released: bool,
}

impl ScreenShareClaimGuard {
    /// Write this session's claim (with disconnect-removal registered).
    pub async fn claim(
        signal: Arc<dyn SignalChannel>,
        session: &SessionPaths,
        space: &SpaceId,
        media_path: &MediaPathId,
        bus: EventBus,
    ) -> Result<Self, SignalError> {
        let key = session.sharing_screen_key(space, media_path);
        let claim = ScreenShareClaim {
            sharing: true,
            since_unix_ms: Utc::now().timestamp_millis(),
        };
        signal
            .put(&key, serde_json::to_value(&claim)?, OnDisconnect::Remove)
            .await?;
        info!(key = %key, "screen-share claim written");
        bus.emit(NearCastEvent::share_claimed(
            space.as_str(),
            media_path.as_str(),
            session.session_id.as_str(),
        ));
        Ok(Self {
            signal,
            key,
            space: space.clone(),
            media_path: media_path.clone(),
            session_id: session.session_id.clone(),
            bus,
            released: false,
        })
    }

    /// Remove the claim now (graceful stop).
    pub async fn release(mut self) {
        self.released = true;
        match self.signal.remove(&self.key).await {
            Ok(()) => {
                info!(key = %self.key, "screen-share claim released");
                self.bus.emit(NearCastEvent::share_released(
                    self.space.as_str(),
                    self.media_path.as_str(),
                    self.session_id.as_str(),
                ));
            }
            Err(e) => {
                // Disconnect cleanup remains as the backstop.
                warn!(key = %self.key, error = %e, "claim removal failed");
            }
        }
    }
}

impl Drop for ScreenShareClaimGuard {
    fn drop(&mut self) {
        if !self.released {
            debug!(key = %self.key, "claim dropped unreleased; disconnect cleanup will reap it");
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
