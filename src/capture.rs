// src/capture.rs
//
// Local device/track acquisition for NearCast.
//
// The platform's device APIs (microphone, webcam, screen capture) live
// behind the `CaptureSource` trait; the coordination layer only ever talks
// to a `CaptureController`, which adds the policy the platform layer must
// not have to re-implement:
//
//   * single-flight acquisition -- a second request while one is running is
//     ignored, never queued;
//   * a sticky `failed` flag on acquisition errors, cleared only by an
//     explicit `resume()` or a later success (no automatic retry);
//   * deterministic release of the held track on `stop()`.
//
// The acquired track is exposed as a `watch` stream so the producer
// lifecycle manager can feed on it directly.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::CaptureError;
use crate::events::{EventBus, NearCastEvent};
use crate::media::{LocalTrack, MediaKind, SessionId};

/// Platform hook that produces local media tracks.
#[async_trait]
pub trait CaptureSource: Send + Sync + 'static {
    /// Acquire a track of the given kind. Slow; may prompt the user.
    async fn acquire(&self, kind: MediaKind) -> Result<LocalTrack, CaptureError>;

    /// Release a previously acquired track (stop the device).
    async fn release(&self, track: LocalTrack);
}

/// Drives one `CaptureSource` for one media kind.
///
/// Cheap to clone (interior `Arc`); clones share the held track and flags.
#[derive(Clone)]
pub struct CaptureController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    source: Arc<dyn CaptureSource>,
    kind: MediaKind,
    session_id: SessionId,
    bus: EventBus,
    track_tx: watch::Sender<Option<LocalTrack>>,
    failed_tx: watch::Sender<bool>,
    in_flight: AtomicBool,
}

impl CaptureController {
    pub fn new(
        source: Arc<dyn CaptureSource>,
        kind: MediaKind,
        session_id: SessionId,
        bus: EventBus,
    ) -> Self {
        let (track_tx, _) = watch::channel(None);
        let (failed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ControllerInner {
                source,
                kind,
                session_id,
                bus,
                track_tx,
                failed_tx,
                in_flight: AtomicBool::new(false),
            }),
        }
    }

    /// The currently held track, updated on acquisition and release.
    pub fn track(&self) -> watch::Receiver<Option<LocalTrack>> {
        self.inner.track_tx.subscribe()
    }

    /// Sticky acquisition-failure flag.
    pub fn failed(&self) -> watch::Receiver<bool> {
        self.inner.failed_tx.subscribe()
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    /// Try to acquire a track. Returns `true` if a track is held afterwards.
    ///
    /// If a track is already held, or another acquisition is in flight, this
    /// returns immediately without touching the device.
    pub async fn request(&self) -> bool {
        let inner = &self.inner;
        if inner.track_tx.borrow().is_some() {
            return true;
        }
        if inner
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Another request is already talking to the device.
            return false;
        }

        let result = inner.source.acquire(inner.kind).await;
        inner.in_flight.store(false, Ordering::SeqCst);

        match result {
            Ok(track) => {
                info!(kind = %inner.kind, track = %track.id, "capture acquired");
                inner.failed_tx.send_replace(false);
                inner.track_tx.send_replace(Some(track));
                true
            }
            Err(err) => {
                warn!(kind = %inner.kind, error = %err, "capture failed");
                inner.bus.emit(NearCastEvent::capture_failed(
                    inner.session_id.as_str(),
                    inner.kind,
                    &err.to_string(),
                ));
                inner.failed_tx.send_replace(true);
                false
            }
        }
    }

    /// User-triggered recovery: clear the failure latch and re-attempt.
    pub async fn resume(&self) -> bool {
        self.inner.failed_tx.send_replace(false);
        self.request().await
    }

    /// Release the held track, if any, and drop it from the stream.
    pub async fn stop(&self) {
        let taken = self.inner.track_tx.send_replace(None);
        if let Some(track) = taken {
            info!(kind = %self.inner.kind, track = %track.id, "capture released");
            self.inner.source.release(track).await;
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
