// src/surface.rs
//
// Capture/consume orchestration for one share surface.
//
// A surface (a screen, stage or board position in the space) is either
// showing nobody, showing the local user's own capture, or showing one
// remote session's share. This module owns that state machine and the
// resources each state implies:
//
//   NoOneSharing        -> nothing held
//   AwaitingLocalShare  -> device acquisition in flight (single-flight,
//                          further clicks ignored)
//   LocalSharing        -> captured track held + share claim written
//   RemoteSharing(s)    -> screenVideo/screenAudio consumption requested
//                          for s through the delta pipeline
//
// Transitions are level-driven: the worker folds the captured-track
// stream, the elected-sharer stream and the consumed-media map into the
// current phase on every change, so a transition missed under load is
// recovered on the next wakeup. Clicks are the only edge-driven input.
//
// Teardown is deterministic: stop capture, retract outstanding
// consumption, release the claim -- in that order -- before `shutdown`
// returns. Only abrupt deaths fall back to the channel's disconnect
// cleanup.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::CaptureController;
use crate::config::CoordConfig;
use crate::consume::{ConsumerRequestPublisher, ConsumptionPipeline};
use crate::delta::VisibilitySet;
use crate::events::EventBus;
use crate::media::{LocalTrack, MediaKind, MediaPathId, PeerId, RemoteTrack, SessionId, SpaceId, SurfaceMedia};
use crate::paths::SessionPaths;
use crate::screen::{spawn_active_sharer, ArbitratorInputs, ScreenShareClaimGuard};
use crate::signal::SignalChannel;

// ─── Phase ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfacePhase {
    NoOneSharing,
    AwaitingLocalShare,
    LocalSharing,
    RemoteSharing(SessionId),
}

// ─── Coordinator ────────────────────────────────────────────────────────────

/// Everything a surface coordinator folds over.
pub struct SurfaceDeps {
    pub signal: Arc<dyn SignalChannel>,
    pub session: SessionPaths,
    pub space: SpaceId,
    pub media_path: MediaPathId,
    /// Screen-video capture for this surface.
    pub capture: CaptureController,
    /// Per-session remote media exposed by the media layer.
    pub consumed_media: watch::Receiver<HashMap<SessionId, SurfaceMedia>>,
    pub active_sessions: watch::Receiver<HashSet<SessionId>>,
    pub own_session: watch::Receiver<Option<SessionId>>,
    pub bus: EventBus,
    pub config: CoordConfig,
}

/// Handle to one running surface coordinator.
pub struct SurfaceCoordinator {
    clicks: mpsc::Sender<()>,
    media: watch::Receiver<SurfaceMedia>,
    phase: watch::Receiver<SurfacePhase>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl SurfaceCoordinator {
    pub async fn spawn(deps: SurfaceDeps, cancel: CancellationToken) -> Self {
        let (sharer, arbitrator) = spawn_active_sharer(
            deps.signal.as_ref(),
            &deps.space,
            &deps.media_path,
            ArbitratorInputs {
                active_sessions: deps.active_sessions,
                own_session: deps.own_session,
            },
            deps.bus.clone(),
            cancel.clone(),
        )
        .await;

        // The consumption pipeline runs on its own token so teardown can
        // flush its retraction writes at a known point.
        let (want_tx, want_rx) = watch::channel(VisibilitySet::new());
        let pipeline = ConsumptionPipeline::spawn(
            ConsumerRequestPublisher::new(
                deps.signal.clone(),
                deps.session.clone(),
                deps.config.signal_write_warn,
            ),
            vec![MediaKind::ScreenVideo, MediaKind::ScreenAudio],
            want_rx,
            CancellationToken::new(),
        );

        let (media_tx, media) = watch::channel(SurfaceMedia::default());
        let (phase_tx, phase) = watch::channel(SurfacePhase::NoOneSharing);
        let (click_tx, click_rx) = mpsc::channel(8);

        let worker = Worker {
            signal: deps.signal,
            session: deps.session,
            space: deps.space,
            media_path: deps.media_path,
            track: deps.capture.track(),
            failed: deps.capture.failed(),
            capture: deps.capture,
            consumed_media: deps.consumed_media,
            sharer,
            bus: deps.bus,
            media_tx,
            phase_tx,
            want_tx,
            claim: None,
            awaiting_capture: false,
        };
        let join = tokio::spawn(worker.run(cancel.clone(), click_rx, pipeline, arbitrator));

        Self {
            clicks: click_tx,
            media,
            phase,
            cancel,
            join,
        }
    }

    /// What this surface should currently render.
    pub fn media(&self) -> watch::Receiver<SurfaceMedia> {
        self.media.clone()
    }

    pub fn phase(&self) -> watch::Receiver<SurfacePhase> {
        self.phase.clone()
    }

    /// The user clicked the share control. Starts a share when nobody holds
    /// the surface, stops it when the local session does, and is ignored
    /// while acquisition is pending or a remote session is sharing.
    pub fn toggle_share(&self) {
        if self.clicks.try_send(()).is_err() {
            debug!("share click dropped");
        }
    }

    /// Stop the coordinator: capture stopped, consumption retracted, claim
    /// released before this returns.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────────

struct Worker {
    signal: Arc<dyn SignalChannel>,
    session: SessionPaths,
    space: SpaceId,
    media_path: MediaPathId,
    capture: CaptureController,
    track: watch::Receiver<Option<LocalTrack>>,
    failed: watch::Receiver<bool>,
    consumed_media: watch::Receiver<HashMap<SessionId, SurfaceMedia>>,
    sharer: watch::Receiver<Option<SessionId>>,
    bus: EventBus,
    media_tx: watch::Sender<SurfaceMedia>,
    phase_tx: watch::Sender<SurfacePhase>,
    want_tx: watch::Sender<VisibilitySet>,
    claim: Option<ScreenShareClaimGuard>,
    awaiting_capture: bool,
}

impl Worker {
    async fn run(
        mut self,
        cancel: CancellationToken,
        mut clicks: mpsc::Receiver<()>,
        pipeline: ConsumptionPipeline,
        arbitrator: JoinHandle<()>,
    ) {
        self.reconcile().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                click = clicks.recv() => {
                    match click {
                        Some(()) => self.on_click().await,
                        // Handle dropped without shutdown; tear down anyway.
                        None => break,
                    }
                }
                changed = self.track.changed() => {
                    if changed.is_err() { break; }
                }
                changed = self.failed.changed() => {
                    if changed.is_err() { break; }
                }
                changed = self.sharer.changed() => {
                    if changed.is_err() { break; }
                }
                changed = self.consumed_media.changed() => {
                    if changed.is_err() { break; }
                }
            }
            self.reconcile().await;
        }
        self.teardown(cancel, pipeline, arbitrator).await;
    }

    async fn on_click(&mut self) {
        let phase = self.phase_tx.borrow().clone();
        match phase {
            SurfacePhase::LocalSharing => {
                info!(surface = %self.media_path, "share toggled off");
                // Dropping the track makes reconcile release the claim.
                self.capture.stop().await;
            }
            SurfacePhase::AwaitingLocalShare => {
                debug!("share click ignored; acquisition pending");
            }
            SurfacePhase::RemoteSharing(session) => {
                debug!(sharer = %session, "share click ignored; surface taken");
            }
            SurfacePhase::NoOneSharing => {
                info!(surface = %self.media_path, "share toggled on");
                self.awaiting_capture = true;
                // Only failures after this click resolve the await.
                self.failed.borrow_and_update();
                let capture = self.capture.clone();
                tokio::spawn(async move {
                    // Clears any stale failure latch, then acquires.
                    capture.resume().await;
                });
            }
        }
    }

    /// Fold current input values into phase, surface media, claim and
    /// desired consumption.
    async fn reconcile(&mut self) {
        if self.awaiting_capture && *self.failed.borrow_and_update() {
            // Capture layer already logged and emitted the failure detail.
            warn!(surface = %self.media_path, "local share did not start");
            self.awaiting_capture = false;
        }
        let local = self.track.borrow_and_update().clone();
        let sharer = self.sharer.borrow_and_update().clone();
        self.consumed_media.borrow_and_update();

        match local {
            Some(track) => {
                self.awaiting_capture = false;
                if self.claim.is_none() {
                    match ScreenShareClaimGuard::claim(
                        self.signal.clone(),
                        &self.session,
                        &self.space,
                        &self.media_path,
                        self.bus.clone(),
                    )
                    .await
                    {
                        Ok(guard) => self.claim = Some(guard),
                        // Transient; the channel's own resync is the recovery.
                        Err(e) => warn!(error = %e, "share claim write failed"),
                    }
                }
                self.set_want(VisibilitySet::new());
                self.set_media(SurfaceMedia {
                    video: Some(RemoteTrack::from_local(
                        &track,
                        self.session.session_id.clone(),
                    )),
                    audio: None,
                });
                self.set_phase(SurfacePhase::LocalSharing);
            }
            None => {
                if let Some(claim) = self.claim.take() {
                    claim.release().await;
                }
                if self.awaiting_capture {
                    self.set_want(VisibilitySet::new());
                    self.set_media(SurfaceMedia::default());
                    self.set_phase(SurfacePhase::AwaitingLocalShare);
                } else if let Some(session) = sharer {
                    self.set_want(VisibilitySet::from([PeerId::from(&session)]));
                    let media = self
                        .consumed_media
                        .borrow()
                        .get(&session)
                        .cloned()
                        .unwrap_or_default();
                    self.set_media(media);
                    self.set_phase(SurfacePhase::RemoteSharing(session));
                } else {
                    self.set_want(VisibilitySet::new());
                    self.set_media(SurfaceMedia::default());
                    self.set_phase(SurfacePhase::NoOneSharing);
                }
            }
        }
    }

    async fn teardown(
        mut self,
        cancel: CancellationToken,
        pipeline: ConsumptionPipeline,
        arbitrator: JoinHandle<()>,
    ) {
        // Reached via the clicks channel closing too, so cancel explicitly.
        cancel.cancel();

        // 1. Local capture.
        self.capture.stop().await;
        // 2. Outstanding consumption (pipeline flushes its retraction).
        pipeline.shutdown().await;
        // 3. Our claim.
        if let Some(claim) = self.claim.take() {
            claim.release().await;
        }
        let _ = arbitrator.await;

        self.set_want(VisibilitySet::new());
        self.set_media(SurfaceMedia::default());
        self.set_phase(SurfacePhase::NoOneSharing);
        info!(surface = %self.media_path, "surface coordinator stopped");
    }

    fn set_phase(&self, next: SurfacePhase) {
        let surface = self.media_path.clone();
        self.phase_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!(surface = %surface, from = ?current, to = ?next, "surface phase");
            *current = next;
            true
        });
    }

    fn set_media(&self, next: SurfaceMedia) {
        self.media_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn set_want(&self, next: VisibilitySet) {
        self.want_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::MockCapture;
    use crate::media::{TrackId, UserId};
    use crate::signal::{MemorySignal, OnDisconnect};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Rig {
        service: MemorySignal,
        source: Arc<MockCapture>,
        coordinator: SurfaceCoordinator,
        consumed_tx: watch::Sender<HashMap<SessionId, SurfaceMedia>>,
        #[allow(dead_code)]
        active_tx: watch::Sender<HashSet<SessionId>>,
        #[allow(dead_code)]
        own_tx: watch::Sender<Option<SessionId>>,
    }

    async fn rig(active: &[&str]) -> Rig {
        let service = MemorySignal::new();
        let conn = service.connect();
        let source = MockCapture::new();
        let bus = EventBus::new();
        let capture = CaptureController::new(
            source.clone(),
            MediaKind::ScreenVideo,
            SessionId::from("s1"),
            bus.clone(),
        );
        let (consumed_tx, consumed_rx) = watch::channel(HashMap::new());
        let (active_tx, active_rx) =
            watch::channel(active.iter().map(|s| SessionId::from(*s)).collect());
        let (own_tx, own_rx) = watch::channel(Some(SessionId::from("s1")));

        let coordinator = SurfaceCoordinator::spawn(
            SurfaceDeps {
                signal: Arc::new(conn),
                session: SessionPaths::new(UserId::from("u1"), SessionId::from("s1")),
                space: SpaceId::from("sp"),
                media_path: MediaPathId::from("stage"),
                capture,
                consumed_media: consumed_rx,
                active_sessions: active_rx,
                own_session: own_rx,
                bus,
                config: CoordConfig::default(),
            },
            CancellationToken::new(),
        )
        .await;

        Rig {
            service,
            source,
            coordinator,
            consumed_tx,
            active_tx,
            own_tx,
        }
    }

    const CLAIM_KEY: &str = "sharingScreen/sp/stage/u1/s1";

    /// Poll until the store holds `expected` at `key`; writes from the
    /// pipeline task land asynchronously relative to phase changes.
    async fn wait_for_key(service: &MemorySignal, key: &str, expected: serde_json::Value) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if service.get(key).await.as_ref() == Some(&expected) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {key} == {expected}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn local_share_round_trip() {
        let rig = rig(&["s1"]).await;
        let mut phase = rig.coordinator.phase();
        let mut media = rig.coordinator.media();
        assert_eq!(*phase.borrow(), SurfacePhase::NoOneSharing);

        // Click: capture resolves, the claim appears, own media is surfaced.
        rig.coordinator.toggle_share();
        phase
            .wait_for(|p| *p == SurfacePhase::LocalSharing)
            .await
            .unwrap();
        media.wait_for(|m| m.video.is_some()).await.unwrap();
        let video = media.borrow().video.clone().unwrap();
        assert_eq!(video.session_id, SessionId::from("s1"));

        let claim = rig.service.get(CLAIM_KEY).await.expect("claim row");
        assert_eq!(claim["sharing"], json!(true));

        // Click again: claim removed, device released, back to idle.
        rig.coordinator.toggle_share();
        phase
            .wait_for(|p| *p == SurfacePhase::NoOneSharing)
            .await
            .unwrap();
        media.wait_for(|m| m.video.is_none()).await.unwrap();
        assert_eq!(rig.service.get(CLAIM_KEY).await, None);
        assert_eq!(rig.source.release_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_capture_returns_to_idle_without_a_claim() {
        let rig = rig(&["s1"]).await;
        let mut phase = rig.coordinator.phase();

        // Park acquisition so the awaiting phase is observable.
        rig.source.close_gate();
        rig.coordinator.toggle_share();
        phase
            .wait_for(|p| *p == SurfacePhase::AwaitingLocalShare)
            .await
            .unwrap();

        // Clicks while pending do not reach the device again.
        rig.coordinator.toggle_share();

        rig.source.deny.store(true, Ordering::SeqCst);
        rig.source.open_gate();
        phase
            .wait_for(|p| *p == SurfacePhase::NoOneSharing)
            .await
            .unwrap();
        assert_eq!(rig.service.get(CLAIM_KEY).await, None);
        assert_eq!(rig.source.acquire_calls.load(Ordering::SeqCst), 1);

        // A later click retries from scratch and succeeds.
        rig.source.deny.store(false, Ordering::SeqCst);
        rig.coordinator.toggle_share();
        phase
            .wait_for(|p| *p == SurfacePhase::LocalSharing)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn remote_share_is_consumed_then_retracted() {
        let rig = rig(&["s1", "s2"]).await;
        let mut phase = rig.coordinator.phase();
        let mut media = rig.coordinator.media();

        // s2 claims the surface.
        let remote = rig.service.connect();
        remote
            .put(
                "sharingScreen/sp/stage/u2/s2",
                json!({"sharing": true, "sinceUnixMs": 5}),
                OnDisconnect::Keep,
            )
            .await
            .unwrap();
        phase
            .wait_for(|p| *p == SurfacePhase::RemoteSharing(SessionId::from("s2")))
            .await
            .unwrap();

        // Consumption of s2's screen kinds was requested under our session.
        for kind in ["screenVideo", "screenAudio"] {
            let key = format!("userCommunication/u1/s1/peersToConsume/{kind}/s2");
            wait_for_key(&rig.service, &key, json!(true)).await;
        }

        // Once the media layer exposes s2's tracks, the surface renders them.
        let track = RemoteTrack {
            id: TrackId::from("t-remote"),
            kind: MediaKind::ScreenVideo,
            session_id: SessionId::from("s2"),
        };
        rig.consumed_tx.send_replace(HashMap::from([(
            SessionId::from("s2"),
            SurfaceMedia {
                video: Some(track.clone()),
                audio: None,
            },
        )]));
        media
            .wait_for(|m| m.video.as_ref() == Some(&track))
            .await
            .unwrap();

        // s2 stops: requests flip to false and the surface empties.
        remote.remove("sharingScreen/sp/stage/u2/s2").await.unwrap();
        phase
            .wait_for(|p| *p == SurfacePhase::NoOneSharing)
            .await
            .unwrap();
        for kind in ["screenVideo", "screenAudio"] {
            let key = format!("userCommunication/u1/s1/peersToConsume/{kind}/s2");
            wait_for_key(&rig.service, &key, json!(false)).await;
        }
        media.wait_for(|m| m.video.is_none()).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_while_sharing_releases_everything() {
        let rig = rig(&["s1"]).await;
        let mut phase = rig.coordinator.phase();

        rig.coordinator.toggle_share();
        phase
            .wait_for(|p| *p == SurfacePhase::LocalSharing)
            .await
            .unwrap();

        rig.coordinator.shutdown().await;
        assert_eq!(rig.service.get(CLAIM_KEY).await, None);
        assert_eq!(rig.source.release_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*phase.borrow(), SurfacePhase::NoOneSharing);
    }

    #[tokio::test]
    async fn shutdown_while_consuming_retracts_requests() {
        let rig = rig(&["s1", "s2"]).await;
        let mut phase = rig.coordinator.phase();

        let remote = rig.service.connect();
        remote
            .put(
                "sharingScreen/sp/stage/u2/s2",
                json!({"sharing": true, "sinceUnixMs": 5}),
                OnDisconnect::Keep,
            )
            .await
            .unwrap();
        phase
            .wait_for(|p| matches!(p, SurfacePhase::RemoteSharing(_)))
            .await
            .unwrap();
        // Wait for the requests to land; only written requests get retracted.
        for kind in ["screenVideo", "screenAudio"] {
            let key = format!("userCommunication/u1/s1/peersToConsume/{kind}/s2");
            wait_for_key(&rig.service, &key, json!(true)).await;
        }

        // Shutdown flushes the retraction before returning.
        rig.coordinator.shutdown().await;
        for kind in ["screenVideo", "screenAudio"] {
            let key = format!("userCommunication/u1/s1/peersToConsume/{kind}/s2");
            assert_eq!(rig.service.get(&key).await, Some(json!(false)), "{key}");
        }
    }
}
