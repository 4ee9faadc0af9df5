// src/session.rs
//
// Explicit session context.
//
// Everything the coordination layer runs for one authenticated peer-session
// hangs off a `SessionContext`: the signaling connection, the event bus, the
// presence registration and the cancellation root for every task spawned
// from it. There is no process-global state; a re-auth discards the context
// and creates a fresh one with new `SessionPaths`.
//
// ─ Teardown contract ────────────────────────────────────────────────────────
//
//   Components created through the factory methods (producer managers,
//   consumption pipelines, surface coordinators) are owned by the caller and
//   should be shut down first -- each flushes its own signaling rows. The
//   context's `shutdown` then cancels any stragglers, removes the presence
//   row and deletes the whole `userCommunication/{user}/{session}` subtree,
//   so a graceful leave never depends on the channel's disconnect cleanup.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capture::CaptureController;
use crate::config::CoordConfig;
use crate::consume::{ConsumerRequestPublisher, ConsumptionPipeline};
use crate::delta::VisibilitySet;
use crate::error::SignalError;
use crate::events::{EventBus, NearCastEvent};
use crate::media::{MediaKind, MediaPathId, SessionId, SpaceId, SurfaceMedia};
use crate::paths::SessionPaths;
use crate::presence::{self, ProducingPeer};
use crate::producer::{ProducerInputs, ProducerManager};
use crate::signal::SignalChannel;
use crate::surface::{SurfaceCoordinator, SurfaceDeps};
use crate::visibility::spawn_visibility_sampler;

pub struct SessionContext {
    signal: Arc<dyn SignalChannel>,
    paths: SessionPaths,
    space: SpaceId,
    config: CoordConfig,
    bus: EventBus,
    cancel: CancellationToken,
    active_sessions: watch::Receiver<HashSet<SessionId>>,
    /// Constant for the lifetime of this context; a re-auth builds a new one.
    own_session: watch::Sender<Option<SessionId>>,
    presence_watch: JoinHandle<()>,
}

impl SessionContext {
    /// Register this session with the space and start following its
    /// presence. Fails if the signaling channel rejects the initial writes.
    pub async fn create(
        signal: Arc<dyn SignalChannel>,
        paths: SessionPaths,
        space: SpaceId,
        config: CoordConfig,
    ) -> Result<Self, SignalError> {
        let cancel = CancellationToken::new();
        let bus = EventBus::with_capacity(config.event_bus_capacity);

        // If this connection dies, the channel server reaps the whole
        // per-session namespace; individual writers still register their own
        // keys so partial sessions clean up too.
        signal
            .register_cleanup(&paths.user_communication_prefix())
            .await?;
        presence::register_session(signal.as_ref(), &paths, &space).await?;

        let (active_sessions, presence_watch) =
            presence::watch_active_sessions(signal.as_ref(), &space, cancel.child_token()).await;

        let (own_session, _) = watch::channel(Some(paths.session_id.clone()));
        info!(
            user = %paths.user_id,
            session = %paths.session_id,
            space = %space,
            "session context created"
        );
        Ok(Self {
            signal,
            paths,
            space,
            config,
            bus,
            cancel,
            active_sessions,
            own_session,
            presence_watch,
        })
    }

    // ─── Factories ──────────────────────────────────────────────────────

    /// Spawn the producer lifecycle manager for one media kind.
    pub fn producer(&self, kind: MediaKind, inputs: ProducerInputs) -> ProducerManager {
        ProducerManager::spawn(
            self.signal.clone(),
            self.paths.clone(),
            self.space.clone(),
            kind,
            inputs,
            self.bus.clone(),
            self.cancel.child_token(),
        )
    }

    /// Publish consumption requests for `kinds`, following `visibility`.
    pub fn consumption(
        &self,
        kinds: Vec<MediaKind>,
        visibility: watch::Receiver<VisibilitySet>,
    ) -> ConsumptionPipeline {
        ConsumptionPipeline::spawn(
            ConsumerRequestPublisher::new(
                self.signal.clone(),
                self.paths.clone(),
                self.config.signal_write_warn,
            ),
            kinds,
            visibility,
            self.cancel.child_token(),
        )
    }

    /// Sample a proximity/visibility probe on the configured cadence. The
    /// sampling task stops with the context.
    pub fn visibility<F>(&self, probe: F) -> watch::Receiver<VisibilitySet>
    where
        F: FnMut() -> VisibilitySet + Send + 'static,
    {
        let (rx, _join) = spawn_visibility_sampler(
            probe,
            self.config.visibility_poll,
            self.cancel.child_token(),
        );
        rx
    }

    /// Spawn a surface coordinator for one share surface, wired to this
    /// context's presence and arbitration inputs.
    pub async fn surface(
        &self,
        media_path: MediaPathId,
        capture: CaptureController,
        consumed_media: watch::Receiver<HashMap<SessionId, SurfaceMedia>>,
    ) -> SurfaceCoordinator {
        SurfaceCoordinator::spawn(
            SurfaceDeps {
                signal: self.signal.clone(),
                session: self.paths.clone(),
                space: self.space.clone(),
                media_path,
                capture,
                consumed_media,
                active_sessions: self.active_sessions.clone(),
                own_session: self.own_session.subscribe(),
                bus: self.bus.clone(),
                config: self.config.clone(),
            },
            self.cancel.child_token(),
        )
        .await
    }

    /// Follow who is producing `kind` in this space. The watching task stops
    /// with the context.
    pub async fn producing_peers(
        &self,
        kind: MediaKind,
    ) -> watch::Receiver<BTreeMap<SessionId, ProducingPeer>> {
        let (rx, _join) = presence::watch_producing_peers(
            self.signal.as_ref(),
            &self.space,
            kind,
            self.cancel.child_token(),
        )
        .await;
        rx
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Subscribe to lifecycle events emitted by this context's components.
    pub fn events(&self) -> broadcast::Receiver<NearCastEvent> {
        self.bus.subscribe()
    }

    pub fn active_sessions(&self) -> watch::Receiver<HashSet<SessionId>> {
        self.active_sessions.clone()
    }

    pub fn own_session(&self) -> watch::Receiver<Option<SessionId>> {
        self.own_session.subscribe()
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn space(&self) -> &SpaceId {
        &self.space
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    // ─── Teardown ───────────────────────────────────────────────────────

    /// Graceful leave: cancel every task spawned from this context, then
    /// remove the presence row and the per-session signaling subtree.
    /// Caller-owned components should be shut down before this.
    pub async fn shutdown(self) {
        info!(session = %self.paths.session_id, "session context closing");
        self.cancel.cancel();
        let _ = self.presence_watch.await;

        if let Err(e) =
            presence::unregister_session(self.signal.as_ref(), &self.paths, &self.space).await
        {
            warn!(error = %e, "presence removal failed");
        }
        if let Err(e) = self
            .signal
            .remove(&self.paths.user_communication_prefix())
            .await
        {
            warn!(error = %e, "session subtree removal failed");
        }
        info!(session = %self.paths.session_id, "session context closed");
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
