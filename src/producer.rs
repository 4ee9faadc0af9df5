// src/producer.rs
//
// Producer lifecycle manager.
//
// One manager task owns the outbound producer for one (session, kind) pair
// and is the only writer of that pair's signaling rows. It follows four
// input streams -- activation consent, transport availability, the current
// local track, and the user's mute flag -- and reconciles toward them:
//
//   Idle -> AwaitingTransport -> AwaitingTrack -> Producing -> Closed
//
// ─ Epoch discipline ─────────────────────────────────────────────────────────
//
//   An activation epoch starts when consent and a transport are both
//   present, and ends when either goes away. Within one epoch the SFU
//   "produce" primitive runs at most once; later tracks go through
//   "replace track" on the existing producer (renegotiation is the
//   expensive path). The manager task itself is the single-flight guard:
//   it awaits the produce round-trip inline, and the watch inputs coalesce
//   anything that arrived meanwhile into the next reconcile.
//
//   A failed produce does not burn the epoch -- the failing track id is
//   remembered and the next *different* track retries.
//
// ─ Publication ──────────────────────────────────────────────────────────────
//
//   While a producer exists the manager keeps two rows live, both with
//   disconnect-removal registered:
//     producingPeers/{space}/{kind}/{session}            {userId, paused}
//     userCommunication/.../clientProducerPaused/{prod}  {paused}
//   Writes are deduplicated per key on the paused value, so bursts of
//   identical states cost one write.
//
// ────────────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventBus, NearCastEvent};
use crate::media::{LocalTrack, MediaKind, SpaceId, TrackId};
use crate::paths::SessionPaths;
use crate::presence::ProducingPeer;
use crate::signal::{OnDisconnect, SignalChannel};
use crate::transport::{ProducerHandle, ProducerTransport};

// ─── Public surface ─────────────────────────────────────────────────────────

/// Where the manager currently stands. `Producing` covers both the active
/// and paused sub-states; the paused stream carries that toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerPhase {
    Idle,
    AwaitingTransport,
    AwaitingTrack,
    Producing,
    Closed,
}

/// The four input streams a manager follows.
pub struct ProducerInputs {
    /// The connected send transport, when one exists.
    pub transport: watch::Receiver<Option<Arc<dyn ProducerTransport>>>,
    /// The current local track for this kind, from the capture controller.
    pub track: watch::Receiver<Option<LocalTrack>>,
    /// User consent to send this kind at all.
    pub activation: watch::Receiver<bool>,
    /// Explicit user mute.
    pub user_paused: watch::Receiver<bool>,
}

/// `clientProducerPaused/{producer}` leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerPausedNotice {
    pub paused: bool,
}

/// Handle on a spawned manager task.
pub struct ProducerManager {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    paused: watch::Receiver<bool>,
    phase: watch::Receiver<ProducerPhase>,
}

impl ProducerManager {
    pub fn spawn(
        signal: Arc<dyn SignalChannel>,
        session: SessionPaths,
        space: SpaceId,
        kind: MediaKind,
        inputs: ProducerInputs,
        bus: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        let (paused_tx, paused_rx) = watch::channel(true);
        let (phase_tx, phase_rx) = watch::channel(ProducerPhase::Idle);
        let worker = Worker {
            signal,
            session,
            space,
            kind,
            bus,
            paused_tx,
            phase_tx,
            active: None,
            produced_this_epoch: false,
            failed_track: None,
            last_writes: HashMap::new(),
        };
        let join = tokio::spawn(worker.run(inputs, cancel.clone()));
        Self {
            cancel,
            join,
            paused: paused_rx,
            phase: phase_rx,
        }
    }

    /// The externally visible paused state (starts `true`: nothing flows
    /// before a producer exists).
    pub fn paused(&self) -> watch::Receiver<bool> {
        self.paused.clone()
    }

    pub fn phase(&self) -> watch::Receiver<ProducerPhase> {
        self.phase.clone()
    }

    /// Stop the manager; returns after the producer is closed and its
    /// signaling rows are gone.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────────

struct ActiveProducer {
    handle: Arc<dyn ProducerHandle>,
    /// The transport it was produced on; a different transport means the
    /// producer is orphaned.
    transport: Arc<dyn ProducerTransport>,
    track_id: TrackId,
    first_active_sent: bool,
}

struct Worker {
    signal: Arc<dyn SignalChannel>,
    session: SessionPaths,
    space: SpaceId,
    kind: MediaKind,
    bus: EventBus,
    paused_tx: watch::Sender<bool>,
    phase_tx: watch::Sender<ProducerPhase>,

    active: Option<ActiveProducer>,
    produced_this_epoch: bool,
    /// Track that failed to produce in this epoch; retried only when a
    /// different track arrives.
    failed_track: Option<TrackId>,
    /// Last paused value written per signaling key (write dedup).
    last_writes: HashMap<String, bool>,
}

impl Worker {
    async fn run(mut self, mut inputs: ProducerInputs, cancel: CancellationToken) {
        self.reconcile(&mut inputs).await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                r = inputs.activation.changed() => {
                    if r.is_err() { break; }
                    self.reconcile(&mut inputs).await;
                }
                r = inputs.transport.changed() => {
                    if r.is_err() { break; }
                    self.reconcile(&mut inputs).await;
                }
                r = inputs.track.changed() => {
                    if r.is_err() { break; }
                    self.reconcile(&mut inputs).await;
                }
                r = inputs.user_paused.changed() => {
                    if r.is_err() { break; }
                    self.reconcile(&mut inputs).await;
                }
            }
        }
        self.teardown().await;
    }

    /// Drive the producer toward the current value of every input. Called
    /// on every wake; watch coalescing makes bursts collapse into one pass.
    async fn reconcile(&mut self, inputs: &mut ProducerInputs) {
        let activation = *inputs.activation.borrow_and_update();
        let transport = inputs.transport.borrow_and_update().clone();
        let track = inputs.track.borrow_and_update().clone();
        let user_paused = *inputs.user_paused.borrow_and_update();

        // 1. No consent: the epoch (if any) is over.
        if !activation {
            self.close_current("deactivated").await;
            self.produced_this_epoch = false;
            self.failed_track = None;
            self.set_phase(ProducerPhase::Idle);
            self.update_paused_stream(true);
            return;
        }

        // 2. No transport: a producer cannot outlive its transport.
        let Some(transport) = transport else {
            self.close_current("transport lost").await;
            self.produced_this_epoch = false;
            self.failed_track = None;
            self.set_phase(ProducerPhase::AwaitingTransport);
            self.update_paused_stream(true);
            return;
        };

        // 3. A replaced transport orphans the producer: close it and start
        //    a fresh epoch on the new transport.
        if let Some(active) = &self.active {
            if !Arc::ptr_eq(&active.transport, &transport) {
                self.close_current("transport replaced").await;
                self.produced_this_epoch = false;
                self.failed_track = None;
            }
        }

        // 4. No track yet: keep any existing producer but withhold media.
        let Some(track) = track else {
            let phase = if self.active.is_some() {
                ProducerPhase::Producing
            } else {
                ProducerPhase::AwaitingTrack
            };
            self.set_phase(phase);
            self.sync_paused(user_paused, false).await;
            return;
        };

        // 5. Produce once per epoch; replace within it.
        match &self.active {
            None => {
                if self.failed_track.as_ref() == Some(&track.id) {
                    // Same track already failed; wait for a different one.
                    self.set_phase(ProducerPhase::AwaitingTrack);
                } else {
                    self.produce(transport, track).await;
                }
            }
            Some(active) if active.track_id != track.id => {
                self.replace(track).await;
            }
            Some(_) => {}
        }

        self.sync_paused(user_paused, true).await;
    }

    async fn produce(&mut self, transport: Arc<dyn ProducerTransport>, track: LocalTrack) {
        debug!(kind = %self.kind, track = %track.id, "creating producer");
        match transport.produce(track.clone()).await {
            Ok(handle) => {
                let id = handle.id();
                info!(kind = %self.kind, producer = %id, "producer created");
                self.bus.emit(NearCastEvent::producer_created(
                    self.session.session_id.as_str(),
                    self.kind,
                    id.as_str(),
                ));
                self.active = Some(ActiveProducer {
                    handle,
                    transport,
                    track_id: track.id,
                    first_active_sent: false,
                });
                self.produced_this_epoch = true;
                self.failed_track = None;
                self.set_phase(ProducerPhase::Producing);
            }
            Err(e) => {
                // Caught, never propagated: the caller observes an absent
                // producer and the next track change retries.
                warn!(kind = %self.kind, error = %e, "producer creation failed");
                self.bus.emit(NearCastEvent::producer_failed(
                    self.session.session_id.as_str(),
                    self.kind,
                    &e.to_string(),
                ));
                self.failed_track = Some(track.id);
                self.set_phase(ProducerPhase::AwaitingTrack);
            }
        }
    }

    async fn replace(&mut self, track: LocalTrack) {
        let Some(active) = &mut self.active else {
            return;
        };
        debug!(kind = %self.kind, producer = %active.handle.id(), track = %track.id, "replacing track");
        match active.handle.replace_track(track.clone()).await {
            Ok(()) => {
                active.track_id = track.id;
            }
            Err(e) => {
                // Keep the producer on its old track.
                warn!(kind = %self.kind, error = %e, "replace track failed");
            }
        }
    }

    /// Recompute the externally visible paused state, align the transport
    /// with it, and publish.
    async fn sync_paused(&mut self, user_paused: bool, has_track: bool) {
        let paused = user_paused || !has_track || self.active.is_none();

        if let Some(active) = &self.active {
            let handle = active.handle.clone();
            if paused && !handle.is_paused() {
                if let Err(e) = handle.pause().await {
                    warn!(kind = %self.kind, error = %e, "pause failed");
                }
            } else if !paused && handle.is_paused() {
                if let Err(e) = handle.resume().await {
                    warn!(kind = %self.kind, error = %e, "resume failed");
                }
            }
        }

        if !paused {
            if let Some(active) = &mut self.active {
                if !active.first_active_sent {
                    active.first_active_sent = true;
                    let id = active.handle.id();
                    self.bus.emit(NearCastEvent::producer_first_active(
                        self.session.session_id.as_str(),
                        self.kind,
                        id.as_str(),
                    ));
                }
            }
        }

        self.publish_paused(paused).await;
        self.update_paused_stream(paused);
    }

    /// Write the paused state to both signaling rows, deduplicated per key
    /// on the value.
    async fn publish_paused(&mut self, paused: bool) {
        let Some(active) = &self.active else {
            return;
        };
        let producer_id = active.handle.id();

        let presence_key = self.session.producing_peers_key(&self.space, self.kind);
        let presence = ProducingPeer {
            user_id: self.session.user_id.clone(),
            paused,
        };
        match serde_json::to_value(presence) {
            Ok(value) => self.put_deduped(&presence_key, paused, value).await,
            Err(e) => warn!(error = %e, "presence row encoding failed"),
        }

        let notice_key = self.session.producer_paused_key(&producer_id);
        match serde_json::to_value(ProducerPausedNotice { paused }) {
            Ok(value) => self.put_deduped(&notice_key, paused, value).await,
            Err(e) => warn!(error = %e, "paused notice encoding failed"),
        }
    }

    async fn put_deduped(&mut self, key: &str, paused: bool, value: serde_json::Value) {
        if self.last_writes.get(key) == Some(&paused) {
            return;
        }
        match self.signal.put(key, value, OnDisconnect::Remove).await {
            Ok(()) => {
                self.last_writes.insert(key.to_string(), paused);
            }
            Err(e) => {
                // Not retried; the next state transition writes again.
                warn!(key, error = %e, "paused publication failed");
            }
        }
    }

    /// Close the current producer, if any, and drop its signaling rows.
    /// Safe to call repeatedly: `take` makes the close happen once.
    async fn close_current(&mut self, reason: &str) {
        let Some(active) = self.active.take() else {
            return;
        };
        let id = active.handle.id();
        info!(kind = %self.kind, producer = %id, reason, "closing producer");
        active.handle.close().await;
        self.bus.emit(NearCastEvent::producer_closed(
            self.session.session_id.as_str(),
            self.kind,
            id.as_str(),
        ));

        let presence_key = self.session.producing_peers_key(&self.space, self.kind);
        if let Err(e) = self.signal.remove(&presence_key).await {
            warn!(key = %presence_key, error = %e, "presence row removal failed");
        }
        let notice_key = self.session.producer_paused_key(&id);
        if let Err(e) = self.signal.remove(&notice_key).await {
            warn!(key = %notice_key, error = %e, "paused notice removal failed");
        }
        self.last_writes.clear();
    }

    async fn teardown(mut self) {
        self.close_current("teardown").await;
        self.set_phase(ProducerPhase::Closed);
        self.update_paused_stream(true);
    }

    fn set_phase(&self, phase: ProducerPhase) {
        self.phase_tx.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                debug!(kind = %self.kind, ?phase, "producer phase");
                *current = phase;
                true
            }
        });
    }

    fn update_paused_stream(&self, paused: bool) {
        self.paused_tx.send_if_modified(|current| {
            if *current == paused {
                false
            } else {
                *current = paused;
                true
            }
        });
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{SessionId, UserId};
    use crate::error::SignalError;
    use crate::signal::{MemorySignal, SignalSubscription};
    use crate::transport::mock::{MockProducer, MockTransport};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Rig {
        transport: Arc<MockTransport>,
        transport_tx: watch::Sender<Option<Arc<dyn ProducerTransport>>>,
        track_tx: watch::Sender<Option<LocalTrack>>,
        activation_tx: watch::Sender<bool>,
        user_paused_tx: watch::Sender<bool>,
        manager: ProducerManager,
    }

    fn session() -> SessionPaths {
        SessionPaths::new(UserId::from("u1"), SessionId::from("s1"))
    }

    /// Spawn a manager over a mock transport with activation already given
    /// and the transport connected.
    fn rig(signal: Arc<dyn SignalChannel>, user_paused: bool) -> Rig {
        let transport = MockTransport::new();
        let (transport_tx, transport_rx) =
            watch::channel(Some(transport.clone() as Arc<dyn ProducerTransport>));
        let (track_tx, track_rx) = watch::channel(None);
        let (activation_tx, activation_rx) = watch::channel(true);
        let (user_paused_tx, user_paused_rx) = watch::channel(user_paused);

        let manager = ProducerManager::spawn(
            signal,
            session(),
            SpaceId::from("sp"),
            MediaKind::WebcamVideo,
            ProducerInputs {
                transport: transport_rx,
                track: track_rx,
                activation: activation_rx,
                user_paused: user_paused_rx,
            },
            EventBus::new(),
            CancellationToken::new(),
        );
        Rig {
            transport,
            transport_tx,
            track_tx,
            activation_tx,
            user_paused_tx,
            manager,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn first_handle(transport: &MockTransport) -> Arc<MockProducer> {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(handle) = transport.handles().await.first() {
                    return handle.clone();
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("no producer created in time")
    }

    #[tokio::test]
    async fn one_produce_then_replace_within_an_epoch() {
        let service = MemorySignal::new();
        let r = rig(Arc::new(service.connect()), false);

        r.track_tx.send_replace(Some(LocalTrack::new(MediaKind::WebcamVideo, "cam-a")));
        let handle = first_handle(&r.transport).await;

        // A second track in the same epoch goes through replace_track.
        r.track_tx.send_replace(Some(LocalTrack::new(MediaKind::WebcamVideo, "cam-b")));
        wait_until({
            let h = handle.clone();
            move || h.replace_count() == 1
        })
        .await;

        assert_eq!(r.transport.produce_count(), 1);
        assert_eq!(handle.close_count(), 0);

        r.manager.shutdown().await;
        assert_eq!(handle.close_count(), 1);
    }

    #[tokio::test]
    async fn epoch_end_closes_exactly_once() {
        let service = MemorySignal::new();
        let r = rig(Arc::new(service.connect()), false);

        r.track_tx.send_replace(Some(LocalTrack::new(MediaKind::WebcamVideo, "cam")));
        let first = first_handle(&r.transport).await;

        // Consent withdrawn: producer closes, phase returns to Idle.
        r.activation_tx.send_replace(false);
        wait_until({
            let h = first.clone();
            move || h.close_count() == 1
        })
        .await;
        let mut phase = r.manager.phase();
        phase.wait_for(|p| *p == ProducerPhase::Idle).await.unwrap();

        // Re-consent: a fresh epoch produces a fresh producer.
        r.activation_tx.send_replace(true);
        wait_until({
            let t = r.transport.clone();
            move || t.produce_count() == 2
        })
        .await;
        let second = r.transport.handles().await[1].clone();

        r.manager.shutdown().await;
        // Each handle closed exactly once, no double close of the first.
        assert_eq!(first.close_count(), 1);
        assert_eq!(second.close_count(), 1);
    }

    #[tokio::test]
    async fn transport_swap_starts_a_new_epoch() {
        let service = MemorySignal::new();
        let r = rig(Arc::new(service.connect()), false);

        r.track_tx.send_replace(Some(LocalTrack::new(MediaKind::WebcamVideo, "cam")));
        let first = first_handle(&r.transport).await;

        // Reconnect: a different transport instance arrives. The orphaned
        // producer closes and a fresh one is produced on the replacement.
        let replacement = MockTransport::new();
        r.transport_tx
            .send_replace(Some(replacement.clone() as Arc<dyn ProducerTransport>));
        let second = first_handle(&replacement).await;

        assert_eq!(first.close_count(), 1);
        assert_eq!(second.close_count(), 0);
        assert_eq!(r.transport.produce_count(), 1);
        assert_eq!(replacement.produce_count(), 1);

        r.manager.shutdown().await;
        assert_eq!(second.close_count(), 1);
    }

    #[tokio::test]
    async fn failed_produce_retries_on_next_track_only() {
        let service = MemorySignal::new();
        let r = rig(Arc::new(service.connect()), false);

        r.transport.reject_next.store(true, Ordering::SeqCst);
        r.track_tx.send_replace(Some(LocalTrack::new(MediaKind::WebcamVideo, "cam")));
        wait_until({
            let t = r.transport.clone();
            move || t.produce_count() == 1
        })
        .await;
        assert!(r.transport.handles().await.is_empty());

        // An unrelated wake with the same track must not retry.
        r.user_paused_tx.send_replace(true);
        r.user_paused_tx.send_replace(false);
        let mut phase = r.manager.phase();
        phase
            .wait_for(|p| *p == ProducerPhase::AwaitingTrack)
            .await
            .unwrap();
        assert_eq!(r.transport.produce_count(), 1);

        // A different track retries and succeeds.
        r.track_tx.send_replace(Some(LocalTrack::new(MediaKind::WebcamVideo, "cam-2")));
        let handle = first_handle(&r.transport).await;
        assert_eq!(r.transport.produce_count(), 2);

        r.manager.shutdown().await;
        assert_eq!(handle.close_count(), 1);
    }

    #[tokio::test]
    async fn presence_rows_follow_the_producer() {
        let service = MemorySignal::new();
        let r = rig(Arc::new(service.connect()), false);
        let presence_key = "producingPeers/sp/webcamVideo/s1";

        r.track_tx.send_replace(Some(LocalTrack::new(MediaKind::WebcamVideo, "cam")));
        let mut paused = r.manager.paused();
        paused.wait_for(|p| !*p).await.unwrap();

        assert_eq!(
            service.get(presence_key).await,
            Some(json!({"userId": "u1", "paused": false}))
        );

        // Mute rewrites the row. The paused stream updates after the row
        // write, so once it reads true the row is already current.
        r.user_paused_tx.send_replace(true);
        paused.wait_for(|p| *p).await.unwrap();
        assert_eq!(
            service.get(presence_key).await,
            Some(json!({"userId": "u1", "paused": true}))
        );

        // Graceful shutdown removes the rows.
        r.manager.shutdown().await;
        assert_eq!(service.get(presence_key).await, None);
    }

    /// Counts `put` calls per key, delegating everything to the wrapped
    /// channel.
    struct CountingSignal {
        inner: Arc<dyn SignalChannel>,
        puts: std::sync::Mutex<std::collections::HashMap<String, usize>>,
        total: AtomicUsize,
    }

    impl CountingSignal {
        fn new(inner: Arc<dyn SignalChannel>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                puts: std::sync::Mutex::new(std::collections::HashMap::new()),
                total: AtomicUsize::new(0),
            })
        }

        fn puts_for(&self, key: &str) -> usize {
            *self.puts.lock().unwrap().get(key).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl SignalChannel for CountingSignal {
        async fn put(
            &self,
            key: &str,
            value: Value,
            on_disconnect: crate::signal::OnDisconnect,
        ) -> Result<(), SignalError> {
            *self.puts.lock().unwrap().entry(key.to_string()).or_insert(0) += 1;
            self.total.fetch_add(1, Ordering::SeqCst);
            self.inner.put(key, value, on_disconnect).await
        }
        async fn remove(&self, key: &str) -> Result<(), SignalError> {
            self.inner.remove(key).await
        }
        async fn merge(
            &self,
            prefix: &str,
            entries: Vec<(String, Value)>,
        ) -> Result<(), SignalError> {
            self.inner.merge(prefix, entries).await
        }
        async fn register_cleanup(&self, path: &str) -> Result<(), SignalError> {
            self.inner.register_cleanup(path).await
        }
        async fn subscribe(&self, prefix: &str) -> SignalSubscription {
            self.inner.subscribe(prefix).await
        }
    }

    #[tokio::test]
    async fn paused_bursts_are_deduplicated_per_value() {
        let service = MemorySignal::new();
        let counting = CountingSignal::new(Arc::new(service.connect()));
        // Start muted: the first publication writes paused = true.
        let r = rig(counting.clone(), true);
        let presence_key = "producingPeers/sp/webcamVideo/s1";

        r.track_tx.send_replace(Some(LocalTrack::new(MediaKind::WebcamVideo, "cam")));
        wait_until({
            let c = counting.clone();
            move || c.puts_for(presence_key) == 1
        })
        .await;

        // true (again): dropped by value dedup whether or not the watch
        // delivers it separately.
        r.user_paused_tx.send_replace(true);
        // false, false, true: exactly two more writes.
        r.user_paused_tx.send_replace(false);
        wait_until({
            let c = counting.clone();
            move || c.puts_for(presence_key) == 2
        })
        .await;
        r.user_paused_tx.send_replace(false);
        r.user_paused_tx.send_replace(true);
        wait_until({
            let c = counting.clone();
            move || c.puts_for(presence_key) == 3
        })
        .await;

        assert_eq!(counting.puts_for(presence_key), 3);
        r.manager.shutdown().await;
        assert_eq!(counting.puts_for(presence_key), 3);
    }

    #[tokio::test]
    async fn missing_track_pauses_without_closing() {
        let service = MemorySignal::new();
        let r = rig(Arc::new(service.connect()), false);

        r.track_tx.send_replace(Some(LocalTrack::new(MediaKind::WebcamVideo, "cam")));
        let handle = first_handle(&r.transport).await;
        let mut paused = r.manager.paused();
        paused.wait_for(|p| !*p).await.unwrap();

        // Track goes away (device unplugged): producer survives, paused.
        r.track_tx.send_replace(None);
        paused.wait_for(|p| *p).await.unwrap();
        assert_eq!(handle.close_count(), 0);
        assert!(handle.is_paused());

        // Track comes back under a new id: replace + resume, same producer.
        r.track_tx.send_replace(Some(LocalTrack::new(MediaKind::WebcamVideo, "cam")));
        paused.wait_for(|p| !*p).await.unwrap();
        assert_eq!(r.transport.produce_count(), 1);
        assert_eq!(handle.replace_count(), 1);
        assert!(!handle.is_paused());

        r.manager.shutdown().await;
    }

    #[tokio::test]
    async fn first_active_is_emitted_once_per_producer() {
        let service = MemorySignal::new();
        let signal: Arc<dyn SignalChannel> = Arc::new(service.connect());
        let bus = EventBus::new();
        let mut events = bus.subscribe();

        let transport = MockTransport::new();
        let (_transport_tx, transport_rx) =
            watch::channel(Some(transport.clone() as Arc<dyn ProducerTransport>));
        let (track_tx, track_rx) = watch::channel(None);
        let (_activation_tx, activation_rx) = watch::channel(true);
        let (user_paused_tx, user_paused_rx) = watch::channel(true);
        let manager = ProducerManager::spawn(
            signal,
            session(),
            SpaceId::from("sp"),
            MediaKind::WebcamAudio,
            ProducerInputs {
                transport: transport_rx,
                track: track_rx,
                activation: activation_rx,
                user_paused: user_paused_rx,
            },
            bus.clone(),
            CancellationToken::new(),
        );

        track_tx.send_replace(Some(LocalTrack::new(MediaKind::WebcamAudio, "mic")));
        // Producer exists but is muted: created, no first_active yet.
        let created = events.recv().await.unwrap();
        assert_eq!(created.event_type, crate::events::EventType::ProducerCreated);

        // Unmute → first_active, once.
        user_paused_tx.send_replace(false);
        let first = events.recv().await.unwrap();
        assert_eq!(
            first.event_type,
            crate::events::EventType::ProducerFirstActive
        );

        // Later toggles do not re-emit it.
        user_paused_tx.send_replace(true);
        user_paused_tx.send_replace(false);
        manager.shutdown().await;
        let closed = events.recv().await.unwrap();
        assert_eq!(closed.event_type, crate::events::EventType::ProducerClosed);
    }
}
