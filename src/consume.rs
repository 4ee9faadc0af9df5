// src/consume.rs
//
// Consumer request publisher.
//
// Takes the command sets produced by the delta engine and writes them under
// this session's `peersToConsume/{kind}` namespace, where SFU-side logic
// picks them up to start/stop forwarding. Strictly side-effecting: a write
// failure is the signaling channel's problem (it reconnects and resyncs on
// its own), so nothing here retries or surfaces errors to the caller.
//
// Per-kind ordering comes for free: one pipeline task is the only writer
// for its kinds, and each delta goes out as a single mergeable update.

use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::delta::{ConsumptionDelta, DeltaTracker, VisibilitySet};
use crate::media::MediaKind;
use crate::paths::SessionPaths;
use crate::signal::SignalChannel;

// ─── Publisher ──────────────────────────────────────────────────────────────

pub struct ConsumerRequestPublisher {
    signal: Arc<dyn SignalChannel>,
    paths: SessionPaths,
    /// Writes slower than this are logged; the channel is supposed to be a
    /// realtime service.
    warn_after: Duration,
}

impl ConsumerRequestPublisher {
    pub fn new(signal: Arc<dyn SignalChannel>, paths: SessionPaths, warn_after: Duration) -> Self {
        Self {
            signal,
            paths,
            warn_after,
        }
    }

    /// Write one command set under `peersToConsume/{kind}` as a single
    /// mergeable update. Side effect only; never fails the caller.
    pub async fn publish(&self, kind: MediaKind, commands: &ConsumptionDelta) {
        if commands.is_empty() {
            return;
        }
        let prefix = self.paths.consume_prefix(kind);
        let entries: Vec<(String, Value)> = commands
            .iter()
            .map(|(peer, consume)| (peer.to_string(), Value::Bool(*consume)))
            .collect();

        let started = Instant::now();
        match self.signal.merge(&prefix, entries).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                if elapsed >= self.warn_after {
                    warn!(
                        kind = %kind,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "slow consumption write"
                    );
                }
                debug!(kind = %kind, commands = commands.len(), "consumption delta published");
            }
            Err(e) => {
                // The channel resyncs on reconnect; do not retry here.
                warn!(kind = %kind, error = %e, "consumption write failed");
            }
        }
    }
}

// ─── Pipeline ───────────────────────────────────────────────────────────────

/// One task wiring a visibility stream through the delta engine into the
/// publisher, for one or more kinds sharing the same peer set.
///
/// On teardown (cancel, or the visibility source going away) the pipeline
/// retracts every request it still holds before exiting, so no consumption
/// request of this session outlives it.
pub struct ConsumptionPipeline {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ConsumptionPipeline {
    pub fn spawn(
        publisher: ConsumerRequestPublisher,
        kinds: Vec<MediaKind>,
        mut visibility: watch::Receiver<VisibilitySet>,
        cancel: CancellationToken,
    ) -> Self {
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let mut tracker = DeltaTracker::new();

            // 1. Flush the current set immediately: consumption must not
            //    wait for the first *change*.
            let initial = visibility.borrow_and_update().clone();
            flush(&publisher, &kinds, tracker.push(initial)).await;

            // 2. Then follow every change.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break;
                    }
                    changed = visibility.changed() => {
                        if changed.is_err() {
                            // Visibility source dropped; tear down.
                            break;
                        }
                        let current = visibility.borrow_and_update().clone();
                        flush(&publisher, &kinds, tracker.push(current)).await;
                    }
                }
            }

            // 3. Retract whatever is still requested.
            let retraction = tracker.drain();
            if !retraction.is_empty() {
                info!(peers = retraction.len(), "retracting consumption requests");
                flush(&publisher, &kinds, retraction).await;
            }
        });
        Self {
            cancel: token,
            join,
        }
    }

    /// Stop the pipeline and wait until its retraction writes are flushed.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

async fn flush(publisher: &ConsumerRequestPublisher, kinds: &[MediaKind], commands: ConsumptionDelta) {
    if commands.is_empty() {
        return;
    }
    for kind in kinds {
        publisher.publish(*kind, &commands).await;
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
