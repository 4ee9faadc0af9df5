// src/visibility.rs
//
// Visibility sampling harness.
//
// Which peers should be heard/seen is a geometry question answered outside
// this crate (distances, rooms, occlusion). This module hosts that external
// filter: it polls a probe closure at the configured cadence (default
// 250 ms) and publishes the result as a change-deduplicated watch stream,
// which is exactly the input shape the consumption pipeline wants.
//
// Polling rather than push keeps the geometry layer dumb: it only has to
// answer "who is visible right now", never to detect its own transitions.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::delta::VisibilitySet;

/// Poll `probe` every `poll` and expose the latest set. The stream only
/// updates when the set actually changes, so downstream stages wake at
/// change rate, not at poll rate.
///
/// The first sample is taken immediately.
pub fn spawn_visibility_sampler<F>(
    mut probe: F,
    poll: Duration,
    cancel: CancellationToken,
) -> (watch::Receiver<VisibilitySet>, JoinHandle<()>)
where
    F: FnMut() -> VisibilitySet + Send + 'static,
{
    let (tx, rx) = watch::channel(VisibilitySet::new());
    let join = tokio::spawn(async move {
        let mut ticker = interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("visibility sampler cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    let current = probe();
                    tx.send_if_modified(|previous| {
                        if *previous == current {
                            false
                        } else {
                            debug!(peers = current.len(), "visibility set changed");
                            *previous = current;
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
