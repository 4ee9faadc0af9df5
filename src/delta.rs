// src/delta.rs
//
// Consumption delta engine.
//
// Proximity logic elsewhere decides *which* peers should currently be heard
// or seen; this module only turns successive versions of that set into the
// minimal start/stop command set. It is deliberately pure -- no I/O, no
// failure modes -- so the reconstruction property (replaying all deltas
// rebuilds the latest set exactly) can be tested in isolation.

use std::collections::{BTreeMap, HashSet};

use crate::media::PeerId;

/// The peers that should currently be consumed, for one media kind.
pub type VisibilitySet = HashSet<PeerId>;

/// Start (`true`) / stop (`false`) commands, one per peer whose state
/// changed. Ordered map so downstream writes and logs are deterministic.
pub type ConsumptionDelta = BTreeMap<PeerId, bool>;

/// Diff two visibility sets into a command set.
///
/// `delta(s, s)` is empty for every `s`.
pub fn delta(previous: &VisibilitySet, current: &VisibilitySet) -> ConsumptionDelta {
    let mut commands = ConsumptionDelta::new();
    for added in current.difference(previous) {
        commands.insert(added.clone(), true);
    }
    for removed in previous.difference(current) {
        commands.insert(removed.clone(), false);
    }
    commands
}

/// Streaming wrapper around [`delta`]: remembers the last set it accepted
/// and always diffs against that, never against command history. Seeded
/// with the empty set, so the first accepted set emits all-`true`.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    previous: VisibilitySet,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the next visibility set and return the commands that move a
    /// consumer from the previous set to it.
    pub fn push(&mut self, current: VisibilitySet) -> ConsumptionDelta {
        let commands = delta(&self.previous, &current);
        self.previous = current;
        commands
    }

    /// Retract everything: a `false` command for every peer still in the
    /// tracked set. Used on teardown so no consumption request outlives its
    /// owner.
    pub fn drain(&mut self) -> ConsumptionDelta {
        self.previous.drain().map(|peer| (peer, false)).collect()
    }

    /// The last set accepted by `push`.
    pub fn current(&self) -> &VisibilitySet {
        &self.previous
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
