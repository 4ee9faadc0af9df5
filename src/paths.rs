use crate::media::{MediaKind, MediaPathId, PeerId, ProducerId, SessionId, SpaceId, UserId};

// ---------------------------------------------------------------------------
// Signaling key derivation
//
// All coordination state lives in a realtime key-value channel addressed by
// slash-delimited keys. A session only ever writes keys suffixed with its
// own session id (single-writer per suffix), so every key a session touches
// is derived here, from one immutable SessionPaths value.
// ---------------------------------------------------------------------------

const PRODUCING_PEERS: &str = "producingPeers";
const USER_COMMUNICATION: &str = "userCommunication";
const CLIENT_PRODUCER_PAUSED: &str = "clientProducerPaused";
const PEERS_TO_CONSUME: &str = "peersToConsume";
const SHARING_SCREEN: &str = "sharingScreen";
const PRESENCE: &str = "presence";

/// The signaling identity of one authenticated peer-session.
///
/// Created when a session authenticates; discarded on disconnect or
/// re-auth. Everything here is derived deterministically, so two components
/// holding the same `SessionPaths` always agree on key layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub user_id: UserId,
    pub session_id: SessionId,
}

impl SessionPaths {
    pub fn new(user_id: UserId, session_id: SessionId) -> Self {
        Self {
            user_id,
            session_id,
        }
    }

    /// `producingPeers/{space}/{kind}/{session}` — this session's outbound
    /// producer presence for one kind.
    pub fn producing_peers_key(&self, space: &SpaceId, kind: MediaKind) -> String {
        format!(
            "{PRODUCING_PEERS}/{space}/{}/{}",
            kind.as_str(),
            self.session_id
        )
    }

    /// `userCommunication/{user}/{session}` — the root of this session's
    /// private signaling namespace.
    pub fn user_communication_prefix(&self) -> String {
        format!("{USER_COMMUNICATION}/{}/{}", self.user_id, self.session_id)
    }

    /// `…/clientProducerPaused/{producer}` — per-producer paused notice,
    /// consumed by peers deciding whether to expect media.
    pub fn producer_paused_key(&self, producer: &ProducerId) -> String {
        format!(
            "{}/{CLIENT_PRODUCER_PAUSED}/{producer}",
            self.user_communication_prefix()
        )
    }

    /// `…/peersToConsume/{kind}` — the merge target for consumption deltas
    /// of one kind.
    pub fn consume_prefix(&self, kind: MediaKind) -> String {
        format!(
            "{}/{PEERS_TO_CONSUME}/{}",
            self.user_communication_prefix(),
            kind.as_str()
        )
    }

    /// `…/peersToConsume/{kind}/{peer}` — one consumption-request leaf.
    pub fn consume_key(&self, kind: MediaKind, peer: &PeerId) -> String {
        format!("{}/{peer}", self.consume_prefix(kind))
    }

    /// `sharingScreen/{space}/{mediaPath}/{user}/{session}` — this
    /// session's screen-share claim for one media surface.
    pub fn sharing_screen_key(&self, space: &SpaceId, media_path: &MediaPathId) -> String {
        format!(
            "{}/{}/{}",
            sharing_screen_prefix(space, media_path),
            self.user_id,
            self.session_id
        )
    }

    /// `presence/{space}/{session}` — this session's liveness record.
    pub fn presence_key(&self, space: &SpaceId) -> String {
        format!("{PRESENCE}/{space}/{}", self.session_id)
    }
}

/// `sharingScreen/{space}/{mediaPath}` — the claim subtree the arbitrator
/// watches. Not session-scoped: every observer reads the same prefix.
pub fn sharing_screen_prefix(space: &SpaceId, media_path: &MediaPathId) -> String {
    format!("{SHARING_SCREEN}/{space}/{media_path}")
}

/// `producingPeers/{space}/{kind}` — the producer-presence subtree readers
/// watch for one kind.
pub fn producing_peers_prefix(space: &SpaceId, kind: MediaKind) -> String {
    format!("{PRODUCING_PEERS}/{space}/{}", kind.as_str())
}

/// `presence/{space}` — the subtree the active-session watcher reads.
pub fn presence_prefix(space: &SpaceId) -> String {
    format!("{PRESENCE}/{space}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
