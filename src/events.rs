// src/events.rs
//
// Central event bus for NearCast.
//
// Coordination milestones (producer lifecycle, first successful send,
// capture failures, screen-share elections) are represented as
// `NearCastEvent`s.  A single `EventBus` backed by a
// `tokio::sync::broadcast` channel fans each event out to every consumer:
// monitoring hooks in the embedding layer, diagnostic loggers, tests.
//
// Events are observational. Nothing in the coordination layer reads its own
// events back to make decisions; correctness lives in the signaling channel
// and the component state machines.
//
// ────────────────────────────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::media::MediaKind;

// ─── Event types ────────────────────────────────────────────────────────────

/// Canonical event type string, used in JSON payloads and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "producer.created")]
    ProducerCreated,
    #[serde(rename = "producer.closed")]
    ProducerClosed,
    #[serde(rename = "producer.failed")]
    ProducerFailed,
    #[serde(rename = "producer.first_active")]
    ProducerFirstActive,
    #[serde(rename = "capture.failed")]
    CaptureFailed,
    #[serde(rename = "sharer.elected")]
    SharerElected,
    #[serde(rename = "share.claimed")]
    ShareClaimed,
    #[serde(rename = "share.released")]
    ShareReleased,
}

impl EventType {
    /// Stable string representation used in log fields and filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProducerCreated => "producer.created",
            Self::ProducerClosed => "producer.closed",
            Self::ProducerFailed => "producer.failed",
            Self::ProducerFirstActive => "producer.first_active",
            Self::CaptureFailed => "capture.failed",
            Self::SharerElected => "sharer.elected",
            Self::ShareClaimed => "share.claimed",
            Self::ShareReleased => "share.released",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Event payloads ─────────────────────────────────────────────────────────

/// Metadata attached to producer lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerPayload {
    pub session_id: String,
    pub kind: MediaKind,
    pub producer_id: String,
}

/// Metadata attached to capture and produce failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePayload {
    pub session_id: String,
    pub kind: MediaKind,
    pub reason: String,
}

/// Metadata attached to screen-share events. `session_id` is the elected
/// sharer for `sharer.elected` (absent when nobody shares) and the local
/// session for claim/release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharePayload {
    pub space_id: String,
    pub media_path: String,
    pub session_id: Option<String>,
}

/// Type-safe union of all possible payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Producer(ProducerPayload),
    Failure(FailurePayload),
    Share(SharePayload),
}

// ─── The event envelope ─────────────────────────────────────────────────────

/// A fully self-describing event, ready for serialisation.
///
/// ```json
/// {
///   "id":         "evt_a1b2c3d4",
///   "type":       "producer.first_active",
///   "created_at": "2026-03-02T14:22:33.123Z",
///   "data": {
///     "session_id":  "...",
///     "kind":        "webcamVideo",
///     "producer_id": "..."
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearCastEvent {
    /// Globally unique event identifier (format: `evt_<uuid-v4>`).
    pub id: String,

    /// Event type.
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// ISO-8601 timestamp (UTC).
    pub created_at: DateTime<Utc>,

    /// Type-specific payload.
    pub data: EventPayload,
}

impl NearCastEvent {
    // ── Constructors ────────────────────────────────────────────────────

    pub fn producer_created(session_id: &str, kind: MediaKind, producer_id: &str) -> Self {
        Self::new(
            EventType::ProducerCreated,
            EventPayload::Producer(ProducerPayload {
                session_id: session_id.to_string(),
                kind,
                producer_id: producer_id.to_string(),
            }),
        )
    }

    pub fn producer_closed(session_id: &str, kind: MediaKind, producer_id: &str) -> Self {
        Self::new(
            EventType::ProducerClosed,
            EventPayload::Producer(ProducerPayload {
                session_id: session_id.to_string(),
                kind,
                producer_id: producer_id.to_string(),
            }),
        )
    }

    /// First transition of a producer to the unpaused state. External layers
    /// latch onto this for "media actually flowed once" monitoring.
    pub fn producer_first_active(session_id: &str, kind: MediaKind, producer_id: &str) -> Self {
        Self::new(
            EventType::ProducerFirstActive,
            EventPayload::Producer(ProducerPayload {
                session_id: session_id.to_string(),
                kind,
                producer_id: producer_id.to_string(),
            }),
        )
    }

    /// The SFU rejected or failed a `produce()` call; the next track change
    /// retries.
    pub fn producer_failed(session_id: &str, kind: MediaKind, reason: &str) -> Self {
        Self::new(
            EventType::ProducerFailed,
            EventPayload::Failure(FailurePayload {
                session_id: session_id.to_string(),
                kind,
                reason: reason.to_string(),
            }),
        )
    }

    pub fn capture_failed(session_id: &str, kind: MediaKind, reason: &str) -> Self {
        Self::new(
            EventType::CaptureFailed,
            EventPayload::Failure(FailurePayload {
                session_id: session_id.to_string(),
                kind,
                reason: reason.to_string(),
            }),
        )
    }

    pub fn sharer_elected(space_id: &str, media_path: &str, session_id: Option<&str>) -> Self {
        Self::new(
            EventType::SharerElected,
            EventPayload::Share(SharePayload {
                space_id: space_id.to_string(),
                media_path: media_path.to_string(),
                session_id: session_id.map(str::to_string),
            }),
        )
    }

    pub fn share_claimed(space_id: &str, media_path: &str, session_id: &str) -> Self {
        Self::new(
            EventType::ShareClaimed,
            EventPayload::Share(SharePayload {
                space_id: space_id.to_string(),
                media_path: media_path.to_string(),
                session_id: Some(session_id.to_string()),
            }),
        )
    }

    pub fn share_released(space_id: &str, media_path: &str, session_id: &str) -> Self {
        Self::new(
            EventType::ShareReleased,
            EventPayload::Share(SharePayload {
                space_id: space_id.to_string(),
                media_path: media_path.to_string(),
                session_id: Some(session_id.to_string()),
            }),
        )
    }

    // ── Private ─────────────────────────────────────────────────────────

    fn new(event_type: EventType, data: EventPayload) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            event_type,
            created_at: Utc::now(),
            data,
        }
    }

    /// Extract the session this event concerns, if any.
    pub fn session_id(&self) -> Option<&str> {
        match &self.data {
            EventPayload::Producer(p) => Some(&p.session_id),
            EventPayload::Failure(p) => Some(&p.session_id),
            EventPayload::Share(p) => p.session_id.as_deref(),
        }
    }
}

// ─── EventBus ───────────────────────────────────────────────────────────────

/// Broadcast-based fan-out channel for `NearCastEvent`.
///
/// Subscribers that lag more than the configured capacity will skip events
/// (same semantic as `broadcast::RecvError::Lagged`) -- acceptable because
/// the bus carries monitoring signals, never coordination state.
///
/// The bus is **cheap to clone** (interior `Arc`).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NearCastEvent>,
}

impl EventBus {
    /// Create a new bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create a new bus with a custom capacity.
    pub fn with_capacity(cap: usize) -> Self {
        let (tx, _) = broadcast::channel(cap);
        Self { tx }
    }

    /// Publish an event.  Returns the number of active subscribers that will
    /// receive it.  Silently succeeds even if there are no subscribers.
    pub fn emit(&self, event: NearCastEvent) -> usize {
        debug!(event_type = %event.event_type, event_id = %event.id, "event emitted");
        // broadcast::send returns Err only if there are 0 receivers, which is
        // perfectly normal when no monitoring hook is attached.
        self.tx.send(event).unwrap_or(0)
    }

    /// Obtain a new receiver.  Each receiver gets an independent copy of every
    /// event published *after* this call.
    pub fn subscribe(&self) -> broadcast::Receiver<NearCastEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
