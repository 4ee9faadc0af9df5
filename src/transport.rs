// src/transport.rs
//
// The seam between NearCast coordination and the SFU client library.
//
// NearCast never negotiates transports itself: the embedding layer hands in
// an already-connected `ProducerTransport`, and the producer lifecycle
// manager drives it through the narrow surface below. Everything here is
// object-safe so the coordination layer can hold `Arc<dyn ProducerTransport>`
// without caring which SFU client sits behind it.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::TransportError;
use crate::media::{LocalTrack, MediaKind, ProducerId};

/// A connected send-side SFU transport.
#[async_trait]
pub trait ProducerTransport: Send + Sync + 'static {
    /// Register `track` as a new outbound producer. One network round-trip;
    /// may be rejected (unsupported kind, negotiation failure).
    async fn produce(&self, track: LocalTrack) -> Result<Arc<dyn ProducerHandle>, TransportError>;
}

/// One live outbound producer on an SFU transport.
///
/// `close` is idempotent at this level too, but the lifecycle manager is the
/// one responsible for calling it exactly once per handle.
#[async_trait]
pub trait ProducerHandle: Send + Sync + 'static {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    /// Whether media is currently withheld at the transport.
    fn is_paused(&self) -> bool;

    /// Swap the outbound track without renegotiating the producer.
    async fn replace_track(&self, track: LocalTrack) -> Result<(), TransportError>;

    async fn pause(&self) -> Result<(), TransportError>;

    async fn resume(&self) -> Result<(), TransportError>;

    async fn close(&self);
}

// ─── Test double ────────────────────────────────────────────────────────────
//
// Shared by the producer/surface unit tests: counts every call so tests can
// assert the once-per-epoch and close-exactly-once disciplines.
