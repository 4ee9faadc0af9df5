//! NearCast — media production/consumption coordination for SFU-backed
//! virtual spaces.
//!
//! Participants in a shared space exchange audio, video and screen shares
//! through an SFU. Media must only flow between peers that actually need it
//! (proximity-based hearing/seeing, or an explicit screen share), so every
//! client runs this coordination layer against a shared realtime key-value
//! signaling channel.
//!
//! ## Architecture
//!
//! - **`producer`**: lifecycle of one outbound producer per media kind —
//!   produce at most once per activation epoch, replace tracks in place,
//!   publish deduplicated paused state, close exactly once.
//! - **`delta` / `consume`**: fold "who is visible to me" sets into
//!   incremental consume/stop commands written under this session's
//!   signaling namespace.
//! - **`screen` / `surface`**: claim-based screen-share arbitration (one
//!   sharer per surface, earliest-claim tie-break identical for every
//!   observer) and the capture/consume state machine each client runs per
//!   share surface.
//! - **`signal` / `presence` / `session`**: the signaling-channel seam with
//!   an in-memory reference backend, session liveness rows, and the
//!   per-session context that owns creation and deterministic teardown.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use nearcast::{CoordConfig, MediaKind, MemorySignal, SessionContext, SessionPaths};
//!
//! let signal = Arc::new(MemorySignal::new().connect());
//! let ctx = SessionContext::create(
//!     signal,
//!     SessionPaths::new(user_id, session_id),
//!     space_id,
//!     CoordConfig::from_env(),
//! )
//! .await?;
//!
//! // One producer per outbound kind…
//! let mic = ctx.producer(MediaKind::WebcamAudio, mic_inputs);
//! // …consumption follows the proximity probe…
//! let visibility = ctx.visibility(move || probe.visible_peers());
//! let voice = ctx.consumption(
//!     vec![MediaKind::WebcamAudio, MediaKind::WebcamVideo],
//!     visibility,
//! );
//! // …and each share surface runs its own coordinator.
//! let stage = ctx.surface(media_path, screen_capture, consumed_media).await;
//! ```

pub mod capture;
pub mod config;
pub mod consume;
pub mod delta;
pub mod error;
pub mod events;
pub mod media;
pub mod paths;
pub mod presence;
pub mod producer;
pub mod screen;
pub mod session;
pub mod signal;
pub mod surface;
pub mod transport;
pub mod visibility;

pub use capture::{CaptureController, CaptureSource};
pub use config::CoordConfig;
pub use consume::{ConsumerRequestPublisher, ConsumptionPipeline};
pub use delta::{delta, ConsumptionDelta, DeltaTracker, VisibilitySet};
pub use error::{CaptureError, SignalError, TransportError};
pub use events::{EventBus, EventType, NearCastEvent};
pub use media::{
    LocalTrack, MediaKind, MediaPathId, PeerId, ProducerId, RemoteTrack, SessionId, SpaceId,
    SurfaceMedia, TrackId, UserId,
};
pub use paths::SessionPaths;
pub use presence::ProducingPeer;
pub use producer::{ProducerInputs, ProducerManager, ProducerPhase};
pub use screen::{observe_active_sharer, ScreenShareClaim, ScreenShareClaimGuard};
pub use session::SessionContext;
pub use signal::{MemorySignal, MemorySignalConn, OnDisconnect, SignalChannel, SignalSubscription};
pub use surface::{SurfaceCoordinator, SurfaceDeps, SurfacePhase};
pub use transport::{ProducerHandle, ProducerTransport};
