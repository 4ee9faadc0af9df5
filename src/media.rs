use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// MediaKind — the four coordinated media kinds
// ---------------------------------------------------------------------------

/// Identifies both a producer type and its signaling sub-path.
///
/// The wire names (`webcamAudio`, …) are the literal path segments used in
/// the signaling channel, so the serde renames here are part of the wire
/// contract, not cosmetics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MediaKind {
    WebcamAudio,
    WebcamVideo,
    ScreenAudio,
    ScreenVideo,
}

impl MediaKind {
    /// Every kind, in a stable order. Useful for spawning one producer
    /// manager per kind.
    pub const ALL: [MediaKind; 4] = [
        MediaKind::WebcamAudio,
        MediaKind::WebcamVideo,
        MediaKind::ScreenAudio,
        MediaKind::ScreenVideo,
    ];

    /// Stable string form, identical to the signaling path segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebcamAudio => "webcamAudio",
            Self::WebcamVideo => "webcamVideo",
            Self::ScreenAudio => "screenAudio",
            Self::ScreenVideo => "screenVideo",
        }
    }

    pub fn is_screen(&self) -> bool {
        matches!(self, Self::ScreenAudio | Self::ScreenVideo)
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Self::WebcamAudio | Self::ScreenAudio)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Identifier newtypes
// ---------------------------------------------------------------------------

/// Declares a strongly typed identifier wrapping an `Arc<str>` for cheap
/// cloning across tasks.
macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s.into())
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.into())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                String::deserialize(d).map(Into::into)
            }
        }
    };
}

id_type!(
    /// A user account. One user may hold several concurrent sessions
    /// (browser tabs, devices).
    UserId
);
id_type!(
    /// One authenticated connection of a user. All session-scoped signaling
    /// keys are suffixed with this id.
    SessionId
);
id_type!(
    /// A remote participant whose media may be consumed. In practice this is
    /// the remote session's id, but the delta/publisher layer does not care.
    PeerId
);
id_type!(
    /// A shared virtual space (room).
    SpaceId
);
id_type!(
    /// A logical on-screen surface inside a space to which a screen-share
    /// stream is attached.
    MediaPathId
);
id_type!(
    /// An outbound producer registered with the SFU.
    ProducerId
);
id_type!(
    /// A local or remote media track handle.
    TrackId
);

impl From<&SessionId> for PeerId {
    fn from(s: &SessionId) -> Self {
        PeerId::from(s.as_str())
    }
}

// ---------------------------------------------------------------------------
// Track handles
// ---------------------------------------------------------------------------

/// An acquired local device track (microphone, webcam, captured screen).
///
/// Opaque to this crate: the coordination layer only needs identity and
/// kind; the bytes flow through the SFU client library underneath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: TrackId,
    pub kind: MediaKind,
    /// Device label, for logs only.
    pub label: String,
}

impl LocalTrack {
    /// Wrap a freshly acquired device track under a new id.
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        Self {
            id: TrackId::from(format!("trk_{}", uuid::Uuid::new_v4())),
            kind,
            label: label.into(),
        }
    }
}

/// A consumed remote track surfaced by the media layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: TrackId,
    pub kind: MediaKind,
    /// The producing session.
    pub session_id: SessionId,
}

impl RemoteTrack {
    /// Present a locally captured track the way consumed media is presented,
    /// attributed to the capturing session. Used when the local session is
    /// the one sharing and its own surface must render the share.
    pub fn from_local(track: &LocalTrack, session_id: SessionId) -> Self {
        Self {
            id: track.id.clone(),
            kind: track.kind,
            session_id,
        }
    }
}

/// The pair of remote tracks currently exposed for one producing session,
/// as published by the media layer into `consumed media by session`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SurfaceMedia {
    pub video: Option<RemoteTrack>,
    pub audio: Option<RemoteTrack>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
