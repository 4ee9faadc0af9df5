use thiserror::Error;

use crate::media::MediaKind;

// ---------------------------------------------------------------------------
// Error taxonomy
//
// Every error in this crate is recoverable and local: the worst case is
// "this peer's media does not flow", never a crash. Components catch at the
// fire-and-forget edges (paused publication, consumption writes) and
// propagate with `?` everywhere else.
// ---------------------------------------------------------------------------

/// Failures raised by the realtime signaling channel.
#[derive(Debug, Error)]
pub enum SignalError {
    /// The channel is shut down; no further writes will be accepted.
    #[error("signaling channel closed")]
    Closed,

    /// A leaf value could not be encoded or decoded.
    #[error("signaling value serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific transient failure. The channel's own reconnection
    /// and resync are relied upon; this layer does not retry.
    #[error("signaling backend: {0}")]
    Backend(String),
}

/// Failures raised by the SFU producer transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport cannot produce this media kind at all.
    #[error("media kind {0} not supported by transport")]
    UnsupportedKind(MediaKind),

    /// The SFU rejected the produce/replace negotiation.
    #[error("transport rejected {kind}: {reason}")]
    Rejected { kind: MediaKind, reason: String },

    /// The producer or its transport has already been closed.
    #[error("producer closed")]
    ProducerClosed,
}

/// Failures acquiring a local device track.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("permission denied by user or platform")]
    PermissionDenied,

    #[error("no suitable capture device")]
    NoDevice,

    /// The user dismissed the capture picker / cancelled mid-acquisition.
    #[error("capture aborted")]
    Aborted,

    #[error("capture backend: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_kind() {
        let e = TransportError::UnsupportedKind(MediaKind::ScreenAudio);
        assert!(e.to_string().contains("screenAudio"));

        let e = TransportError::Rejected {
            kind: MediaKind::WebcamVideo,
            reason: "no negotiated codec".into(),
        };
        assert!(e.to_string().contains("webcamVideo"));
        assert!(e.to_string().contains("no negotiated codec"));
    }

    #[test]
    fn signal_error_wraps_serde() {
        let bad: Result<u32, _> = serde_json::from_str("not json");
        let err: SignalError = bad.unwrap_err().into();
        assert!(matches!(err, SignalError::Serialization(_)));
    }
}
