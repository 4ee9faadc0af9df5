use std::time::Duration;
use tracing::info;

// ---------------------------------------------------------------------------
// Coordination-layer configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Tunables for the coordination layer.
///
/// Every field can be set via an environment variable prefixed with
/// `NEARCAST_`. Defaults are suitable for development and for most
/// deployments; the visibility poll cadence is the one knob operators
/// commonly adjust (denser spaces poll slower).
#[derive(Debug, Clone)]
pub struct CoordConfig {
    /// How often the proximity/visibility filter is re-evaluated into a
    /// fresh visibility set. Drives consumption-delta cadence.
    pub visibility_poll: Duration,

    /// Capacity of the lifecycle event bus (broadcast). Subscribers that
    /// lag further than this skip events.
    pub event_bus_capacity: usize,

    /// Signaling writes slower than this are logged at warn level.
    pub signal_write_warn: Duration,

    /// Default `tracing` filter, for hosts that take their log level from
    /// this config rather than `RUST_LOG`.
    pub log_level: String,
}

impl CoordConfig {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        // Best-effort .env loading — ignore errors.
        let _ = dotenvy::dotenv();

        let visibility_poll_ms = env_or("NEARCAST_VISIBILITY_POLL_MS", "250")
            .parse::<u64>()
            .unwrap_or(250);
        let event_bus_capacity = env_or("NEARCAST_EVENT_BUS_CAPACITY", "256")
            .parse::<usize>()
            .unwrap_or(256);
        let signal_write_warn_ms = env_or("NEARCAST_SIGNAL_WRITE_WARN_MS", "500")
            .parse::<u64>()
            .unwrap_or(500);
        let log_level = env_or("NEARCAST_LOG_LEVEL", "info");

        let config = CoordConfig {
            visibility_poll: Duration::from_millis(visibility_poll_ms),
            event_bus_capacity,
            signal_write_warn: Duration::from_millis(signal_write_warn_ms),
            log_level,
        };

        config.log_summary();
        config
    }

    fn log_summary(&self) {
        info!("──── NearCast configuration ────");
        info!(
            "  visibility_poll    : {}ms",
            self.visibility_poll.as_millis()
        );
        info!("  event_bus_capacity : {}", self.event_bus_capacity);
        info!(
            "  signal_write_warn  : {}ms",
            self.signal_write_warn.as_millis()
        );
        info!("  log_level          : {}", self.log_level);
        info!("────────────────────────────────");
    }
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            visibility_poll: Duration::from_millis(250),
            event_bus_capacity: 256,
            signal_write_warn: Duration::from_millis(500),
            log_level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
