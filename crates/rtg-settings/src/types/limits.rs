//! Session limit and logging settings.

use rtg_logging::LogFormat;
use serde::{Deserialize, Serialize};

/// Per-session limits. Durations are in milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitSettings {
    /// Largest inbound message accepted, in bytes.
    pub max_message_bytes: usize,
    /// Heartbeat ping cadence.
    pub ping_interval_ms: u64,
    /// Silence tolerated after the last liveness signal.
    pub pong_wait_ms: u64,
    /// Deadline for a single outbound write.
    pub write_timeout_ms: u64,
    /// How long shutdown waits for draining sessions.
    pub close_grace_ms: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_message_bytes: 64 * 1024,
            ping_interval_ms: 25_000,
            pong_wait_ms: 60_000,
            write_timeout_ms: 5_000,
            close_grace_ms: 2_000,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Level or `EnvFilter` directive string.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
