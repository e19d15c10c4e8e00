//! Settings types.
//!
//! Every struct is `#[serde(default)]`, so a partial JSON file only needs the
//! keys it overrides.

mod limits;
mod server;

pub use limits::{LimitSettings, LoggingSettings};
pub use server::ServerSettings;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Listener and acceptor settings.
    pub server: ServerSettings,
    /// Per-session size and time limits.
    pub limits: LimitSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl GatewaySettings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let l = &self.limits;
        let non_zero = [
            ("maxMessageBytes", l.max_message_bytes as u64),
            ("pingIntervalMs", l.ping_interval_ms),
            ("pongWaitMs", l.pong_wait_ms),
            ("writeTimeoutMs", l.write_timeout_ms),
            ("closeGraceMs", l.close_grace_ms),
            ("shutdownTimeoutMs", self.server.shutdown_timeout_ms),
            ("readHeaderTimeoutMs", self.server.read_header_timeout_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!("{name} must be greater than zero")));
            }
        }
        // Liveness is measured from the last pong, so a wait no longer than the
        // ping cadence would expire for an idle peer before the next probe.
        if l.pong_wait_ms <= l.ping_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "pongWaitMs ({}) must exceed pingIntervalMs ({})",
                l.pong_wait_ms, l.ping_interval_ms
            )));
        }
        if self.server.host.trim().is_empty() {
            return Err(SettingsError::InvalidValue("host must not be empty".into()));
        }
        Ok(())
    }
}
