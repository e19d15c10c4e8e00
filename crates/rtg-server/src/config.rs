//! Server configuration and per-session limits.

use std::time::Duration;

use rtg_settings::{LimitSettings, ServerSettings};

use crate::errors::ServerError;

/// Size and time limits applied to every session.
///
/// Immutable for the life of the process; each session holds its own copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Hard cap on a single inbound message (and frame) in bytes.
    pub max_message_bytes: usize,
    /// Cadence of heartbeat pings.
    pub ping_interval: Duration,
    /// How long the peer may stay silent before it is declared dead.
    pub pong_wait: Duration,
    /// Deadline for any single outbound write.
    pub write_timeout: Duration,
    /// How long shutdown waits for draining sessions before forcing them.
    pub close_grace: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_message_bytes: 64 * 1024,
            ping_interval: Duration::from_secs(25),
            pong_wait: Duration::from_secs(60),
            write_timeout: Duration::from_secs(5),
            close_grace: Duration::from_secs(2),
        }
    }
}

impl Limits {
    /// Build limits from loaded settings.
    pub fn from_settings(settings: &LimitSettings) -> Self {
        Self {
            max_message_bytes: settings.max_message_bytes,
            ping_interval: Duration::from_millis(settings.ping_interval_ms),
            pong_wait: Duration::from_millis(settings.pong_wait_ms),
            write_timeout: Duration::from_millis(settings.write_timeout_ms),
            close_grace: Duration::from_millis(settings.close_grace_ms),
        }
    }

    /// Reject limits a session cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_message_bytes == 0 {
            return Err(ServerError::InvalidConfig("max_message_bytes must be greater than zero".into()));
        }
        let durations = [
            ("ping_interval", self.ping_interval),
            ("pong_wait", self.pong_wait),
            ("write_timeout", self.write_timeout),
            ("close_grace", self.close_grace),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ServerError::InvalidConfig(format!("{name} must be greater than zero")));
            }
        }
        if self.pong_wait <= self.ping_interval {
            return Err(ServerError::InvalidConfig(format!(
                "pong_wait ({:?}) must exceed ping_interval ({:?})",
                self.pong_wait, self.ping_interval
            )));
        }
        Ok(())
    }
}

/// Listener configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Origins allowed to upgrade. Empty disables the check.
    pub allowed_origins: Vec<String>,
    /// Time a client gets to send complete HTTP request headers.
    pub read_header_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            allowed_origins: Vec::new(),
            read_header_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Build a server config from loaded settings.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            allowed_origins: settings.allowed_origins.clone(),
            read_header_timeout: Duration::from_millis(settings.read_header_timeout_ms),
        }
    }

    /// Reject a listener configuration the server cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.read_header_timeout.is_zero() {
            return Err(ServerError::InvalidConfig(
                "read_header_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Which `Origin` headers may open a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OriginPolicy {
    /// No origin check (development mode).
    AllowAny,
    /// Exact, case-insensitive match against a list of origins.
    AllowList(Vec<String>),
}

impl OriginPolicy {
    /// Build a policy from configured origins. An empty list or a `*` entry
    /// allows everything.
    pub fn from_origins(origins: &[String]) -> Self {
        let normalized: Vec<String> = origins
            .iter()
            .map(|o| normalize_origin(o))
            .filter(|o| !o.is_empty())
            .collect();
        if normalized.is_empty() || normalized.iter().any(|o| o == "*") {
            Self::AllowAny
        } else {
            Self::AllowList(normalized)
        }
    }

    /// Whether the check is disabled.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::AllowAny)
    }

    /// Check the request's `Origin` header.
    ///
    /// Requests without an `Origin` header come from non-browser clients and
    /// are allowed.
    pub fn allows(&self, origin: Option<&str>) -> bool {
        match (self, origin) {
            (Self::AllowAny, _) | (Self::AllowList(_), None) => true,
            (Self::AllowList(list), Some(origin)) => {
                let origin = normalize_origin(origin);
                list.iter().any(|allowed| *allowed == origin)
            }
        }
    }
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}
