//! Listener settings.

use serde::{Deserialize, Serialize};

/// Network and acceptor settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Origins allowed to open a session. Empty disables the check.
    pub allowed_origins: Vec<String>,
    /// Upper bound on the whole shutdown sequence in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Time a client gets to send complete HTTP request headers, in milliseconds.
    pub read_header_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8083,
            allowed_origins: Vec::new(),
            shutdown_timeout_ms: 5_000,
            read_header_timeout_ms: 5_000,
        }
    }
}

impl ServerSettings {
    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
