//! # rtg-settings
//!
//! Configuration for the gateway process.
//!
//! - Compiled defaults ([`GatewaySettings::default`])
//! - Optional JSON file, deep-merged over the defaults
//! - `RTG_*` environment variable overrides (highest priority)
//! - [`GatewaySettings::validate`] before the values reach the server

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, settings_path};
pub use types::{GatewaySettings, LimitSettings, LoggingSettings, ServerSettings};
