//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`GatewaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `RTG_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::GatewaySettings;

/// Settings file used when `RTG_CONFIG` is not set.
const DEFAULT_SETTINGS_FILE: &str = "rtgateway.json";

/// Resolve the settings file path (`RTG_CONFIG`, else `./rtgateway.json`).
pub fn settings_path() -> PathBuf {
    read_env_string("RTG_CONFIG").map_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE), PathBuf::from)
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<GatewaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error. The result is validated.
pub fn load_settings_from_path(path: &Path) -> Result<GatewaySettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
fn load_file_layer(path: &Path) -> Result<GatewaySettings> {
    let defaults = serde_json::to_value(GatewaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `RTG_*` environment variables to `settings`.
pub fn apply_env_overrides(settings: &mut GatewaySettings) {
    apply_overrides(settings, |key| std::env::var(key).ok());
}

/// Apply overrides from an arbitrary key lookup.
///
/// Empty values are treated as unset. Unparseable or out-of-range values are
/// logged and ignored.
pub fn apply_overrides<F>(settings: &mut GatewaySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    // ── Server settings ─────────────────────────────────────────────
    if let Some(v) = get("RTG_ADDR") {
        match parse_addr(&v) {
            Some((host, port)) => {
                if let Some(host) = host {
                    settings.server.host = host;
                }
                settings.server.port = port;
            }
            None => warn!(key = "RTG_ADDR", value = %v, "invalid address env var, ignoring"),
        }
    }
    if let Some(v) = get("RTG_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = checked("RTG_PORT", get("RTG_PORT"), |s| parse_u16_range(s, 1, 65535)) {
        settings.server.port = v;
    }
    if let Some(v) = get("RTG_ALLOWED_ORIGINS") {
        settings.server.allowed_origins = parse_list(&v);
    }
    if let Some(v) = checked("RTG_SHUTDOWN_TIMEOUT_MS", get("RTG_SHUTDOWN_TIMEOUT_MS"), |s| {
        parse_u64_range(s, 1, 600_000)
    }) {
        settings.server.shutdown_timeout_ms = v;
    }
    if let Some(v) = checked("RTG_READ_HEADER_TIMEOUT_MS", get("RTG_READ_HEADER_TIMEOUT_MS"), |s| {
        parse_u64_range(s, 1, 600_000)
    }) {
        settings.server.read_header_timeout_ms = v;
    }

    // ── Limit settings ──────────────────────────────────────────────
    if let Some(v) = checked("RTG_MAX_MESSAGE_BYTES", get("RTG_MAX_MESSAGE_BYTES"), |s| {
        parse_usize_range(s, 1, 1_073_741_824)
    }) {
        settings.limits.max_message_bytes = v;
    }
    if let Some(v) = checked("RTG_PING_INTERVAL_MS", get("RTG_PING_INTERVAL_MS"), |s| {
        parse_u64_range(s, 1, 3_600_000)
    }) {
        settings.limits.ping_interval_ms = v;
    }
    if let Some(v) = checked("RTG_PONG_WAIT_MS", get("RTG_PONG_WAIT_MS"), |s| {
        parse_u64_range(s, 1, 3_600_000)
    }) {
        settings.limits.pong_wait_ms = v;
    }
    if let Some(v) = checked("RTG_WRITE_TIMEOUT_MS", get("RTG_WRITE_TIMEOUT_MS"), |s| {
        parse_u64_range(s, 1, 600_000)
    }) {
        settings.limits.write_timeout_ms = v;
    }
    if let Some(v) = checked("RTG_CLOSE_GRACE_MS", get("RTG_CLOSE_GRACE_MS"), |s| {
        parse_u64_range(s, 1, 600_000)
    }) {
        settings.limits.close_grace_ms = v;
    }

    // ── Logging settings ────────────────────────────────────────────
    if let Some(v) = get("RTG_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = get("RTG_LOG_FORMAT") {
        match v.parse() {
            Ok(format) => settings.logging.format = format,
            Err(e) => warn!(key = "RTG_LOG_FORMAT", value = %v, error = %e, "invalid log format env var, ignoring"),
        }
    }
}

fn checked<T>(key: &str, raw: Option<String>, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = raw?;
    let result = parse(raw.trim());
    if result.is_none() {
        warn!(key, value = %raw, "invalid numeric env var, ignoring");
    }
    result
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a listen address of the form `:port` or `host:port`.
///
/// Returns `None` for the host when only a port is given.
pub fn parse_addr(val: &str) -> Option<(Option<String>, u16)> {
    let (host, port) = val.trim().rsplit_once(':')?;
    let port = parse_u16_range(port, 1, 65535)?;
    let host = (!host.is_empty()).then(|| host.to_string());
    Some((host, port))
}

/// Split a comma-separated list, dropping empty entries.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use rtg_logging::LogFormat;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_simple_override() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": 10});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 10);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8083, "host": "0.0.0.0"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_skips_null() {
        let target = serde_json::json!({"a": 1});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_replaces_arrays() {
        let target = serde_json::json!({"origins": ["a", "b"]});
        let source = serde_json::json!({"origins": ["c"]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["origins"], serde_json::json!(["c"]));
    }

    // ── file loading ────────────────────────────────────────────────

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_file_layer(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, GatewaySettings::default());
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"server":{{"port":9100,"allowedOrigins":["https://app.example"]}},"limits":{{"closeGraceMs":750}}}}"#
        )
        .unwrap();
        let settings = load_file_layer(file.path()).unwrap();
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.allowed_origins, vec!["https://app.example"]);
        assert_eq!(settings.limits.close_grace_ms, 750);
        assert_eq!(settings.limits.write_timeout_ms, 5_000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        let err = load_file_layer(file.path()).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    #[test]
    fn invalid_file_values_fail_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"limits":{{"pingIntervalMs":90000}}}}"#).unwrap();
        let err = load_settings_from_path(file.path()).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue(_)));
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn addr_override_port_only() {
        let mut settings = GatewaySettings::default();
        apply_overrides(&mut settings, lookup_from(&[("RTG_ADDR", ":9001")]));
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 9001);
    }

    #[test]
    fn addr_override_host_and_port() {
        let mut settings = GatewaySettings::default();
        apply_overrides(&mut settings, lookup_from(&[("RTG_ADDR", "127.0.0.1:7000")]));
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 7000);
    }

    #[test]
    fn invalid_addr_ignored() {
        let mut settings = GatewaySettings::default();
        apply_overrides(&mut settings, lookup_from(&[("RTG_ADDR", "nonsense")]));
        assert_eq!(settings.server, GatewaySettings::default().server);
    }

    #[test]
    fn limit_overrides() {
        let mut settings = GatewaySettings::default();
        apply_overrides(
            &mut settings,
            lookup_from(&[
                ("RTG_MAX_MESSAGE_BYTES", "1024"),
                ("RTG_PING_INTERVAL_MS", "100"),
                ("RTG_PONG_WAIT_MS", "300"),
                ("RTG_WRITE_TIMEOUT_MS", "50"),
                ("RTG_CLOSE_GRACE_MS", "250"),
            ]),
        );
        assert_eq!(settings.limits.max_message_bytes, 1024);
        assert_eq!(settings.limits.ping_interval_ms, 100);
        assert_eq!(settings.limits.pong_wait_ms, 300);
        assert_eq!(settings.limits.write_timeout_ms, 50);
        assert_eq!(settings.limits.close_grace_ms, 250);
    }

    #[test]
    fn out_of_range_override_ignored() {
        let mut settings = GatewaySettings::default();
        apply_overrides(
            &mut settings,
            lookup_from(&[("RTG_WRITE_TIMEOUT_MS", "0"), ("RTG_PORT", "abc")]),
        );
        assert_eq!(settings.limits.write_timeout_ms, 5_000);
        assert_eq!(settings.server.port, 8083);
    }

    #[test]
    fn read_header_timeout_override() {
        let mut settings = GatewaySettings::default();
        apply_overrides(&mut settings, lookup_from(&[("RTG_READ_HEADER_TIMEOUT_MS", "750")]));
        assert_eq!(settings.server.read_header_timeout_ms, 750);

        apply_overrides(&mut settings, lookup_from(&[("RTG_READ_HEADER_TIMEOUT_MS", "0")]));
        assert_eq!(settings.server.read_header_timeout_ms, 750);
    }

    #[test]
    fn empty_override_ignored() {
        let mut settings = GatewaySettings::default();
        apply_overrides(&mut settings, lookup_from(&[("RTG_HOST", "")]));
        assert_eq!(settings.server.host, "0.0.0.0");
    }

    #[test]
    fn origin_and_logging_overrides() {
        let mut settings = GatewaySettings::default();
        apply_overrides(
            &mut settings,
            lookup_from(&[
                ("RTG_ALLOWED_ORIGINS", "https://a.example, https://b.example,,"),
                ("RTG_LOG_LEVEL", "debug"),
                ("RTG_LOG_FORMAT", "json"),
            ]),
        );
        assert_eq!(
            settings.server.allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn invalid_log_format_ignored() {
        let mut settings = GatewaySettings::default();
        apply_overrides(&mut settings, lookup_from(&[("RTG_LOG_FORMAT", "xml")]));
        assert_eq!(settings.logging.format, LogFormat::Compact);
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_addr_variants() {
        assert_eq!(parse_addr(":8083"), Some((None, 8083)));
        assert_eq!(parse_addr("localhost:80"), Some((Some("localhost".into()), 80)));
        assert_eq!(parse_addr("[::1]:8080"), Some((Some("[::1]".into()), 8080)));
        assert_eq!(parse_addr("8083"), None);
        assert_eq!(parse_addr(":0"), None);
        assert_eq!(parse_addr(":70000"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("80", 1, 65535), Some(80));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range("5000", 1, 10_000), Some(5000));
        assert_eq!(parse_u64_range("-1", 1, 10_000), None);
        assert_eq!(parse_usize_range("65536", 1, 1 << 30), Some(65536));
    }

    #[test]
    fn parse_list_trims() {
        assert_eq!(parse_list(" a , b ,"), vec!["a", "b"]);
        assert!(parse_list(",,").is_empty());
    }
}
