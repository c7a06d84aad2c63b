//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ProplensSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `PROPLENS_*` environment overrides (highest priority)
//!
//! The settings file is `$PROPLENS_SETTINGS` when set, otherwise
//! `~/.proplens/settings.json`.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::ProplensSettings;

/// Env var naming an alternative settings file.
pub const SETTINGS_PATH_ENV: &str = "PROPLENS_SETTINGS";

/// Resolve the settings file path.
pub fn settings_path() -> PathBuf {
    if let Some(explicit) = read_env_string(SETTINGS_PATH_ENV) {
        return PathBuf::from(explicit);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".proplens").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ProplensSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ProplensSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<ProplensSettings> {
    let defaults = serde_json::to_value(ProplensSettings::default())?;

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
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
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

/// Apply `PROPLENS_*` process environment overrides.
pub fn apply_env_overrides(settings: &mut ProplensSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Integers must parse and fall within range, booleans accept
/// `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`. Anything else is
/// ignored with a warning and the file/default value stays.
pub fn apply_overrides_from<F>(settings: &mut ProplensSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Endpoint ────────────────────────────────────────────────────
    if let Some(v) = env.string("PROPLENS_GRAPHQL_URL") {
        settings.endpoint.graphql_url = v;
    }
    if let Some(v) = env.string("PROPLENS_REALTIME_URL") {
        settings.endpoint.realtime_url = Some(v);
    }

    // ── Transport ───────────────────────────────────────────────────
    if let Some(v) = env.u64("PROPLENS_CONNECT_TIMEOUT_MS", 100, 300_000) {
        settings.transport.connect_timeout_ms = v;
    }
    if let Some(v) = env.u64("PROPLENS_KEEPALIVE_MS", 1000, 3_600_000) {
        settings.transport.default_keepalive_ms = v;
    }

    // ── Monitor ─────────────────────────────────────────────────────
    if let Some(v) = env.u32("PROPLENS_MAX_RETRIES", 0, 100) {
        settings.monitor.max_retries = v;
    }
    if let Some(v) = env.u64("PROPLENS_RETRY_DELAY_MS", 1, 600_000) {
        settings.monitor.retry_delay_ms = v;
    }
    if let Some(v) = env.f64("PROPLENS_BACKOFF_MULTIPLIER", 1.0, 10.0) {
        settings.monitor.reconnect_backoff_multiplier = v;
    }
    if let Some(v) = env.u64("PROPLENS_MAX_RECONNECT_DELAY_MS", 1, 3_600_000) {
        settings.monitor.max_reconnect_delay_ms = v;
    }
    if let Some(v) = env.u64("PROPLENS_SUBSCRIPTION_TIMEOUT_MS", 1000, 86_400_000) {
        settings.monitor.subscription_timeout_ms = v;
    }
    if let Some(v) = env.u64("PROPLENS_TEARDOWN_GRACE_MS", 0, 600_000) {
        settings.monitor.teardown_grace_ms = v;
    }

    // ── RPC ─────────────────────────────────────────────────────────
    if let Some(v) = env.u64("PROPLENS_REQUEST_TIMEOUT_MS", 100, 600_000) {
        settings.rpc.request_timeout_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("PROPLENS_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("PROPLENS_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u32` within an inclusive range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a finite `f64` within an inclusive range.
pub fn parse_f64_range(val: &str, min: f64, max: f64) -> Option<f64> {
    let n: f64 = val.parse().ok()?;
    (n.is_finite() && n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u32(&self, name: &str, min: u32, max: u32) -> Option<u32> {
        self.parsed(name, "u32", |v| parse_u32_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn f64(&self, name: &str, min: f64, max: f64) -> Option<f64> {
        self.parsed(name, "f64", |v| parse_f64_range(v, min, max))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
