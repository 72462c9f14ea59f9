//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`EnsembleSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `ENSEMBLE_*` environment overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::EnsembleSettings;

/// `~/.ensemble`, or `/tmp/.ensemble` when `HOME` is unset.
pub fn ensemble_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".ensemble")
}

/// Default settings file (`~/.ensemble/settings.json`).
pub fn settings_path() -> PathBuf {
    ensemble_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<EnsembleSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<EnsembleSettings> {
    let defaults = serde_json::to_value(EnsembleSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: EnsembleSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced, and nulls in
/// `source` leave the target untouched.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `ENSEMBLE_*` process environment overrides.
pub fn apply_env_overrides(settings: &mut EnsembleSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`. Invalid values are ignored with a
/// warning and the file/default value stays in place.
pub fn apply_overrides<F>(settings: &mut EnsembleSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = read_u64(&lookup, "ENSEMBLE_MAX_ROUNDS", 1, 10_000) {
        settings.orchestrator.max_rounds = v as u32;
    }
    if let Some(v) = read_u64(&lookup, "ENSEMBLE_TOOL_CONCURRENCY", 1, 1_024) {
        settings.dispatcher.max_concurrency = v as usize;
    }
    if let Some(v) = read_u64(&lookup, "ENSEMBLE_TOOL_TIMEOUT_MS", 100, 3_600_000) {
        settings.dispatcher.tool_timeout_ms = v;
    }
    if let Some(v) = read_string(&lookup, "ENSEMBLE_DB_PATH") {
        settings.store.db_path = v;
    }
    if let Some(v) = read_string(&lookup, "ENSEMBLE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_bool(&lookup, "ENSEMBLE_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Reject settings the engine cannot run with.
pub fn validate(settings: &EnsembleSettings) -> Result<()> {
    if settings.orchestrator.max_rounds == 0 {
        return Err(SettingsError::InvalidValue(
            "orchestrator.maxRounds must be at least 1".into(),
        ));
    }
    if settings.orchestrator.stream_buffer == 0 {
        return Err(SettingsError::InvalidValue(
            "orchestrator.streamBuffer must be at least 1".into(),
        ));
    }
    if settings.dispatcher.max_concurrency == 0 {
        return Err(SettingsError::InvalidValue(
            "dispatcher.maxConcurrency must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Resolve the configured database path. Relative paths land under `~/.ensemble`.
pub fn resolve_db_path(settings: &EnsembleSettings) -> PathBuf {
    let raw = Path::new(&settings.store.db_path);
    if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        ensemble_home().join(raw)
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env readers ─────────────────────────────────────────────────────────────

fn read_string<F: Fn(&str) -> Option<String>>(lookup: &F, name: &str) -> Option<String> {
    lookup(name).filter(|v| !v.is_empty())
}

fn read_bool<F: Fn(&str) -> Option<String>>(lookup: &F, name: &str) -> Option<bool> {
    let val = lookup(name)?;
    let result = parse_bool(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_u64<F: Fn(&str) -> Option<String>>(lookup: &F, name: &str, min: u64, max: u64) -> Option<u64> {
    let val = lookup(name)?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid integer env var, ignoring");
    }
    result
}
