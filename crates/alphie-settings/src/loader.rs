//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`AlphieSettings::default()`]
//! 2. Deep-merge the first settings file that exists:
//!    `<repo>/.alphie/settings.json`, then `~/.alphie/settings.json`
//! 3. Apply `ALPHIE_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{home_dir, AlphieSettings};

/// Candidate settings files for a repository, most specific first.
pub fn settings_paths(repo: &Path) -> Vec<PathBuf> {
    vec![
        repo.join(".alphie").join("settings.json"),
        home_dir().join(".alphie").join("settings.json"),
    ]
}

/// Load settings for a repository with env var overrides.
pub fn load_settings(repo: &Path) -> Result<AlphieSettings> {
    match settings_paths(repo).into_iter().find(|p| p.exists()) {
        Some(path) => load_settings_from_path(&path),
        None => {
            debug!(repo = %repo.display(), "no settings file found, using defaults");
            let mut settings = AlphieSettings::default();
            apply_env_overrides(&mut settings);
            Ok(settings)
        }
    }
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<AlphieSettings> {
    let defaults = serde_json::to_value(AlphieSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: AlphieSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
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

/// Apply environment variable overrides. Invalid values are ignored.
pub fn apply_env_overrides(settings: &mut AlphieSettings) {
    if let Some(v) = read_env_u64("ALPHIE_TASK_TIMEOUT_SECS", 1, 86_400) {
        settings.execution.task_timeout_secs = v;
    }
    if let Some(v) = read_env_u64("ALPHIE_GATE_TIMEOUT_SECS", 1, 86_400) {
        settings.gates.timeout_secs = v;
    }
    if let Some(v) = read_env_u64("ALPHIE_MAX_RETRY_ATTEMPTS", 1, 100) {
        settings.retry.max_attempts = v as u32;
    }
    if let Some(v) = read_env_string("ALPHIE_WORKTREE_BASE") {
        settings.worktree.base_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = read_env_string("ALPHIE_RUNNER_BINARY") {
        settings.runner.binary = v;
    }
    if let Some(v) = read_env_string("ALPHIE_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}
