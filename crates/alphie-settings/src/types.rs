//! Settings type definitions.
//!
//! All types use camelCase JSON field names and `#[serde(default)]`, so a
//! settings file only needs to name the values it changes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use alphie_core::{ModelPricing, Tier};
use serde::{Deserialize, Serialize};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlphieSettings {
    pub execution: ExecutionSettings,
    pub gates: GateSettings,
    pub worktree: WorktreeSettings,
    pub runner: RunnerSettings,
    pub tiers: TierTable,
    pub retry: RetrySettings,
    pub logging: LoggingSettings,
    /// Model id → price row, merged over the built-in table.
    pub pricing: HashMap<String, ModelPricing>,
}

impl AlphieSettings {
    /// Pricing for `model`, preferring configured rows over the built-in table.
    pub fn pricing_for(&self, model: &str) -> Option<ModelPricing> {
        self.pricing
            .get(model)
            .copied()
            .or_else(|| alphie_core::pricing::lookup(model))
    }
}

/// Per-task pipeline timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionSettings {
    pub task_timeout_secs: u64,
    pub startup_timeout_secs: u64,
    pub startup_retries: u32,
    pub retry_backoff_ms: u64,
    pub progress_interval_ms: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            task_timeout_secs: 20 * 60,
            startup_timeout_secs: 45,
            startup_retries: 2,
            retry_backoff_ms: 2_000,
            progress_interval_ms: 2_000,
        }
    }
}

impl ExecutionSettings {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Quality gate selection and command timeout.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GateSettings {
    pub test: bool,
    pub build: bool,
    pub lint: bool,
    pub typecheck: bool,
    pub timeout_secs: u64,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            test: true,
            build: true,
            lint: true,
            typecheck: true,
            timeout_secs: 5 * 60,
        }
    }
}

impl GateSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorktreeSettings {
    /// Parent directory for agent worktrees. `None` means
    /// `$HOME/.cache/alphie/worktrees`.
    pub base_dir: Option<PathBuf>,
}

impl WorktreeSettings {
    pub fn resolved_base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(|| {
            home_dir().join(".cache").join("alphie").join("worktrees")
        })
    }
}

/// How the subprocess runner is launched.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerSettings {
    pub binary: String,
    pub extra_args: Vec<String>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Limits and defaults for one tier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierSettings {
    pub max_iterations: u32,
    pub threshold: u32,
    pub timeout_secs: u64,
    pub default_model: String,
}

impl TierSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Per-tier settings table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TierTable {
    pub scout: TierSettings,
    pub builder: TierSettings,
    pub architect: TierSettings,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            scout: TierSettings {
                max_iterations: 3,
                threshold: 5,
                timeout_secs: 10 * 60,
                default_model: "haiku".to_string(),
            },
            builder: TierSettings {
                max_iterations: 5,
                threshold: 7,
                timeout_secs: 20 * 60,
                default_model: "sonnet".to_string(),
            },
            architect: TierSettings {
                max_iterations: 7,
                threshold: 8,
                timeout_secs: 30 * 60,
                default_model: "opus".to_string(),
            },
        }
    }
}

impl TierTable {
    pub fn get(&self, tier: Tier) -> &TierSettings {
        match tier {
            Tier::Scout => &self.scout,
            Tier::Builder => &self.builder,
            Tier::Architect => &self.architect,
        }
    }

    /// Settings for an optional tier; no tier falls back to scout limits.
    pub fn resolve(&self, tier: Option<Tier>) -> &TierSettings {
        self.get(tier.unwrap_or(Tier::Scout))
    }
}

pub(crate) fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = AlphieSettings::default();
        assert_eq!(s.execution.task_timeout(), Duration::from_secs(1200));
        assert_eq!(s.execution.startup_timeout(), Duration::from_secs(45));
        assert_eq!(s.execution.startup_retries, 2);
        assert_eq!(s.gates.timeout(), Duration::from_secs(300));
        assert_eq!(s.retry.max_attempts, 5);
        assert_eq!(s.runner.binary, "claude");
    }

    #[test]
    fn tier_limits() {
        let t = TierTable::default();
        assert_eq!((t.scout.max_iterations, t.scout.threshold), (3, 5));
        assert_eq!((t.builder.max_iterations, t.builder.threshold), (5, 7));
        assert_eq!((t.architect.max_iterations, t.architect.threshold), (7, 8));
        assert_eq!(t.resolve(None), &t.scout);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let s: AlphieSettings =
            serde_json::from_str(r#"{"execution":{"taskTimeoutSecs":60}}"#).unwrap();
        assert_eq!(s.execution.task_timeout_secs, 60);
        assert_eq!(s.execution.startup_timeout_secs, 45);
    }

    #[test]
    fn configured_pricing_wins() {
        let mut s = AlphieSettings::default();
        let _ = s
            .pricing
            .insert("sonnet".into(), ModelPricing::new(1.0, 2.0));
        assert_eq!(s.pricing_for("sonnet"), Some(ModelPricing::new(1.0, 2.0)));
        assert!(s.pricing_for("opus").is_some());
        assert!(s.pricing_for("unknown").is_none());
    }

    #[test]
    fn worktree_base_override() {
        let w = WorktreeSettings {
            base_dir: Some(PathBuf::from("/srv/wt")),
        };
        assert_eq!(w.resolved_base_dir(), PathBuf::from("/srv/wt"));
    }
}
