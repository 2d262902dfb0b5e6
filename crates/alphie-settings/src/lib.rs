//! # alphie-settings
//!
//! Layered configuration for the orchestrator.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`AlphieSettings::default()`]
//! 2. **Settings file**: `<repo>/.alphie/settings.json` or
//!    `~/.alphie/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `ALPHIE_*` overrides
//!
//! The tier table is also published process-wide: it is installed once
//! during configuration load and read by every component that branches on
//! tier.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_paths};
pub use types::*;

use std::sync::OnceLock;

use parking_lot::RwLock;

struct TierRegistry {
    table: TierTable,
    frozen: bool,
}

static TIERS: OnceLock<RwLock<TierRegistry>> = OnceLock::new();

fn registry() -> &'static RwLock<TierRegistry> {
    TIERS.get_or_init(|| {
        RwLock::new(TierRegistry {
            table: TierTable::default(),
            frozen: false,
        })
    })
}

/// Install the tier table for this process and freeze it.
///
/// Returns `false` (leaving the installed table untouched) if a table was
/// already installed.
pub fn install_tier_table(table: TierTable) -> bool {
    let mut reg = registry().write();
    if reg.frozen {
        tracing::debug!("tier table already installed, ignoring");
        return false;
    }
    reg.table = table;
    reg.frozen = true;
    true
}

/// Snapshot of the process-wide tier table. Defaults until installed.
pub fn tier_table() -> TierTable {
    registry().read().table.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_first_wins() {
        let mut custom = TierTable::default();
        custom.scout.threshold = 4;
        let first = install_tier_table(custom.clone());
        let mut other = TierTable::default();
        other.scout.threshold = 2;
        assert!(!install_tier_table(other));
        if first {
            assert_eq!(tier_table().scout.threshold, 4);
        }
        assert_ne!(tier_table().scout.threshold, 2);
    }
}
