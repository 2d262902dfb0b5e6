//! Keyword-based model selection.

use std::sync::LazyLock;

use regex::Regex;

use alphie_core::Tier;
use alphie_settings::tier_table;

pub const SMALL_MODEL: &str = "haiku";
pub const LARGE_MODEL: &str = "opus";

static SMALL_KEYWORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(simple|boilerplate|typo|trivial|formatting)\b").unwrap());
static LARGE_KEYWORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(architecture|design|refactor|redesign|complex)\b").unwrap());

/// Pick a model from the task text. Small-model keywords win over
/// large-model ones; with neither, the tier default applies.
pub fn select_model(title: &str, description: &str, tier: Option<Tier>) -> String {
    let text = format!("{title}\n{description}");
    if SMALL_KEYWORDS.is_match(&text) {
        SMALL_MODEL.to_string()
    } else if LARGE_KEYWORDS.is_match(&text) {
        LARGE_MODEL.to_string()
    } else {
        tier_table().resolve(tier).default_model.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords() {
        assert_eq!(select_model("Fix typo in README", "", None), "haiku");
        assert_eq!(select_model("Refactor the scheduler", "", None), "opus");
        assert_eq!(select_model("Simple refactor", "", Some(Tier::Architect)), "haiku");
        assert_eq!(select_model("Redesign", "keep it trivial", None), "haiku");
    }

    #[test]
    fn whole_words_only() {
        assert_eq!(select_model("Add designer field", "", Some(Tier::Builder)), "sonnet");
    }

    #[test]
    fn tier_default() {
        assert_eq!(select_model("Add endpoint", "", Some(Tier::Builder)), "sonnet");
        assert_eq!(select_model("Add endpoint", "", Some(Tier::Architect)), "opus");
        assert_eq!(select_model("Add endpoint", "", None), "haiku");
    }
}
