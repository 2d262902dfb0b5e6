//! Model pricing table and cost formatting.
//!
//! Prices are dollars per million tokens. Lookup tries an exact model id
//! first, then a family match (`haiku`, `sonnet`, `opus`). Models outside
//! the table have no pricing and cost nothing.

use serde::{Deserialize, Serialize};

/// Per-model price row, dollars per million tokens.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    #[allow(clippy::cast_precision_loss)] // Token counts never approach 2^52
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 * self.input_per_million / 1_000_000.0
            + output_tokens as f64 * self.output_per_million / 1_000_000.0
    }
}

const HAIKU: ModelPricing = ModelPricing::new(0.80, 4.0);
const SONNET: ModelPricing = ModelPricing::new(3.0, 15.0);
const OPUS: ModelPricing = ModelPricing::new(15.0, 75.0);

const EXACT: &[(&str, ModelPricing)] = &[
    ("haiku", HAIKU),
    ("sonnet", SONNET),
    ("opus", OPUS),
    ("claude-3-5-haiku-latest", HAIKU),
    ("claude-3-5-haiku-20241022", HAIKU),
    ("claude-haiku-4-5", ModelPricing::new(1.0, 5.0)),
    ("claude-3-5-sonnet-latest", SONNET),
    ("claude-3-7-sonnet-latest", SONNET),
    ("claude-sonnet-4-20250514", SONNET),
    ("claude-sonnet-4-5", SONNET),
    ("claude-opus-4-20250514", OPUS),
    ("claude-opus-4-1", OPUS),
    ("claude-opus-4-5", ModelPricing::new(5.0, 25.0)),
];

/// Look up the built-in pricing for a model identifier.
pub fn lookup(model: &str) -> Option<ModelPricing> {
    let m = model.trim().to_ascii_lowercase();
    if let Some((_, p)) = EXACT.iter().find(|(id, _)| *id == m) {
        return Some(*p);
    }
    if m.contains("haiku") {
        Some(HAIKU)
    } else if m.contains("sonnet") {
        Some(SONNET)
    } else if m.contains("opus") {
        Some(OPUS)
    } else {
        None
    }
}

/// Format a cost value for display.
///
/// Uses 3 decimal places for values under $0.01, 2 otherwise.
pub fn format_cost(cost: f64) -> String {
    if cost < 0.01 {
        format!("${cost:.3}")
    } else {
        format!("${cost:.2}")
    }
}

/// Format a token count for display (e.g. `"1.5M"`, `"50K"`, `"500"`).
#[allow(clippy::cast_precision_loss)]
pub fn format_tokens(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_wins() {
        assert_eq!(lookup("claude-opus-4-5"), Some(ModelPricing::new(5.0, 25.0)));
    }

    #[test]
    fn family_match() {
        assert_eq!(lookup("claude-sonnet-9-future"), Some(SONNET));
        assert_eq!(lookup("Claude-3-Haiku"), Some(HAIKU));
    }

    #[test]
    fn unknown_model_has_no_pricing() {
        assert_eq!(lookup("gpt-4o"), None);
        assert_eq!(lookup(""), None);
    }

    #[test]
    fn sonnet_million_each_costs_eighteen_dollars() {
        let cost = SONNET.cost(1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < 0.01, "got {cost}");
    }

    #[test]
    fn formatting() {
        assert_eq!(format_cost(0.005), "$0.005");
        assert_eq!(format_cost(1.5), "$1.50");
        assert_eq!(format_tokens(500), "500");
        assert_eq!(format_tokens(1_500), "1.5K");
        assert_eq!(format_tokens(2_000_000), "2.0M");
    }
}
