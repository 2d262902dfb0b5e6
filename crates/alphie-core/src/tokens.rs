//! Two-tier token metering.
//!
//! A [`TokenTracker`] keeps *hard* counts (reported by the runner in
//! `usage` blocks) apart from *soft* counts (heuristic estimates for
//! output that arrived without usage). Confidence is the share of the
//! combined total that is backed by hard counts. Counters only grow.

use std::collections::HashMap;
use std::ops::Add;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::pricing::{self, ModelPricing};

/// Input/output token pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub const fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    pub fn total(&self) -> u64 {
        self.input.saturating_add(self.output)
    }

    pub fn is_zero(&self) -> bool {
        self.input == 0 && self.output == 0
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: Self) -> Self::Output {
        TokenUsage {
            input: self.input.saturating_add(rhs.input),
            output: self.output.saturating_add(rhs.output),
        }
    }
}

#[derive(Debug)]
struct TrackerState {
    hard: TokenUsage,
    soft: TokenUsage,
    confidence: f64,
    pricing: Option<ModelPricing>,
}

impl TrackerState {
    fn combined(&self) -> TokenUsage {
        self.hard + self.soft
    }

    #[allow(clippy::cast_precision_loss)]
    fn recompute_confidence(&mut self) {
        let total = self.combined().total();
        self.confidence = if total == 0 {
            1.0
        } else {
            self.hard.total() as f64 / total as f64
        };
    }
}

/// Per-agent token meter.
#[derive(Debug)]
pub struct TokenTracker {
    model: String,
    state: RwLock<TrackerState>,
}

impl TokenTracker {
    /// Tracker priced from the built-in table; unknown models cost nothing.
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        let pricing = pricing::lookup(&model);
        Self::with_pricing_opt(model, pricing)
    }

    pub fn with_pricing(model: impl Into<String>, pricing: ModelPricing) -> Self {
        Self::with_pricing_opt(model.into(), Some(pricing))
    }

    fn with_pricing_opt(model: String, pricing: Option<ModelPricing>) -> Self {
        Self {
            model,
            state: RwLock::new(TrackerState {
                hard: TokenUsage::default(),
                soft: TokenUsage::default(),
                confidence: 1.0,
                pricing,
            }),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Install custom pricing for this tracker only.
    pub fn set_pricing(&self, pricing: ModelPricing) {
        self.state.write().pricing = Some(pricing);
    }

    /// Add runner-reported usage.
    pub fn update(&self, delta: TokenUsage) {
        let mut state = self.state.write();
        state.hard = state.hard + delta;
        state.recompute_confidence();
    }

    /// Raise hard counters to a runner-reported cumulative total.
    /// Fields already above the reported value are left alone.
    pub fn observe_total(&self, total: TokenUsage) {
        let mut state = self.state.write();
        state.hard.input = state.hard.input.max(total.input);
        state.hard.output = state.hard.output.max(total.output);
        state.recompute_confidence();
    }

    /// Add heuristic estimates.
    pub fn update_soft(&self, input: u64, output: u64) {
        let mut state = self.state.write();
        state.soft = state.soft + TokenUsage::new(input, output);
        state.recompute_confidence();
    }

    /// Combined (hard + soft) usage.
    pub fn usage(&self) -> TokenUsage {
        self.state.read().combined()
    }

    pub fn hard_usage(&self) -> TokenUsage {
        self.state.read().hard
    }

    pub fn soft_usage(&self) -> TokenUsage {
        self.state.read().soft
    }

    pub fn confidence(&self) -> f64 {
        self.state.read().confidence
    }

    /// Dollar cost of the combined usage.
    pub fn cost(&self) -> f64 {
        let state = self.state.read();
        let combined = state.combined();
        state
            .pricing
            .map_or(0.0, |p| p.cost(combined.input, combined.output))
    }
}

/// Usage across many agents.
#[derive(Debug, Default)]
pub struct AggregateTracker {
    trackers: RwLock<HashMap<String, Arc<TokenTracker>>>,
}

impl AggregateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, agent_id: impl Into<String>, tracker: Arc<TokenTracker>) {
        self.trackers.write().insert(agent_id.into(), tracker);
    }

    pub fn remove(&self, agent_id: &str) -> Option<Arc<TokenTracker>> {
        self.trackers.write().remove(agent_id)
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<TokenTracker>> {
        self.trackers.read().get(agent_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.trackers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.read().is_empty()
    }

    pub fn usage(&self) -> TokenUsage {
        self.trackers
            .read()
            .values()
            .fold(TokenUsage::default(), |acc, t| acc + t.usage())
    }

    pub fn cost(&self) -> f64 {
        self.trackers.read().values().map(|t| t.cost()).sum()
    }

    /// Token-weighted mean of per-tracker confidence. Trackers with no
    /// tokens carry no weight; an all-zero aggregate is fully confident.
    #[allow(clippy::cast_precision_loss)]
    pub fn confidence(&self) -> f64 {
        let trackers = self.trackers.read();
        let mut weighted = 0.0;
        let mut weight = 0u64;
        for t in trackers.values() {
            let total = t.usage().total();
            if total == 0 {
                continue;
            }
            weighted += t.confidence() * total as f64;
            weight += total;
        }
        if weight == 0 {
            1.0
        } else {
            weighted / weight as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tracker_is_fully_confident() {
        let t = TokenTracker::new("sonnet");
        assert_eq!(t.usage(), TokenUsage::default());
        assert!((t.confidence() - 1.0).abs() < f64::EPSILON);
        assert!(t.cost().abs() < f64::EPSILON);
    }

    #[test]
    fn confidence_is_hard_share() {
        let t = TokenTracker::new("sonnet");
        t.update(TokenUsage::new(300, 0));
        t.update_soft(0, 100);
        assert!((t.confidence() - 0.75).abs() < 1e-9);
        assert_eq!(t.usage(), TokenUsage::new(300, 100));
    }

    #[test]
    fn sonnet_cost() {
        let t = TokenTracker::with_pricing("sonnet", ModelPricing::new(3.0, 15.0));
        t.update(TokenUsage::new(1_000_000, 1_000_000));
        assert!((t.cost() - 18.0).abs() < 0.01);
    }

    #[test]
    fn unknown_model_costs_nothing() {
        let t = TokenTracker::new("mystery-model");
        t.update(TokenUsage::new(5_000_000, 5_000_000));
        assert!(t.cost().abs() < f64::EPSILON);
    }

    #[test]
    fn custom_pricing_overrides_table() {
        let t = TokenTracker::new("mystery-model");
        t.set_pricing(ModelPricing::new(1.0, 1.0));
        t.update(TokenUsage::new(1_000_000, 0));
        assert!((t.cost() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn observe_total_never_lowers() {
        let t = TokenTracker::new("sonnet");
        t.update(TokenUsage::new(100, 50));
        t.observe_total(TokenUsage::new(80, 200));
        assert_eq!(t.hard_usage(), TokenUsage::new(100, 200));
    }

    #[test]
    fn empty_aggregate() {
        let agg = AggregateTracker::new();
        assert!(agg.is_empty());
        assert_eq!(agg.usage(), TokenUsage::default());
        assert!(agg.cost().abs() < f64::EPSILON);
        assert!((agg.confidence() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn aggregate_weights_confidence_by_tokens() {
        let agg = AggregateTracker::new();
        let a = Arc::new(TokenTracker::new("sonnet"));
        a.update(TokenUsage::new(100, 0));
        let b = Arc::new(TokenTracker::new("sonnet"));
        b.update_soft(300, 0);
        let idle = Arc::new(TokenTracker::new("sonnet"));
        agg.add("a", a);
        agg.add("b", b);
        agg.add("idle", idle);

        assert_eq!(agg.usage(), TokenUsage::new(400, 0));
        assert!((agg.confidence() - 0.25).abs() < 1e-9);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Hard(u32, u32),
            Soft(u32, u32),
            Total(u32, u32),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (any::<u32>(), any::<u32>()).prop_map(|(i, o)| Op::Hard(i, o)),
                (any::<u32>(), any::<u32>()).prop_map(|(i, o)| Op::Soft(i, o)),
                (any::<u32>(), any::<u32>()).prop_map(|(i, o)| Op::Total(i, o)),
            ]
        }

        proptest! {
            #[test]
            fn counters_stay_consistent(ops in proptest::collection::vec(op(), 0..32)) {
                let t = TokenTracker::new("sonnet");
                let mut last = TokenUsage::default();
                for op in ops {
                    match op {
                        Op::Hard(i, o) => t.update(TokenUsage::new(u64::from(i), u64::from(o))),
                        Op::Soft(i, o) => t.update_soft(u64::from(i), u64::from(o)),
                        Op::Total(i, o) => t.observe_total(TokenUsage::new(u64::from(i), u64::from(o))),
                    }
                    let combined = t.usage();
                    prop_assert_eq!(t.hard_usage().total() + t.soft_usage().total(), combined.total());
                    prop_assert!(combined.input >= last.input && combined.output >= last.output);
                    let c = t.confidence();
                    prop_assert!((0.0..=1.0).contains(&c));
                    prop_assert!(t.cost() >= 0.0);
                    last = combined;
                }
            }
        }
    }
}
