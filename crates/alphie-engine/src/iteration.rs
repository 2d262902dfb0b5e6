//! Per-agent critique iteration policy.

use alphie_core::Tier;
use alphie_settings::{tier_table, TierSettings};

use crate::critique::RubricScore;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IterationController {
    iteration: u32,
    max_iterations: u32,
    threshold: u32,
}

impl IterationController {
    pub fn new(max_iterations: u32, threshold: u32) -> Self {
        Self {
            iteration: 0,
            max_iterations,
            threshold,
        }
    }

    pub fn from_settings(settings: &TierSettings) -> Self {
        Self::new(settings.max_iterations, settings.threshold)
    }

    /// Limits from the process-wide tier table; no tier means scout.
    pub fn for_tier(tier: Option<Tier>) -> Self {
        Self::from_settings(tier_table().resolve(tier))
    }

    /// Unknown tier names fall back to scout limits.
    pub fn for_tier_name(name: &str) -> Self {
        Self::for_tier(Tier::parse(name))
    }

    pub fn should_continue(&self, score: Option<&RubricScore>) -> bool {
        if self.is_at_max() {
            return false;
        }
        match score {
            None => true,
            Some(score) => !score.meets(self.threshold),
        }
    }

    pub fn increment(&mut self) {
        self.iteration += 1;
    }

    pub fn is_at_max(&self) -> bool {
        self.iteration >= self.max_iterations
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_at_max() {
        let mut c = IterationController::new(2, 7);
        assert!(c.should_continue(None));
        c.increment();
        c.increment();
        assert!(c.is_at_max());
        assert!(!c.should_continue(None));
    }

    #[test]
    fn zero_max_never_continues() {
        let c = IterationController::new(0, 5);
        assert!(!c.should_continue(None));
    }

    #[test]
    fn threshold_decides() {
        let c = IterationController::new(5, 9);
        assert!(!c.should_continue(Some(&RubricScore::new(3, 3, 3).unwrap())));
        assert!(c.should_continue(Some(&RubricScore::new(3, 3, 2).unwrap())));
    }

    #[test]
    fn tier_defaults() {
        let scout = IterationController::for_tier(None);
        assert_eq!((scout.max_iterations(), scout.threshold()), (3, 5));
        let unknown = IterationController::for_tier_name("galactic");
        assert_eq!(unknown, scout);
        let arch = IterationController::from_settings(&alphie_settings::TierTable::default().architect);
        assert_eq!((arch.max_iterations(), arch.threshold()), (7, 8));
    }
}
