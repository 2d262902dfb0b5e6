//! # alphie-quality
//!
//! Quality gates around agent output: project detection, the four
//! build/test/lint/typecheck gates, pre-session baselines with regression
//! comparison, and focused test selection from modified files.

pub mod baseline;
pub mod command;
pub mod error;
pub mod focused;
pub mod gates;
pub mod project;

pub use baseline::{capture_baseline, collect_results, compare_to_baseline, Baseline, Comparison, GateResults};
pub use command::{run_command, CommandOutcome, CommandSpec, CommandStatus, TIMED_OUT};
pub use error::{GateError, Result};
pub use focused::{FocusedRun, FocusedTestSelector};
pub use gates::{
    all_passed, plan_gate, Gate, GateEvaluation, GateOutput, GatePlan, GateResult, GateSelection,
    QualityGates, DEFAULT_GATE_TIMEOUT,
};
pub use project::{detect_project, ProjectType};

/// Truncate to `max` characters, marking the cut.
pub fn truncate_output(s: &str, max: usize) -> String {
    focused::truncate_chars(s, max)
}
