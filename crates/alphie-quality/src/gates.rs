//! Project-aware build/test/lint/typecheck gates.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::baseline::{collect_results, compare_to_baseline, Baseline, Comparison, GateResults};
use crate::command::{run_command, CommandSpec, CommandStatus};
use crate::project::{
    detect_project, has_go_tests, has_python_tests, package_scripts, tool_available, ProjectType,
};

pub const DEFAULT_GATE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Test,
    Build,
    Lint,
    Typecheck,
}

impl Gate {
    pub const ALL: [Gate; 4] = [Gate::Test, Gate::Build, Gate::Lint, Gate::Typecheck];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Build => "build",
            Self::Lint => "lint",
            Self::Typecheck => "typecheck",
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateResult {
    Pass,
    Fail,
    Skip,
    Error,
}

impl GateResult {
    /// Pass and skip both count as passing.
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Pass | Self::Skip)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GateOutput {
    pub gate: Gate,
    pub result: GateResult,
    pub output: String,
    pub duration: Duration,
}

/// What a gate will do for a given project.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatePlan {
    Run(CommandSpec),
    Skip(&'static str),
}

/// Which gates run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateSelection {
    pub test: bool,
    pub build: bool,
    pub lint: bool,
    pub typecheck: bool,
}

impl Default for GateSelection {
    fn default() -> Self {
        Self {
            test: true,
            build: true,
            lint: true,
            typecheck: true,
        }
    }
}

impl GateSelection {
    pub fn enabled(&self, gate: Gate) -> bool {
        match gate {
            Gate::Test => self.test,
            Gate::Build => self.build,
            Gate::Lint => self.lint,
            Gate::Typecheck => self.typecheck,
        }
    }

    /// Drop failures owned by disabled gates. Type errors also come from
    /// build output, so they stay while either gate is on.
    pub fn restrict(&self, results: &GateResults) -> GateResults {
        let mut kept = results.clone();
        if !self.test {
            kept.failing_tests.clear();
        }
        if !self.lint {
            kept.lint_errors.clear();
        }
        if !self.typecheck && !self.build {
            kept.type_errors.clear();
        }
        kept
    }
}

/// Decide the command for `gate` in `dir`. `available` answers whether a
/// tool is installed.
pub fn plan_gate(
    gate: Gate,
    project: ProjectType,
    dir: &Path,
    available: &dyn Fn(&str) -> bool,
) -> GatePlan {
    use GatePlan::{Run, Skip};

    match (project, gate) {
        (ProjectType::Go, Gate::Test) => {
            if has_go_tests(dir) {
                Run(CommandSpec::new("go", &["test", "./..."]))
            } else {
                Skip("no *_test.go files")
            }
        }
        (ProjectType::Go, Gate::Build) => Run(CommandSpec::new("go", &["build", "./..."])),
        (ProjectType::Go, Gate::Lint) => {
            if available("golangci-lint") {
                Run(CommandSpec::new("golangci-lint", &["run", "./..."]))
            } else {
                Run(CommandSpec::new("go", &["vet", "./..."]))
            }
        }
        (ProjectType::Go, Gate::Typecheck) => Skip("covered by build"),

        (ProjectType::Node, Gate::Typecheck) => {
            if dir.join("tsconfig.json").is_file() {
                Run(CommandSpec::new("npx", &["tsc", "--noEmit"]))
            } else {
                Skip("no tsconfig.json")
            }
        }
        (ProjectType::Node, gate) => {
            let script = gate.as_str();
            if package_scripts(dir).contains(script) {
                if gate == Gate::Test {
                    Run(CommandSpec::new("npm", &["test"]))
                } else {
                    Run(CommandSpec::new("npm", &["run", script]))
                }
            } else {
                Skip("no matching package.json script")
            }
        }

        (ProjectType::Python, Gate::Test) => {
            if has_python_tests(dir) {
                Run(CommandSpec::new("pytest", &[]))
            } else {
                Skip("no tests/ dir or test_*.py")
            }
        }
        (ProjectType::Python, Gate::Build) => Skip("no build step"),
        (ProjectType::Python, Gate::Lint) => {
            if available("ruff") {
                Run(CommandSpec::new("ruff", &["check", "."]))
            } else if available("flake8") {
                Run(CommandSpec::new("flake8", &[]))
            } else {
                Skip("neither ruff nor flake8 installed")
            }
        }
        (ProjectType::Python, Gate::Typecheck) => {
            if available("mypy") {
                Run(CommandSpec::new("mypy", &["."]))
            } else {
                Skip("mypy not installed")
            }
        }

        (ProjectType::Unknown, _) => Skip("unknown project type"),
    }
}

/// Overall verdict of a gate run.
#[derive(Clone, Debug)]
pub struct GateEvaluation {
    pub outputs: Vec<GateOutput>,
    /// Present when a baseline was used.
    pub comparison: Option<Comparison>,
    pub passed: bool,
}

impl GateEvaluation {
    /// One line per failing gate or new failure, for prompts and logs.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        for out in &self.outputs {
            lines.push(format!("{}: {:?}", out.gate, out.result).to_lowercase());
        }
        if let Some(cmp) = &self.comparison {
            for failure in &cmp.new_failures {
                lines.push(format!("new failure: {failure}"));
            }
            if cmp.worse_lints > 0 {
                lines.push(format!("{} new lint errors", cmp.worse_lints));
            }
        }
        lines.join("\n")
    }
}

/// Gate runner bound to one working directory.
#[derive(Clone, Debug)]
pub struct QualityGates {
    dir: PathBuf,
    selection: GateSelection,
    timeout: Duration,
}

impl QualityGates {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            selection: GateSelection::default(),
            timeout: DEFAULT_GATE_TIMEOUT,
        }
    }

    pub fn with_selection(mut self, selection: GateSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn project(&self) -> ProjectType {
        detect_project(&self.dir)
    }

    /// Run every enabled gate in order.
    pub async fn run_gates(&self) -> Vec<GateOutput> {
        let project = self.project();
        let mut outputs = Vec::new();
        for gate in Gate::ALL {
            if !self.selection.enabled(gate) {
                continue;
            }
            outputs.push(self.run_gate(gate, project).await);
        }
        outputs
    }

    async fn run_gate(&self, gate: Gate, project: ProjectType) -> GateOutput {
        match plan_gate(gate, project, &self.dir, &tool_available) {
            GatePlan::Skip(reason) => GateOutput {
                gate,
                result: GateResult::Skip,
                output: reason.to_string(),
                duration: Duration::ZERO,
            },
            GatePlan::Run(spec) => {
                let outcome = run_command(&spec, &self.dir, self.timeout).await;
                let result = match outcome.status {
                    CommandStatus::Success => GateResult::Pass,
                    CommandStatus::Failed(_) => GateResult::Fail,
                    CommandStatus::Error => GateResult::Error,
                };
                info!(gate = %gate, command = %spec, ?result, "gate finished");
                GateOutput {
                    gate,
                    result,
                    output: outcome.combined(),
                    duration: outcome.duration,
                }
            }
        }
    }

    /// Run the gates and judge them. With a baseline only new failures
    /// count; without one every gate must pass or skip.
    pub async fn evaluate(&self, baseline: Option<&Baseline>) -> GateEvaluation {
        match baseline {
            Some(baseline) => {
                let current = self.selection.restrict(&collect_results(&self.dir, self.timeout).await);
                let baseline = Baseline {
                    results: self.selection.restrict(&baseline.results),
                    captured_at: baseline.captured_at,
                };
                let comparison = compare_to_baseline(Some(&current), Some(&baseline));
                GateEvaluation {
                    outputs: Vec::new(),
                    passed: !comparison.is_regression,
                    comparison: Some(comparison),
                }
            }
            None => {
                let outputs = self.run_gates().await;
                let passed = all_passed(&outputs);
                GateEvaluation {
                    outputs,
                    comparison: None,
                    passed,
                }
            }
        }
    }
}

pub fn all_passed(outputs: &[GateOutput]) -> bool {
    outputs.iter().all(|o| o.result.is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn none(_: &str) -> bool {
        false
    }

    fn all(_: &str) -> bool {
        true
    }

    fn results(tests: &[&str], lints: &[&str], types: &[&str]) -> GateResults {
        let set = |items: &[&str]| items.iter().map(|s| (*s).to_string()).collect();
        GateResults {
            failing_tests: set(tests),
            lint_errors: set(lints),
            type_errors: set(types),
        }
    }

    #[test]
    fn disabled_gates_do_not_count_as_regressions() {
        let baseline = Baseline::new(results(&["TestOld"], &[], &[]));
        let current = results(&["TestOld"], &["main.go:3: unused"], &["x.go:1: undefined: y"]);
        assert!(compare_to_baseline(Some(&current), Some(&baseline)).is_regression);

        let selection = GateSelection {
            lint: false,
            typecheck: false,
            build: false,
            ..GateSelection::default()
        };
        let restricted = Baseline::new(selection.restrict(&baseline.results));
        let comparison = compare_to_baseline(Some(&selection.restrict(&current)), Some(&restricted));
        assert!(!comparison.is_regression, "{comparison:?}");
        assert_eq!(comparison.worse_lints, 0);

        let tests_only_off = GateSelection {
            test: false,
            ..GateSelection::default()
        };
        let kept = tests_only_off.restrict(&current);
        assert!(kept.failing_tests.is_empty());
        assert_eq!(kept.lint_errors.len(), 1);
        assert_eq!(kept.type_errors.len(), 1);
    }

    #[tokio::test]
    async fn baseline_mode_honors_selection() {
        let dir = tempfile::tempdir().unwrap();
        let baseline = Baseline::new(results(&["TestAlreadyBroken"], &[], &[]));
        let gates = QualityGates::new(dir.path()).with_selection(GateSelection {
            test: false,
            build: false,
            lint: false,
            typecheck: false,
        });
        let evaluation = gates.evaluate(Some(&baseline)).await;
        assert!(evaluation.passed);
        let comparison = evaluation.comparison.unwrap();
        assert!(comparison.improved.is_empty());
        assert!(comparison.new_failures.is_empty());
    }

    #[test]
    fn go_plans() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("go.mod"), "module x").unwrap();
        let p = dir.path();
        assert!(matches!(plan_gate(Gate::Test, ProjectType::Go, p, &none), GatePlan::Skip(_)));
        std::fs::write(p.join("a_test.go"), "").unwrap();
        assert_eq!(
            plan_gate(Gate::Test, ProjectType::Go, p, &none),
            GatePlan::Run(CommandSpec::new("go", &["test", "./..."]))
        );
        assert_eq!(
            plan_gate(Gate::Lint, ProjectType::Go, p, &all),
            GatePlan::Run(CommandSpec::new("golangci-lint", &["run", "./..."]))
        );
        assert_eq!(
            plan_gate(Gate::Lint, ProjectType::Go, p, &none),
            GatePlan::Run(CommandSpec::new("go", &["vet", "./..."]))
        );
        assert!(matches!(plan_gate(Gate::Typecheck, ProjectType::Go, p, &all), GatePlan::Skip(_)));
    }

    #[test]
    fn node_plans_follow_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path();
        std::fs::write(p.join("package.json"), r#"{"scripts":{"test":"jest","lint":"eslint ."}}"#).unwrap();
        assert_eq!(
            plan_gate(Gate::Test, ProjectType::Node, p, &all),
            GatePlan::Run(CommandSpec::new("npm", &["test"]))
        );
        assert_eq!(
            plan_gate(Gate::Lint, ProjectType::Node, p, &all),
            GatePlan::Run(CommandSpec::new("npm", &["run", "lint"]))
        );
        assert!(matches!(plan_gate(Gate::Build, ProjectType::Node, p, &all), GatePlan::Skip(_)));
        assert!(matches!(plan_gate(Gate::Typecheck, ProjectType::Node, p, &all), GatePlan::Skip(_)));
        std::fs::write(p.join("tsconfig.json"), "{}").unwrap();
        assert_eq!(
            plan_gate(Gate::Typecheck, ProjectType::Node, p, &all),
            GatePlan::Run(CommandSpec::new("npx", &["tsc", "--noEmit"]))
        );
    }

    #[test]
    fn python_plans_depend_on_tools() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path();
        assert!(matches!(plan_gate(Gate::Test, ProjectType::Python, p, &all), GatePlan::Skip(_)));
        std::fs::create_dir(p.join("tests")).unwrap();
        assert_eq!(
            plan_gate(Gate::Test, ProjectType::Python, p, &all),
            GatePlan::Run(CommandSpec::new("pytest", &[]))
        );
        let only_flake8 = |t: &str| t == "flake8";
        assert_eq!(
            plan_gate(Gate::Lint, ProjectType::Python, p, &only_flake8),
            GatePlan::Run(CommandSpec::new("flake8", &[]))
        );
        assert!(matches!(plan_gate(Gate::Lint, ProjectType::Python, p, &none), GatePlan::Skip(_)));
        assert!(matches!(plan_gate(Gate::Typecheck, ProjectType::Python, p, &none), GatePlan::Skip(_)));
        assert!(matches!(plan_gate(Gate::Build, ProjectType::Python, p, &all), GatePlan::Skip(_)));
    }

    #[test]
    fn unknown_project_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        for gate in Gate::ALL {
            assert!(matches!(
                plan_gate(gate, ProjectType::Unknown, dir.path(), &all),
                GatePlan::Skip(_)
            ));
        }
    }

    #[tokio::test]
    async fn unknown_project_passes_all_gates() {
        let dir = tempfile::tempdir().unwrap();
        let gates = QualityGates::new(dir.path()).with_selection(GateSelection {
            lint: false,
            ..GateSelection::default()
        });
        let outputs = gates.run_gates().await;
        assert_eq!(outputs.len(), 3);
        assert!(outputs.iter().all(|o| o.result == GateResult::Skip));
        let eval = gates.evaluate(None).await;
        assert!(eval.passed);
        assert!(eval.comparison.is_none());
    }

    #[test]
    fn pass_and_skip_are_ok() {
        let out = |result| GateOutput {
            gate: Gate::Test,
            result,
            output: String::new(),
            duration: Duration::ZERO,
        };
        assert!(all_passed(&[out(GateResult::Pass), out(GateResult::Skip)]));
        assert!(!all_passed(&[out(GateResult::Pass), out(GateResult::Fail)]));
        assert!(!all_passed(&[out(GateResult::Error)]));
    }
}
