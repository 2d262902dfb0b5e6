//! Pre-session failure baselines and regression comparison.
//!
//! A baseline records which tests, lint checks and type/build checks were
//! already failing before any agent touched the repository, so later gate
//! runs only fail on failures the agent introduced.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::command::{run_command, CommandOutcome, CommandSpec};
use crate::error::Result;
use crate::project::{detect_project, has_python_tests, package_scripts, tool_available, ProjectType};

/// Failures observed in one run of the tool trio.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GateResults {
    pub failing_tests: BTreeSet<String>,
    pub lint_errors: BTreeSet<String>,
    pub type_errors: BTreeSet<String>,
}

impl GateResults {
    pub fn is_clean(&self) -> bool {
        self.failing_tests.is_empty() && self.lint_errors.is_empty() && self.type_errors.is_empty()
    }

    fn failures(&self) -> BTreeSet<&String> {
        self.failing_tests.iter().chain(&self.type_errors).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Baseline {
    #[serde(flatten)]
    pub results: GateResults,
    pub captured_at: DateTime<Utc>,
}

impl Baseline {
    pub fn new(results: GateResults) -> Self {
        Self {
            results,
            captured_at: Utc::now(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    /// Failing now, not in the baseline. Sorted.
    pub new_failures: Vec<String>,
    /// Failing in the baseline, fixed now. Sorted.
    pub improved: Vec<String>,
    /// `current lint count − baseline lint count`.
    pub worse_lints: i64,
    pub is_regression: bool,
}

/// Diff `current` against `baseline`.
///
/// No current results is never a regression. Current results without a
/// baseline always are, since nothing shows the failures pre-existed.
pub fn compare_to_baseline(current: Option<&GateResults>, baseline: Option<&Baseline>) -> Comparison {
    let Some(current) = current else {
        return Comparison::default();
    };
    let Some(baseline) = baseline else {
        return Comparison {
            new_failures: current.failures().into_iter().cloned().collect(),
            improved: Vec::new(),
            worse_lints: current.lint_errors.len() as i64,
            is_regression: true,
        };
    };

    let now = current.failures();
    let before = baseline.results.failures();
    let new_failures: Vec<String> = now.difference(&before).map(|s| (*s).clone()).collect();
    let improved: Vec<String> = before.difference(&now).map(|s| (*s).clone()).collect();
    let worse_lints = current.lint_errors.len() as i64 - baseline.results.lint_errors.len() as i64;

    Comparison {
        is_regression: !new_failures.is_empty() || worse_lints > 0,
        new_failures,
        improved,
        worse_lints,
    }
}

/// Run the test/lint/type trio once and record what fails.
pub async fn capture_baseline(dir: &Path, timeout: Duration) -> Baseline {
    let baseline = Baseline::new(collect_results(dir, timeout).await);
    info!(
        dir = %dir.display(),
        tests = baseline.results.failing_tests.len(),
        lint = baseline.results.lint_errors.len(),
        types = baseline.results.type_errors.len(),
        "baseline captured"
    );
    baseline
}

/// Run the project's tool trio and parse its failures.
pub async fn collect_results(dir: &Path, timeout: Duration) -> GateResults {
    let mut results = GateResults::default();
    match detect_project(dir) {
        ProjectType::Go => {
            let test = run(dir, timeout, CommandSpec::new("go", &["test", "-json", "./..."])).await;
            results.failing_tests = parse_go_test_json(&test.stdout);

            results.lint_errors = if tool_available("golangci-lint") {
                let lint = run(
                    dir,
                    timeout,
                    CommandSpec::new("golangci-lint", &["run", "--out-format", "json", "./..."]),
                )
                .await;
                parse_golangci_json(&lint.stdout)
            } else {
                let vet = run(dir, timeout, CommandSpec::new("go", &["vet", "./..."])).await;
                parse_plain_lines(&vet.combined())
            };

            let build = run(dir, timeout, CommandSpec::new("go", &["build", "./..."])).await;
            results.type_errors = parse_plain_lines(&build.combined());
        }
        ProjectType::Node => {
            let scripts = package_scripts(dir);
            if scripts.contains("test") {
                let test = run(dir, timeout, CommandSpec::new("npm", &["test"])).await;
                results.failing_tests = parse_jest_failures(&test.combined());
            }
            if scripts.contains("lint") {
                let lint = run(dir, timeout, CommandSpec::new("npm", &["run", "lint"])).await;
                results.lint_errors = parse_eslint_errors(&lint.combined());
            }
            if dir.join("tsconfig.json").is_file() {
                let tsc = run(dir, timeout, CommandSpec::new("npx", &["tsc", "--noEmit"])).await;
                results.type_errors = parse_tsc_errors(&tsc.combined());
            }
        }
        ProjectType::Python => {
            if has_python_tests(dir) {
                let test = run(dir, timeout, CommandSpec::new("pytest", &["-q", "-rf"])).await;
                results.failing_tests = parse_pytest_failures(&test.combined());
            }
            if tool_available("ruff") {
                let lint = run(
                    dir,
                    timeout,
                    CommandSpec::new("ruff", &["check", "--output-format", "concise", "."]),
                )
                .await;
                results.lint_errors = parse_diagnostic_lines(&lint.combined());
            } else if tool_available("flake8") {
                let lint = run(dir, timeout, CommandSpec::new("flake8", &[])).await;
                results.lint_errors = parse_diagnostic_lines(&lint.combined());
            }
            if tool_available("mypy") {
                let types = run(dir, timeout, CommandSpec::new("mypy", &["."])).await;
                results.type_errors = parse_mypy_errors(&types.combined());
            }
        }
        ProjectType::Unknown => debug!(dir = %dir.display(), "unknown project, empty results"),
    }
    results
}

async fn run(dir: &Path, timeout: Duration, spec: CommandSpec) -> CommandOutcome {
    run_command(&spec, dir, timeout).await
}

/// `go test -json`: every `fail` action with a test name yields
/// `package/Test`.
pub fn parse_go_test_json(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(|v| v.get("Action").and_then(Value::as_str) == Some("fail"))
        .filter_map(|v| {
            let test = v.get("Test").and_then(Value::as_str).filter(|t| !t.is_empty())?;
            let package = v.get("Package").and_then(Value::as_str).unwrap_or("");
            Some(format!("{package}/{test}"))
        })
        .collect()
}

/// `golangci-lint --out-format json`: `filename:linter: text` per issue.
/// Output that is not JSON is taken line by line.
pub fn parse_golangci_json(output: &str) -> BTreeSet<String> {
    match serde_json::from_str::<Value>(output.trim()) {
        Ok(value) => value
            .get("Issues")
            .and_then(Value::as_array)
            .map(|issues| {
                issues
                    .iter()
                    .map(|issue| {
                        let file = issue
                            .get("Pos")
                            .and_then(|p| p.get("Filename"))
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        let linter = issue.get("FromLinter").and_then(Value::as_str).unwrap_or("");
                        let text = issue.get("Text").and_then(Value::as_str).unwrap_or("");
                        format!("{file}:{linter}: {text}")
                    })
                    .collect()
            })
            .unwrap_or_default(),
        Err(_) => output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && serde_json::from_str::<Value>(l).is_err())
            .map(str::to_string)
            .collect(),
    }
}

/// `go vet` / `go build`: every non-empty line not starting with `#`.
pub fn parse_plain_lines(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// pytest `-rf` summary: `FAILED <id> - reason` → `<id>`.
pub fn parse_pytest_failures(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|l| l.trim().strip_prefix("FAILED "))
        .map(|rest| rest.split(" - ").next().unwrap_or(rest).trim().to_string())
        .collect()
}

static DIAGNOSTIC_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s:][^:]*:\d+:(\d+:)? ").unwrap());

/// ruff/flake8 `path:line:col: CODE message` lines.
pub fn parse_diagnostic_lines(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .map(str::trim_end)
        .filter(|l| DIAGNOSTIC_LINE.is_match(l))
        .map(str::to_string)
        .collect()
}

/// mypy `path:line: error: message` lines.
pub fn parse_mypy_errors(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| l.contains(": error:"))
        .map(str::to_string)
        .collect()
}

/// tsc `file(line,col): error TSxxxx: message` lines.
pub fn parse_tsc_errors(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| l.contains("error TS"))
        .map(str::to_string)
        .collect()
}

/// jest `FAIL <file>` lines.
pub fn parse_jest_failures(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|l| l.trim().strip_prefix("FAIL "))
        .map(|f| f.trim().to_string())
        .collect()
}

/// eslint stylish `line:col  error  message  rule` lines, prefixed with the
/// file heading they appear under.
pub fn parse_eslint_errors(output: &str) -> BTreeSet<String> {
    let mut file = String::new();
    let mut errors = BTreeSet::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !line.starts_with(char::is_whitespace) && !trimmed.starts_with('✖') {
            file = trimmed.to_string();
            continue;
        }
        let mut parts = trimmed.split_whitespace();
        let pos = parts.next().unwrap_or("");
        if parts.next() == Some("error") && pos.contains(':') {
            let _ = errors.insert(format!("{file}:{trimmed}"));
        }
    }
    errors
}
