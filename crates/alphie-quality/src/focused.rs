//! Narrow test runs scoped to the files an agent touched.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::{run_command, CommandOutcome, CommandSpec};
use crate::project::{detect_project, ProjectType};

/// Outcome of one focused run.
#[derive(Clone, Debug)]
pub struct FocusedRun {
    pub command: CommandSpec,
    pub outcome: CommandOutcome,
}

impl FocusedRun {
    pub fn passed(&self) -> bool {
        self.outcome.success()
    }

    /// Section appended to the next critique input when the run failed.
    pub fn failure_section(&self, max_chars: usize) -> Option<String> {
        if self.passed() {
            return None;
        }
        let output = self.outcome.combined();
        Some(format!(
            "\n\n## Focused Test Failures\n\nCommand: `{}`\n```\n{}\n```\n",
            self.command,
            truncate_chars(&output, max_chars)
        ))
    }
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("\n... (truncated)");
    out
}

#[derive(Clone, Debug)]
pub struct FocusedTestSelector {
    dir: PathBuf,
    timeout: Duration,
}

impl FocusedTestSelector {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
        }
    }

    /// The narrowest test command covering `modified`, if one exists.
    pub fn select(&self, modified: &[String]) -> Option<CommandSpec> {
        match detect_project(&self.dir) {
            ProjectType::Go => go_packages(modified).map(|pkgs| {
                let mut args = vec!["test".to_string()];
                args.extend(pkgs);
                CommandSpec {
                    program: "go".to_string(),
                    args,
                }
            }),
            ProjectType::Python => python_tests(&self.dir, modified).map(|files| CommandSpec {
                program: "pytest".to_string(),
                args: files,
            }),
            ProjectType::Node | ProjectType::Unknown => None,
        }
    }

    pub async fn run(&self, modified: &[String]) -> Option<FocusedRun> {
        let command = self.select(modified)?;
        let outcome = run_command(&command, &self.dir, self.timeout).await;
        Some(FocusedRun { command, outcome })
    }
}

/// `./dir` for each directory holding a modified `.go` file.
fn go_packages(modified: &[String]) -> Option<Vec<String>> {
    let pkgs: BTreeSet<String> = modified
        .iter()
        .filter(|f| f.ends_with(".go"))
        .map(|f| match Path::new(f).parent() {
            Some(p) if !p.as_os_str().is_empty() => format!("./{}", p.display()),
            _ => ".".to_string(),
        })
        .collect();
    (!pkgs.is_empty()).then(|| pkgs.into_iter().collect())
}

/// Modified test files plus `tests/test_<stem>.py` for modified sources.
fn python_tests(dir: &Path, modified: &[String]) -> Option<Vec<String>> {
    let mut files = BTreeSet::new();
    for f in modified.iter().filter(|f| f.ends_with(".py")) {
        let path = Path::new(f);
        let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        if stem.starts_with("test_") {
            if dir.join(path).is_file() {
                let _ = files.insert(f.clone());
            }
            continue;
        }
        let candidate = format!("tests/test_{stem}.py");
        if dir.join(&candidate).is_file() {
            let _ = files.insert(candidate);
        }
    }
    (!files.is_empty()).then(|| files.into_iter().collect())
}
