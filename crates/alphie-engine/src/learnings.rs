//! Failure learnings: the store seam and failure analysis.
//!
//! A learning is a `(condition, action, outcome)` triple. Analysis of a
//! failed task proposes candidate learnings; they are suggestions only and
//! are never stored automatically.

use std::cmp::Reverse;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Learning {
    pub condition: String,
    pub action: String,
    pub outcome: String,
}

impl Learning {
    pub fn new(condition: &str, action: &str, outcome: &str) -> Self {
        Self {
            condition: condition.to_string(),
            action: action.to_string(),
            outcome: outcome.to_string(),
        }
    }

    /// `WHEN … DO … RESULT …`, the form injected into prompts.
    pub fn render(&self) -> String {
        format!(
            "WHEN {} DO {} RESULT {}",
            self.condition, self.action, self.outcome
        )
    }
}

/// A learning returned by a lookup, best first.
#[derive(Clone, Debug, PartialEq)]
pub struct LearningMatch {
    pub learning: Learning,
    pub score: f64,
}

#[derive(Debug, thiserror::Error)]
#[error("learning store error: {0}")]
pub struct LearningError(pub String);

/// Storage and retrieval of learnings.
#[async_trait]
pub trait LearningStore: Send + Sync {
    /// Learnings relevant to a task description.
    async fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<LearningMatch>, LearningError>;

    /// Learnings whose condition matches an error message.
    async fn on_failure(&self, error: &str) -> Result<Vec<LearningMatch>, LearningError>;
}

/// Keyword-overlap store kept in memory.
#[derive(Default)]
pub struct InMemoryLearningStore {
    learnings: Mutex<Vec<Learning>>,
}

impl InMemoryLearningStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, learning: Learning) {
        self.learnings.lock().push(learning);
    }

    pub fn len(&self) -> usize {
        self.learnings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn search(&self, text: &str, limit: usize) -> Vec<LearningMatch> {
        let words = keywords(text);
        if words.is_empty() {
            return Vec::new();
        }
        let mut matches: Vec<LearningMatch> = self
            .learnings
            .lock()
            .iter()
            .filter_map(|l| {
                let cond = keywords(&l.condition);
                if cond.is_empty() {
                    return None;
                }
                let hits = cond.iter().filter(|w| words.contains(w)).count();
                (hits > 0).then(|| LearningMatch {
                    learning: l.clone(),
                    score: hits as f64 / cond.len() as f64,
                })
            })
            .collect();
        matches.sort_by_key(|m| Reverse((m.score * 1000.0) as u64));
        matches.truncate(limit);
        matches
    }
}

fn keywords(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl LearningStore for InMemoryLearningStore {
    async fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<LearningMatch>, LearningError> {
        Ok(self.search(query, limit))
    }

    async fn on_failure(&self, error: &str) -> Result<Vec<LearningMatch>, LearningError> {
        Ok(self.search(error, 3))
    }
}

struct FailurePattern {
    check: fn(&str) -> bool,
    condition: &'static str,
    action: &'static str,
    outcome: &'static str,
}

fn patterns() -> &'static [FailurePattern] {
    static PATTERNS: &[FailurePattern] = &[
        FailurePattern {
            check: |s| {
                s.contains("401")
                    || s.contains("unauthorized")
                    || s.contains("authentication")
                    || s.contains("invalid api key")
            },
            condition: "runner fails with an authentication error",
            action: "verify the CLI is logged in and credentials are valid before retrying",
            outcome: "task starts without auth failures",
        },
        FailurePattern {
            check: |s| {
                s.contains("429")
                    || s.contains("too many requests")
                    || (s.contains("rate") && s.contains("limit"))
            },
            condition: "runner hits an API rate limit",
            action: "back off before retrying and reduce parallel agents",
            outcome: "requests succeed after the limit window",
        },
        FailurePattern {
            check: |s| s.contains("timed out") || s.contains("timeout") || s.contains("deadline"),
            condition: "task exceeds its time limit",
            action: "split the task into smaller pieces or raise the task timeout",
            outcome: "each piece completes within the deadline",
        },
        FailurePattern {
            check: |s| {
                s.contains("merge conflict")
                    || s.contains("conflict (content)")
                    || s.contains("<<<<<<<")
            },
            condition: "changes conflict with concurrent edits",
            action: "rebase on the latest main and narrow the file boundaries",
            outcome: "changes merge cleanly",
        },
        FailurePattern {
            check: |s| {
                s.contains("build failed")
                    || s.contains("compilation failed")
                    || s.contains("cannot find")
                    || s.contains("undefined:")
                    || s.contains("syntax error")
                    || s.contains("error ts")
            },
            condition: "build fails after the change",
            action: "run the build locally after each edit and fix compile errors first",
            outcome: "build passes",
        },
        FailurePattern {
            check: |s| {
                s.contains("--- fail")
                    || s.contains("test failed")
                    || s.contains("tests failed")
                    || s.contains("failed ")
                    || s.contains("assertion")
            },
            condition: "tests fail after the change",
            action: "run the affected tests before finishing and fix failures",
            outcome: "tests pass",
        },
        FailurePattern {
            check: |s| s.contains("lint") || s.contains("golangci") || s.contains("eslint") || s.contains("ruff"),
            condition: "lint errors introduced by the change",
            action: "run the linter on modified files and follow project style",
            outcome: "no new lint errors",
        },
    ];
    PATTERNS
}

/// Candidate learnings for a failed task, in pattern order, at most one
/// per failure kind.
pub fn analyze_failure(output: &str, error: &str) -> Vec<Learning> {
    let text = format!("{error}\n{output}").to_lowercase();
    patterns()
        .iter()
        .filter(|p| (p.check)(&text))
        .map(|p| Learning::new(p.condition, p.action, p.outcome))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_timeout() {
        let found = analyze_failure("", "runner exited with status 1: 401 Unauthorized");
        assert_eq!(found.len(), 1);
        assert!(found[0].condition.contains("authentication"));

        let found = analyze_failure("", "task timed out after 20m0s");
        assert!(found[0].condition.contains("time limit"));
    }

    #[test]
    fn multiple_kinds() {
        let found = analyze_failure("--- FAIL: TestX\nmain.go:3: undefined: foo", "quality gates failed");
        let conditions: Vec<&str> = found.iter().map(|l| l.condition.as_str()).collect();
        assert!(conditions.iter().any(|c| c.contains("build")));
        assert!(conditions.iter().any(|c| c.contains("tests")));
    }

    #[test]
    fn unknown_failure_has_no_suggestions() {
        assert!(analyze_failure("all fine", "something odd").is_empty());
    }

    #[tokio::test]
    async fn in_memory_store_ranks_by_overlap() {
        let store = InMemoryLearningStore::new();
        store.add(Learning::new("rate limit exceeded", "wait", "ok"));
        store.add(Learning::new("database migration fails", "run migrate", "ok"));
        let found = store.on_failure("API rate limit exceeded (429)").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].learning.action, "wait");
        assert!(store.retrieve("", 5).await.unwrap().is_empty());
        assert_eq!(
            store.retrieve("migration of the database", 5).await.unwrap()[0].learning.action,
            "run migrate"
        );
    }

    #[test]
    fn render_form() {
        assert_eq!(Learning::new("a", "b", "c").render(), "WHEN a DO b RESULT c");
    }
}
