//! Verification contracts.
//!
//! A contract is drafted from the task's verification intent before the
//! agent runs, refined with the files it actually touched afterwards, and
//! executed by the critique loop. Refinement may only add checks: a
//! proposal that drops any draft check is rejected and the draft stands.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use alphie_core::TaskId;
use alphie_quality::{run_command, truncate_output, CommandSpec};

use crate::error::ContractError;

/// Per-command output kept in a failure report.
pub const MAX_FAILURE_OUTPUT: usize = 500;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Check {
    /// Shell command that must exit 0.
    Command { command: String },
    /// Path, relative to the working copy, that must exist.
    FileExists { path: String },
    /// Path that must not exist.
    FileAbsent { path: String },
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command { command } => write!(f, "`{command}`"),
            Self::FileExists { path } => write!(f, "{path} exists"),
            Self::FileAbsent { path } => write!(f, "{path} is absent"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationContract {
    pub task_id: TaskId,
    pub intent: String,
    pub checks: Vec<Check>,
    pub created_at: DateTime<Utc>,
}

impl VerificationContract {
    pub fn new(task_id: TaskId, intent: impl Into<String>) -> Self {
        Self {
            task_id,
            intent: intent.into(),
            checks: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Append `check` unless already present.
    pub fn push(&mut self, check: Check) -> bool {
        if self.checks.contains(&check) {
            return false;
        }
        self.checks.push(check);
        true
    }

    pub fn with_check(mut self, check: Check) -> Self {
        let _ = self.push(check);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn check_set(&self) -> BTreeSet<&Check> {
        self.checks.iter().collect()
    }

    /// Checks of `self` missing from `other`.
    pub fn dropped_by(&self, other: &VerificationContract) -> Vec<Check> {
        let kept = other.check_set();
        self.checks
            .iter()
            .filter(|c| !kept.contains(c))
            .cloned()
            .collect()
    }

    /// Run every check in `dir`.
    pub async fn verify(&self, dir: &Path, timeout: Duration) -> VerificationReport {
        let mut results = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            results.push(run_check(check, dir, timeout).await);
        }
        let report = VerificationReport { results };
        info!(
            task_id = %self.task_id,
            checks = self.checks.len(),
            failed = report.failures().count(),
            "verification finished"
        );
        report
    }
}

async fn run_check(check: &Check, dir: &Path, timeout: Duration) -> CheckResult {
    let (passed, output) = match check {
        Check::Command { command } => {
            let outcome = run_command(&CommandSpec::shell(command), dir, timeout).await;
            (outcome.success(), outcome.combined())
        }
        Check::FileExists { path } => {
            let exists = dir.join(path).exists();
            (exists, if exists { String::new() } else { format!("{path} does not exist") })
        }
        Check::FileAbsent { path } => {
            let exists = dir.join(path).exists();
            (!exists, if exists { format!("{path} should not exist") } else { String::new() })
        }
    };
    CheckResult {
        check: check.clone(),
        passed,
        output,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckResult {
    pub check: Check,
    pub passed: bool,
    pub output: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub results: Vec<CheckResult>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    /// Section appended to the next critique input, empty when everything
    /// passed.
    pub fn failure_section(&self) -> String {
        if self.passed() {
            return String::new();
        }
        let mut out = String::from("\n\n## Verification Failures\n");
        for failure in self.failures() {
            out.push_str(&format!("\n### {}\n", failure.check));
            if !failure.output.is_empty() {
                out.push_str(&format!(
                    "```\n{}\n```\n",
                    truncate_output(&failure.output, MAX_FAILURE_OUTPUT)
                ));
            }
        }
        out
    }
}

/// Outcome of a refinement attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum Refinement {
    Accepted(VerificationContract),
    /// The proposal dropped checks; the draft is kept.
    Rejected {
        kept: VerificationContract,
        dropped: Vec<Check>,
    },
}

impl Refinement {
    pub fn contract(&self) -> &VerificationContract {
        match self {
            Self::Accepted(c) => c,
            Self::Rejected { kept, .. } => kept,
        }
    }

    pub fn into_contract(self) -> VerificationContract {
        match self {
            Self::Accepted(c) => c,
            Self::Rejected { kept, .. } => kept,
        }
    }
}

/// Accept `proposed` only if it keeps every draft check.
pub fn refine_monotonic(draft: &VerificationContract, proposed: VerificationContract) -> Refinement {
    let dropped = draft.dropped_by(&proposed);
    if dropped.is_empty() {
        debug!(
            task_id = %draft.task_id,
            added = proposed.checks.len().saturating_sub(draft.checks.len()),
            "refinement accepted"
        );
        Refinement::Accepted(proposed)
    } else {
        warn!(task_id = %draft.task_id, dropped = dropped.len(), "refinement rejected: would weaken contract");
        Refinement::Rejected {
            kept: draft.clone(),
            dropped,
        }
    }
}

/// Draft and final contracts under `<repo>/.alphie/contracts/<task-id>/`.
#[derive(Clone, Debug)]
pub struct ContractStore {
    root: PathBuf,
}

impl ContractStore {
    pub fn new(repo: &Path) -> Self {
        Self {
            root: repo.join(".alphie").join("contracts"),
        }
    }

    /// Directory for `task_id`. Ids that are not a single plain path
    /// component would escape the contracts root and are rejected.
    pub fn dir_for(&self, task_id: &TaskId) -> Result<PathBuf, ContractError> {
        let id = task_id.as_str();
        let mut parts = Path::new(id).components();
        match (parts.next(), parts.next()) {
            (Some(Component::Normal(_)), None) if !id.contains(['/', '\\']) => Ok(self.root.join(id)),
            _ => Err(ContractError::InvalidTaskId(id.to_string())),
        }
    }

    pub fn save_draft(&self, contract: &VerificationContract) -> Result<PathBuf, ContractError> {
        self.save(contract, "draft.json")
    }

    pub fn save_final(&self, contract: &VerificationContract) -> Result<PathBuf, ContractError> {
        self.save(contract, "final.json")
    }

    pub fn load_draft(&self, task_id: &TaskId) -> Result<VerificationContract, ContractError> {
        self.load(task_id, "draft.json")
    }

    pub fn load_final(&self, task_id: &TaskId) -> Result<VerificationContract, ContractError> {
        self.load(task_id, "final.json")
    }

    fn save(&self, contract: &VerificationContract, name: &str) -> Result<PathBuf, ContractError> {
        let dir = self.dir_for(&contract.task_id)?;
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        std::fs::write(&path, serde_json::to_string_pretty(contract)?)?;
        Ok(path)
    }

    fn load(&self, task_id: &TaskId, name: &str) -> Result<VerificationContract, ContractError> {
        let raw = std::fs::read_to_string(self.dir_for(task_id)?.join(name))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Turns task intent into contracts.
#[async_trait]
pub trait ContractGenerator: Send + Sync {
    async fn draft(
        &self,
        task_id: &TaskId,
        intent: &str,
        boundaries: &[String],
    ) -> Result<VerificationContract, ContractError>;

    /// Propose a final contract once the modified files are known.
    async fn refine(
        &self,
        draft: &VerificationContract,
        work_dir: &Path,
        modified: &[String],
    ) -> Result<VerificationContract, ContractError>;
}

static BACKTICKED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`\n]+)`").unwrap());
static FILE_EXISTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bfile\s+`?([\w./-]+)`?\s+(?:exists|should exist|must exist)").unwrap()
});
static CREATES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bcreates?\s+(?:a\s+|an\s+|the\s+)?(?:new\s+)?(?:file\s+)?`?([\w./-]+\.\w+)`?").unwrap()
});
static REMOVES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:delete|remove)s?\s+(?:the\s+)?(?:file\s+)?`?([\w./-]+\.\w+)`?").unwrap()
});

fn is_glob(pattern: &str) -> bool {
    glob::Pattern::escape(pattern) != pattern
}

/// Rule-based generator reading back-quoted commands and simple file
/// phrasing out of the intent text.
#[derive(Clone, Debug, Default)]
pub struct IntentContractGenerator;

impl IntentContractGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn checks_from_intent(intent: &str) -> Vec<Check> {
        let mut paths = BTreeSet::new();
        let mut checks = Vec::new();

        for re in [&*FILE_EXISTS, &*CREATES] {
            for cap in re.captures_iter(intent) {
                let path = cap[1].trim_end_matches('.').to_string();
                if paths.insert(path.clone()) {
                    checks.push(Check::FileExists { path });
                }
            }
        }
        for cap in REMOVES.captures_iter(intent) {
            let path = cap[1].trim_end_matches('.').to_string();
            if paths.insert(path.clone()) {
                checks.push(Check::FileAbsent { path });
            }
        }
        for cap in BACKTICKED.captures_iter(intent) {
            let command = cap[1].trim();
            if command.is_empty() || paths.contains(command) {
                continue;
            }
            let check = Check::Command {
                command: command.to_string(),
            };
            if !checks.contains(&check) {
                checks.push(check);
            }
        }
        checks
    }
}

#[async_trait]
impl ContractGenerator for IntentContractGenerator {
    async fn draft(
        &self,
        task_id: &TaskId,
        intent: &str,
        boundaries: &[String],
    ) -> Result<VerificationContract, ContractError> {
        let mut contract = VerificationContract::new(task_id.clone(), intent);
        for check in Self::checks_from_intent(intent) {
            let _ = contract.push(check);
        }
        for boundary in boundaries.iter().filter(|b| !b.is_empty() && !is_glob(b)) {
            let _ = contract.push(Check::FileExists {
                path: boundary.trim_end_matches('/').to_string(),
            });
        }
        Ok(contract)
    }

    async fn refine(
        &self,
        draft: &VerificationContract,
        work_dir: &Path,
        modified: &[String],
    ) -> Result<VerificationContract, ContractError> {
        let mut refined = draft.clone();
        refined.created_at = Utc::now();
        for file in modified {
            if work_dir.join(file).is_file() {
                let _ = refined.push(Check::FileExists { path: file.clone() });
            }
        }
        Ok(refined)
    }
}

/// Draft-then-refine bookkeeping for one task.
///
/// Store and generator failures are soft: they are written to the notes
/// returned to the caller and the task carries on without a contract.
pub struct ContractSession {
    generator: Arc<dyn ContractGenerator>,
    store: Option<ContractStore>,
    task_id: TaskId,
    intent: String,
    boundaries: Vec<String>,
    draft: Option<VerificationContract>,
}

impl ContractSession {
    pub fn new(
        generator: Arc<dyn ContractGenerator>,
        store: Option<ContractStore>,
        task_id: TaskId,
        intent: impl Into<String>,
        boundaries: Vec<String>,
    ) -> Self {
        Self {
            generator,
            store,
            task_id,
            intent: intent.into(),
            boundaries,
            draft: None,
        }
    }

    pub fn draft(&self) -> Option<&VerificationContract> {
        self.draft.as_ref()
    }

    /// Generate and persist the draft. Returns notes for the output log.
    pub async fn prepare(&mut self) -> Vec<String> {
        let mut notes = Vec::new();
        match self
            .generator
            .draft(&self.task_id, &self.intent, &self.boundaries)
            .await
        {
            Ok(draft) if draft.is_empty() => {
                debug!(task_id = %self.task_id, "no verifiable intent, skipping contract");
            }
            Ok(draft) => {
                if let Some(store) = &self.store {
                    if let Err(e) = store.save_draft(&draft) {
                        notes.push(format!("[contract] failed to store draft: {e}"));
                    }
                }
                info!(task_id = %self.task_id, checks = draft.checks.len(), "contract drafted");
                self.draft = Some(draft);
            }
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "contract draft failed");
                notes.push(format!("[contract] draft generation failed: {e}"));
            }
        }
        notes
    }

    /// Produce the final contract from the modified files.
    ///
    /// Without a draft the final contract is generated directly.
    pub async fn finalize(
        &mut self,
        work_dir: &Path,
        modified: &[String],
    ) -> (Option<VerificationContract>, Vec<String>) {
        let mut notes = Vec::new();
        let final_contract = match &self.draft {
            Some(draft) => match self.generator.refine(draft, work_dir, modified).await {
                Ok(proposed) => match refine_monotonic(draft, proposed) {
                    Refinement::Accepted(c) => Some(c),
                    Refinement::Rejected { kept, dropped } => {
                        let dropped: Vec<String> = dropped.iter().map(ToString::to_string).collect();
                        notes.push(format!(
                            "[contract] refinement rejected, keeping draft (would drop: {})",
                            dropped.join(", ")
                        ));
                        Some(kept)
                    }
                },
                Err(e) => {
                    notes.push(format!("[contract] refinement failed, keeping draft: {e}"));
                    Some(draft.clone())
                }
            },
            None => match self
                .generator
                .draft(&self.task_id, &self.intent, &self.boundaries)
                .await
            {
                Ok(direct) if direct.is_empty() => None,
                Ok(direct) => match self.generator.refine(&direct, work_dir, modified).await {
                    Ok(proposed) => Some(refine_monotonic(&direct, proposed).into_contract()),
                    Err(_) => Some(direct),
                },
                Err(e) => {
                    notes.push(format!("[contract] generation failed: {e}"));
                    None
                }
            },
        };

        if let (Some(store), Some(contract)) = (&self.store, &final_contract) {
            if let Err(e) = store.save_final(contract) {
                notes.push(format!("[contract] failed to store final contract: {e}"));
            }
        }
        (final_contract, notes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn task() -> TaskId {
        TaskId::from("t-contract")
    }

    fn cmd(c: &str) -> Check {
        Check::Command { command: c.into() }
    }

    #[test]
    fn intent_parsing() {
        let checks = IntentContractGenerator::checks_from_intent(
            "Run `go test ./...` and `make lint`. The file docs/API.md exists, \
             create `cmd/tool/main.go` and delete old/legacy.go.",
        );
        assert!(checks.contains(&cmd("go test ./...")));
        assert!(checks.contains(&cmd("make lint")));
        assert!(checks.contains(&Check::FileExists { path: "docs/API.md".into() }));
        assert!(checks.contains(&Check::FileExists { path: "cmd/tool/main.go".into() }));
        assert!(checks.contains(&Check::FileAbsent { path: "old/legacy.go".into() }));
        assert!(!checks.contains(&cmd("cmd/tool/main.go")));
    }

    #[tokio::test]
    async fn draft_skips_glob_boundaries() {
        let gen = IntentContractGenerator::new();
        let draft = gen
            .draft(&task(), "", &["src/lib.rs".into(), "src/**/*.rs".into()])
            .await
            .unwrap();
        assert_eq!(draft.checks, vec![Check::FileExists { path: "src/lib.rs".into() }]);
    }

    #[tokio::test]
    async fn refine_adds_existing_modified_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.go"), "package a").unwrap();
        let gen = IntentContractGenerator::new();
        let draft = VerificationContract::new(task(), "x").with_check(cmd("true"));
        let refined = gen
            .refine(&draft, dir.path(), &["a.go".into(), "gone.go".into()])
            .await
            .unwrap();
        assert_eq!(refined.checks.len(), 2);
        assert!(matches!(refine_monotonic(&draft, refined), Refinement::Accepted(_)));
    }

    #[test]
    fn weakening_is_rejected() {
        let draft = VerificationContract::new(task(), "x")
            .with_check(cmd("make test"))
            .with_check(cmd("make lint"));
        let weaker = VerificationContract::new(task(), "x").with_check(cmd("make test"));
        match refine_monotonic(&draft, weaker) {
            Refinement::Rejected { kept, dropped } => {
                assert_eq!(kept, draft);
                assert_eq!(dropped, vec![cmd("make lint")]);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn verify_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present.txt"), "").unwrap();
        let contract = VerificationContract::new(task(), "x")
            .with_check(cmd("true"))
            .with_check(cmd("echo boom; exit 3"))
            .with_check(Check::FileExists { path: "present.txt".into() })
            .with_check(Check::FileExists { path: "missing.txt".into() })
            .with_check(Check::FileAbsent { path: "present.txt".into() });
        let report = contract.verify(dir.path(), Duration::from_secs(10)).await;
        assert!(!report.passed());
        assert_eq!(report.failures().count(), 3);
        let section = report.failure_section();
        assert!(section.contains("## Verification Failures"));
        assert!(section.contains("boom"));
        assert!(section.contains("missing.txt does not exist"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failure_output_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let contract = VerificationContract::new(task(), "x")
            .with_check(cmd("printf '%01000d' 0; exit 1"));
        let report = contract.verify(dir.path(), Duration::from_secs(10)).await;
        let section = report.failure_section();
        assert!(section.contains("(truncated)"));
        assert!(section.len() < 800);
    }

    #[test]
    fn store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContractStore::new(dir.path());
        let contract = VerificationContract::new(task(), "x").with_check(cmd("make"));
        let path = store.save_draft(&contract).unwrap();
        assert!(path.ends_with(".alphie/contracts/t-contract/draft.json"));
        assert_eq!(store.load_draft(&task()).unwrap(), contract);
        assert!(store.load_final(&task()).is_err());
    }

    #[test]
    fn store_rejects_ids_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContractStore::new(&dir.path().join("repo"));
        for id in ["../x", "..", "a/b", "a\\b", "/abs", ""] {
            let contract = VerificationContract::new(TaskId::from(id), "x").with_check(cmd("make"));
            assert!(
                matches!(store.save_final(&contract), Err(ContractError::InvalidTaskId(_))),
                "{id:?} was accepted"
            );
            assert!(matches!(store.load_final(&TaskId::from(id)), Err(ContractError::InvalidTaskId(_))));
        }
        assert!(!dir.path().join("x").exists());
        assert!(!dir.path().join("repo").join(".alphie").join("x").exists());
        assert!(store.dir_for(&TaskId::from("task-1.v2")).is_ok());
    }

    struct Weakening;

    #[async_trait]
    impl ContractGenerator for Weakening {
        async fn draft(
            &self,
            task_id: &TaskId,
            _: &str,
            _: &[String],
        ) -> Result<VerificationContract, ContractError> {
            Ok(VerificationContract::new(task_id.clone(), "x").with_check(cmd("make test")))
        }

        async fn refine(
            &self,
            draft: &VerificationContract,
            _: &Path,
            _: &[String],
        ) -> Result<VerificationContract, ContractError> {
            Ok(VerificationContract::new(draft.task_id.clone(), "x"))
        }
    }

    #[tokio::test]
    async fn session_keeps_draft_and_logs_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContractStore::new(dir.path());
        let mut session = ContractSession::new(Arc::new(Weakening), Some(store.clone()), task(), "x", vec![]);
        assert!(session.prepare().await.is_empty());
        let (contract, notes) = session.finalize(dir.path(), &[]).await;
        assert_eq!(contract.unwrap().checks, vec![cmd("make test")]);
        assert!(notes[0].contains("refinement rejected"));
        assert_eq!(store.load_final(&task()).unwrap().checks, vec![cmd("make test")]);
    }

    #[tokio::test]
    async fn session_without_intent_has_no_contract() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = ContractSession::new(
            Arc::new(IntentContractGenerator::new()),
            None,
            task(),
            "make it nicer",
            vec![],
        );
        let _ = session.prepare().await;
        assert!(session.draft().is_none());
        let (contract, _) = session.finalize(dir.path(), &[]).await;
        assert!(contract.is_none());
    }

    fn arb_check() -> impl Strategy<Value = Check> {
        prop_oneof![
            "[a-z]{1,6}".prop_map(|c| Check::Command { command: c }),
            "[a-z]{1,6}".prop_map(|p| Check::FileExists { path: p }),
            "[a-z]{1,6}".prop_map(|p| Check::FileAbsent { path: p }),
        ]
    }

    proptest! {
        #[test]
        fn refinement_never_weakens(
            draft_checks in proptest::collection::vec(arb_check(), 0..6),
            proposed_checks in proptest::collection::vec(arb_check(), 0..6),
        ) {
            let mut draft = VerificationContract::new(task(), "x");
            for c in draft_checks { let _ = draft.push(c); }
            let mut proposed = VerificationContract::new(task(), "x");
            for c in proposed_checks { let _ = proposed.push(c); }

            let outcome = refine_monotonic(&draft, proposed);
            let result = outcome.contract();
            prop_assert!(draft.check_set().is_subset(&result.check_set()));
            if let Refinement::Rejected { kept, dropped } = &outcome {
                prop_assert_eq!(kept, &draft);
                prop_assert!(!dropped.is_empty());
            }
        }
    }
}
