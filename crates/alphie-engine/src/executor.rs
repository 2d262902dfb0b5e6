//! Per-task execution pipeline.
//!
//! One call to [`ExecutionEngine::execute`] takes a task from a fresh
//! working copy to a committed branch: launch the runner (retrying hung
//! starts), meter tokens while streaming, optionally critique and verify,
//! gate, commit, log, and always remove the working copy.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use alphie_core::pricing::{format_cost, format_tokens};
use alphie_core::usage::{estimate_tokens, extract_usage};
use alphie_core::{AgentId, AggregateTracker, ModelPricing, StreamEvent, StreamEventKind, Tier, TokenTracker, TokenUsage};
use alphie_quality::{Baseline, FocusedTestSelector, GateSelection, QualityGates};
use alphie_runner::{Runner, RunnerError, RunnerFactory, StartOptions};
use alphie_settings::AlphieSettings;
use alphie_worktree::{CommitOutcome, WorkingCopies, Worktree};

use crate::contract::{ContractGenerator, ContractSession, ContractStore, IntentContractGenerator};
use crate::error::{format_duration, EngineError};
use crate::iteration::IterationController;
use crate::learnings::{analyze_failure, Learning, LearningStore};
use crate::lifecycle::AgentManager;
use crate::model::select_model;
use crate::prompt::{build_agent_prompt, PromptContext, StructureCache};
use crate::ralph::{ExitReason, RalphLoop};
use crate::task::Task;

/// Zero tokens after this long usually means the CLI never got going.
const SILENT_FAILURE_AFTER: Duration = Duration::from_secs(60);
const LEARNINGS_LIMIT: usize = 3;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub repo_path: PathBuf,
    pub task_timeout: Duration,
    pub startup_timeout: Duration,
    /// Retries after the first attempt.
    pub startup_retries: u32,
    pub retry_backoff: Duration,
    pub progress_interval: Duration,
    pub tick_interval: Duration,
    pub gate_selection: GateSelection,
    pub gate_timeout: Duration,
    pub pricing: HashMap<String, ModelPricing>,
}

impl EngineConfig {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self::from_settings(repo_path, &AlphieSettings::default())
    }

    pub fn from_settings(repo_path: impl Into<PathBuf>, settings: &AlphieSettings) -> Self {
        let exec = &settings.execution;
        Self {
            repo_path: repo_path.into(),
            task_timeout: exec.task_timeout(),
            startup_timeout: exec.startup_timeout(),
            startup_retries: exec.startup_retries,
            retry_backoff: exec.retry_backoff(),
            progress_interval: exec.progress_interval(),
            tick_interval: Duration::from_millis(100),
            gate_selection: GateSelection {
                test: settings.gates.test,
                build: settings.gates.build,
                lint: settings.gates.lint,
                typecheck: settings.gates.typecheck,
            },
            gate_timeout: settings.gates.timeout(),
            pricing: settings.pricing.clone(),
        }
    }
}

/// Snapshot handed to the progress callback.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressUpdate {
    pub task_id: alphie_core::TaskId,
    pub tokens: TokenUsage,
    pub cost: f64,
    pub elapsed: Duration,
    pub current_action: Option<String>,
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ExecuteOptions {
    pub tier: Option<Tier>,
    /// Reuse a caller-chosen agent id instead of a fresh one.
    pub agent_id: Option<AgentId>,
    pub ralph: bool,
    pub quality_gates: bool,
    pub baseline: Option<Baseline>,
    pub progress: Option<ProgressCallback>,
    pub cancel: Option<CancellationToken>,
}

#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub usage: TokenUsage,
    pub cost: f64,
    pub duration: Duration,
    pub agent_id: AgentId,
    pub worktree_path: PathBuf,
    pub model: String,
    pub log_file: Option<PathBuf>,
    pub suggested_learnings: Vec<Learning>,
    pub loop_iterations: Option<u32>,
    pub loop_exit_reason: Option<ExitReason>,
    /// Unset when the gates did not run.
    pub gates_passed: Option<bool>,
    /// Unset when no contract ran.
    pub verify_passed: Option<bool>,
}

impl ExecutionResult {
    pub fn gates_ok(&self) -> bool {
        self.gates_passed != Some(false)
    }

    pub fn verify_ok(&self) -> bool {
        self.verify_passed != Some(false)
    }
}

enum StreamEnd {
    Exited(Result<(), RunnerError>),
    StartupTimeout,
    Cancelled,
}

/// What one runner attempt left behind.
struct RunOutcome {
    result: Result<(), RunnerError>,
    stderr: String,
    cancelled: bool,
}

pub struct ExecutionEngine {
    config: EngineConfig,
    worktrees: Arc<dyn WorkingCopies>,
    factory: Arc<dyn RunnerFactory>,
    agents: Arc<AgentManager>,
    tokens: Arc<AggregateTracker>,
    contracts: Arc<dyn ContractGenerator>,
    learnings: Option<Arc<dyn LearningStore>>,
}

impl ExecutionEngine {
    pub fn new(
        config: EngineConfig,
        worktrees: Arc<dyn WorkingCopies>,
        factory: Arc<dyn RunnerFactory>,
    ) -> Self {
        Self {
            config,
            worktrees,
            factory,
            agents: Arc::new(AgentManager::new()),
            tokens: Arc::new(AggregateTracker::new()),
            contracts: Arc::new(IntentContractGenerator::new()),
            learnings: None,
        }
    }

    pub fn with_agents(mut self, agents: Arc<AgentManager>) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_contract_generator(mut self, generator: Arc<dyn ContractGenerator>) -> Self {
        self.contracts = generator;
        self
    }

    pub fn with_learnings(mut self, store: Arc<dyn LearningStore>) -> Self {
        self.learnings = Some(store);
        self
    }

    pub fn agents(&self) -> &Arc<AgentManager> {
        &self.agents
    }

    /// Usage across every task this engine ran.
    pub fn tokens(&self) -> &AggregateTracker {
        &self.tokens
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn tracker_for(&self, model: &str) -> TokenTracker {
        match self.config.pricing.get(model) {
            Some(pricing) => TokenTracker::with_pricing(model, *pricing),
            None => TokenTracker::new(model),
        }
    }

    /// Run `task` end to end.
    ///
    /// Only setup failures (no working copy, duplicate agent id) are
    /// returned as errors; everything after that is reported in the result.
    pub async fn execute(&self, task: &Task, opts: ExecuteOptions) -> Result<ExecutionResult, EngineError> {
        let started = Instant::now();
        let deadline = started + self.config.task_timeout;
        let log_path = self.log_path(task);
        let agent_id = opts.agent_id.clone().unwrap_or_default();

        let worktree = self.worktrees.create(agent_id.as_str()).await?;
        if let Err(e) = self
            .agents
            .create_with_id(agent_id.clone(), task.id.clone(), worktree.path.clone())
        {
            self.remove_worktree(&worktree).await;
            return Err(e.into());
        }
        info!(task_id = %task.id, agent_id = %agent_id, path = %worktree.path.display(), "task started");

        let cancel = opts
            .cancel
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        let deadline_guard = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                cancel.cancel();
            })
        };

        let mut result = self
            .run_pipeline(task, &opts, &agent_id, &worktree, started, deadline, &cancel)
            .await;
        deadline_guard.abort();

        result.duration = started.elapsed();
        match self.write_log(&log_path, task, &result) {
            Ok(()) => result.log_file = Some(log_path),
            Err(e) => warn!(task_id = %task.id, error = %e, "failed to write task log"),
        }
        self.remove_worktree(&worktree).await;
        info!(
            task_id = %task.id,
            agent_id = %agent_id,
            success = result.success,
            duration = %format_duration(result.duration),
            "task finished"
        );
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pipeline(
        &self,
        task: &Task,
        opts: &ExecuteOptions,
        agent_id: &AgentId,
        worktree: &Worktree,
        started: Instant,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let model = select_model(&task.title, &task.description, opts.tier);
        let tracker = Arc::new(self.tracker_for(&model));
        self.tokens.add(agent_id.as_str(), tracker.clone());
        let mut output = String::new();

        let mut result = ExecutionResult {
            success: false,
            output: String::new(),
            error: None,
            usage: TokenUsage::default(),
            cost: 0.0,
            duration: Duration::ZERO,
            agent_id: agent_id.clone(),
            worktree_path: worktree.path.clone(),
            model: model.clone(),
            log_file: None,
            suggested_learnings: Vec::new(),
            loop_iterations: None,
            loop_exit_reason: None,
            gates_passed: None,
            verify_passed: None,
        };

        let learnings = self.retrieve_learnings(task, &mut output).await;
        let structure = StructureCache::new(&self.config.repo_path).load_or_scan();
        let prompt = build_agent_prompt(
            task,
            &PromptContext {
                tier: opts.tier,
                structure: Some(&structure),
                learnings: &learnings,
            },
        );

        let mut contract = ContractSession::new(
            self.contracts.clone(),
            Some(ContractStore::new(&self.config.repo_path)),
            task.id.clone(),
            task.verification_intent.clone(),
            task.file_boundaries.clone(),
        );
        for note in contract.prepare().await {
            let _ = writeln!(output, "{note}");
        }

        let run = self
            .run_with_startup_retry(
                task,
                agent_id,
                &prompt,
                &model,
                &worktree.path,
                &tracker,
                started,
                cancel,
                opts.progress.as_ref(),
                &mut output,
            )
            .await;

        let usage = tracker.usage();
        let _ = self.agents.update_usage(agent_id, usage.total(), tracker.cost());

        let mut failure: Option<String> = None;
        match &run.result {
            Ok(()) if !run.cancelled => {
                if opts.ralph {
                    if let Err(e) = self
                        .run_ralph(
                            opts,
                            agent_id,
                            worktree,
                            &model,
                            &tracker,
                            &mut contract,
                            cancel,
                            &mut output,
                            &mut result,
                        )
                        .await
                    {
                        failure = Some(e.to_string());
                    }
                    let usage = tracker.usage();
                    let _ = self.agents.update_usage(agent_id, usage.total(), tracker.cost());
                } else {
                    self.verify_once(worktree, &mut contract, &mut output, &mut result).await;
                }
                self.auto_commit(task, worktree, &mut output).await;
            }
            Ok(()) => {}
            Err(e) => {
                let mut msg = e.to_string();
                let stderr = run.stderr.trim();
                if !stderr.is_empty() {
                    let _ = write!(msg, "\nstderr: {stderr}");
                }
                failure = Some(msg);
            }
        }

        if Instant::now() >= deadline {
            failure = Some(EngineError::Timeout(self.config.task_timeout).to_string());
        } else if run.cancelled && failure.is_none() {
            failure = Some(EngineError::Cancelled.to_string());
        }

        if failure.is_none() && opts.quality_gates && result.gates_passed.is_none() {
            let evaluation = QualityGates::new(worktree.path.clone())
                .with_selection(self.config.gate_selection)
                .with_timeout(self.config.gate_timeout)
                .evaluate(opts.baseline.as_ref())
                .await;
            result.gates_passed = Some(evaluation.passed);
            if !evaluation.passed {
                let _ = writeln!(output, "\n[gates]\n{}", evaluation.summary());
            }
        }

        if failure.is_none() {
            if !result.gates_ok() {
                failure = Some(EngineError::GatesFailed.to_string());
            } else if !result.verify_ok() {
                failure = Some(EngineError::VerificationFailed.to_string());
            }
        }

        let usage = tracker.usage();
        if let Some(err) = &mut failure {
            if usage.is_zero() && started.elapsed() > SILENT_FAILURE_AFTER {
                let _ = write!(
                    err,
                    "\nno tokens were used after {}; the runner may not have started, check CLI access and credentials",
                    format_duration(started.elapsed())
                );
            }
        }

        match &failure {
            None => {
                if let Err(e) = self.agents.complete(agent_id) {
                    warn!(agent_id = %agent_id, error = %e, "could not mark agent done");
                }
            }
            Some(err) => {
                if let Err(e) = self.agents.fail(agent_id, err) {
                    warn!(agent_id = %agent_id, error = %e, "could not mark agent failed");
                }
                result.suggested_learnings = analyze_failure(&output, err);
                warn!(task_id = %task.id, agent_id = %agent_id, error = %err, "task failed");
            }
        }

        result.success = failure.is_none();
        result.error = failure;
        result.usage = usage;
        result.cost = tracker.cost();
        result.output = output;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_with_startup_retry(
        &self,
        task: &Task,
        agent_id: &AgentId,
        prompt: &str,
        model: &str,
        work_dir: &Path,
        tracker: &TokenTracker,
        started: Instant,
        cancel: &CancellationToken,
        progress: Option<&ProgressCallback>,
        output: &mut String,
    ) -> RunOutcome {
        let retries = self.config.startup_retries;
        let mut last_progress: Option<Instant> = None;
        for attempt in 0..=retries {
            if attempt > 0 {
                let _ = writeln!(
                    output,
                    "[alphie] Retry attempt {attempt}/{retries}: no output within {}, restarting runner",
                    format_duration(self.config.startup_timeout)
                );
                tokio::select! {
                    () = cancel.cancelled() => {
                        return RunOutcome { result: Ok(()), stderr: String::new(), cancelled: true };
                    }
                    () = tokio::time::sleep(self.config.retry_backoff) => {}
                }
            }

            let mut runner = self.factory.new_runner();
            if let Err(e) = runner
                .start_with_options(
                    prompt,
                    work_dir,
                    StartOptions {
                        model: Some(model.to_string()),
                    },
                )
                .await
            {
                warn!(agent_id = %agent_id, attempt, error = %e, "runner failed to start");
                return RunOutcome {
                    result: Err(e),
                    stderr: runner.stderr(),
                    cancelled: false,
                };
            }
            if attempt == 0 {
                if let Err(e) = self.agents.start(agent_id, runner.pid()) {
                    warn!(agent_id = %agent_id, error = %e, "could not mark agent running");
                }
            }
            info!(agent_id = %agent_id, attempt, pid = runner.pid(), model, "runner started");

            let end = self
                .stream(task, runner.as_mut(), tracker, started, cancel, output, progress, &mut last_progress)
                .await;
            match end {
                StreamEnd::Exited(result) => {
                    return RunOutcome {
                        result,
                        stderr: runner.stderr(),
                        cancelled: false,
                    };
                }
                StreamEnd::Cancelled => {
                    return RunOutcome {
                        result: Ok(()),
                        stderr: runner.stderr(),
                        cancelled: true,
                    };
                }
                StreamEnd::StartupTimeout => {
                    warn!(agent_id = %agent_id, attempt, "runner produced no output, killed");
                }
            }
        }
        RunOutcome {
            result: Err(RunnerError::Failed(format!(
                "runner produced no output within {} after {} attempts",
                format_duration(self.config.startup_timeout),
                retries + 1
            ))),
            stderr: String::new(),
            cancelled: false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream(
        &self,
        task: &Task,
        runner: &mut dyn Runner,
        tracker: &TokenTracker,
        started: Instant,
        cancel: &CancellationToken,
        output: &mut String,
        progress: Option<&ProgressCallback>,
        last_progress: &mut Option<Instant>,
    ) -> StreamEnd {
        let Some(mut rx) = runner.output() else {
            return StreamEnd::Exited(runner.wait().await);
        };
        let attempt_started = Instant::now();
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut received = false;
        let mut assistant_text = false;
        let mut current_action: Option<String> = None;

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        received = true;
                        meter(tracker, &event);
                        append_event(output, &event, &mut assistant_text);
                        if event.tool_action.is_some() {
                            current_action.clone_from(&event.tool_action);
                        }
                        let due = last_progress.map_or(true, |t| t.elapsed() >= self.config.progress_interval);
                        if let (Some(progress), true) = (progress, due) {
                            *last_progress = Some(Instant::now());
                            progress(&ProgressUpdate {
                                task_id: task.id.clone(),
                                tokens: tracker.usage(),
                                cost: tracker.cost(),
                                elapsed: started.elapsed(),
                                current_action: current_action.clone(),
                            });
                        }
                    }
                    None => return StreamEnd::Exited(runner.wait().await),
                },
                _ = ticker.tick() => {
                    if cancel.is_cancelled() {
                        let _ = runner.kill().await;
                        return StreamEnd::Cancelled;
                    }
                    if !received && attempt_started.elapsed() >= self.config.startup_timeout {
                        let _ = runner.kill().await;
                        return StreamEnd::StartupTimeout;
                    }
                }
            }
        }
    }

    async fn retrieve_learnings(&self, task: &Task, output: &mut String) -> Vec<Learning> {
        let Some(store) = &self.learnings else {
            return Vec::new();
        };
        let query = format!("{} {}", task.title, task.description);
        match store.retrieve(&query, LEARNINGS_LIMIT).await {
            Ok(found) => found.into_iter().map(|m| m.learning).collect(),
            Err(e) => {
                let _ = writeln!(output, "[learnings] lookup failed: {e}");
                Vec::new()
            }
        }
    }

    async fn modified_files(&self, worktree: &Worktree, output: &mut String) -> Vec<String> {
        match self.worktrees.modified_files(&worktree.path).await {
            Ok(files) => files,
            Err(e) => {
                let _ = writeln!(output, "[alphie] could not list modified files: {e}");
                Vec::new()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_ralph(
        &self,
        opts: &ExecuteOptions,
        agent_id: &AgentId,
        worktree: &Worktree,
        model: &str,
        tracker: &Arc<TokenTracker>,
        contract: &mut ContractSession,
        cancel: &CancellationToken,
        output: &mut String,
        result: &mut ExecutionResult,
    ) -> Result<(), EngineError> {
        let modified = self.modified_files(worktree, output).await;
        let (final_contract, notes) = contract.finalize(&worktree.path, &modified).await;
        for note in notes {
            let _ = writeln!(output, "{note}");
        }

        let gates = QualityGates::new(worktree.path.clone())
            .with_selection(self.config.gate_selection)
            .with_timeout(self.config.gate_timeout);
        let mut ralph = RalphLoop::new(worktree.path.clone(), IterationController::for_tier(opts.tier))
            .with_factory(self.factory.clone())
            .with_model(model)
            .with_gates(gates)
            .with_baseline(opts.baseline.clone())
            .with_contract(final_contract)
            .with_verify_timeout(self.config.gate_timeout)
            .with_focused_tests(
                FocusedTestSelector::new(worktree.path.clone(), self.config.gate_timeout),
                modified,
            )
            .with_agent(self.agents.clone(), agent_id.clone())
            .with_tracker(tracker.clone());

        let initial = output.clone();
        let outcome = ralph.run(cancel, &initial).await?;
        let _ = writeln!(
            output,
            "\n[ralph] {} iteration(s), exit: {}",
            outcome.iterations, outcome.exit_reason
        );
        if outcome.iterations > 0 {
            let _ = writeln!(output, "{}", outcome.output.trim_end());
        }
        if !outcome.gates.passed {
            let _ = writeln!(output, "[gates]\n{}", outcome.gates.summary());
        }
        result.loop_iterations = Some(outcome.iterations);
        result.loop_exit_reason = Some(outcome.exit_reason);
        result.verify_passed = outcome.verify_passed;
        result.gates_passed = Some(outcome.gates.passed);
        Ok(())
    }

    /// Without the critique loop the final contract still runs once.
    async fn verify_once(
        &self,
        worktree: &Worktree,
        contract: &mut ContractSession,
        output: &mut String,
        result: &mut ExecutionResult,
    ) {
        let modified = self.modified_files(worktree, output).await;
        let (final_contract, notes) = contract.finalize(&worktree.path, &modified).await;
        for note in notes {
            let _ = writeln!(output, "{note}");
        }
        if let Some(contract) = final_contract {
            let report = contract.verify(&worktree.path, self.config.gate_timeout).await;
            result.verify_passed = Some(report.passed());
            output.push_str(&report.failure_section());
        }
    }

    async fn auto_commit(&self, task: &Task, worktree: &Worktree, output: &mut String) {
        let message = format!("Agent: {}", task.title);
        match self.worktrees.commit_all(&worktree.path, &message).await {
            Ok(CommitOutcome::Committed(sha)) => {
                debug!(task_id = %task.id, %sha, "changes committed");
                let _ = writeln!(output, "[alphie] committed {} on {}", short_sha(&sha), worktree.branch);
            }
            Ok(CommitOutcome::NoChanges) => {
                let _ = writeln!(output, "[alphie] no changes to commit");
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "auto-commit failed");
                let _ = writeln!(output, "[alphie] auto-commit failed: {e}");
            }
        }
    }

    async fn remove_worktree(&self, worktree: &Worktree) {
        if let Err(e) = self.worktrees.remove(&worktree.path, true).await {
            warn!(path = %worktree.path.display(), error = %e, "failed to remove worktree");
        }
    }

    fn log_path(&self, task: &Task) -> PathBuf {
        self.config.repo_path.join(".alphie").join("logs").join(format!(
            "task-{}-{}.log",
            task.id.short(),
            Utc::now().format("%H%M%S")
        ))
    }

    fn write_log(&self, path: &Path, task: &Task, result: &ExecutionResult) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut log = String::new();
        let _ = writeln!(log, "Task: {}", task.id);
        let _ = writeln!(log, "Title: {}", task.title);
        if !task.description.is_empty() {
            let _ = writeln!(log, "Description: {}", task.description);
        }
        let _ = writeln!(log, "Agent: {}", result.agent_id);
        let _ = writeln!(log, "Model: {}", result.model);
        let _ = writeln!(log, "Worktree: {}", result.worktree_path.display());
        let _ = writeln!(log, "Finished: {}", Utc::now().to_rfc3339());
        let _ = writeln!(log, "Duration: {}", format_duration(result.duration));
        let _ = writeln!(
            log,
            "Tokens: {} (in {}, out {})",
            format_tokens(result.usage.total()),
            result.usage.input,
            result.usage.output
        );
        let _ = writeln!(log, "Cost: {}", format_cost(result.cost));
        if let (Some(n), Some(reason)) = (result.loop_iterations, result.loop_exit_reason) {
            let _ = writeln!(log, "Critique: {n} iteration(s), exit {reason}");
        }
        let _ = writeln!(log, "Gates: {}", tri_state(result.gates_passed));
        let _ = writeln!(log, "Verification: {}", tri_state(result.verify_passed));
        let _ = writeln!(log, "Success: {}", result.success);
        if let Some(err) = &result.error {
            let _ = writeln!(log, "Error: {err}");
        }
        let _ = writeln!(log, "\n--- output ---\n{}", result.output);
        std::fs::write(path, log)
    }
}

/// Fold one runner event into `tracker`: reported usage when the event
/// carries it, otherwise a soft estimate from assistant text.
pub(crate) fn meter(tracker: &TokenTracker, event: &StreamEvent) {
    match extract_usage(&event.raw) {
        Some(report) if report.cumulative => tracker.observe_total(report.usage),
        Some(report) => tracker.update(report.usage),
        None => {
            if event.kind == StreamEventKind::Assistant {
                if let Some(text) = &event.message {
                    tracker.update_soft(0, estimate_tokens(text));
                }
            }
        }
    }
}

fn append_event(output: &mut String, event: &StreamEvent, assistant_text: &mut bool) {
    let text = match event.kind {
        StreamEventKind::Assistant => {
            *assistant_text = true;
            event.message.as_deref()
        }
        StreamEventKind::Error => event.display_text(),
        // The result repeats the assistant text when there was any.
        StreamEventKind::Result if !*assistant_text => event.message.as_deref(),
        _ => None,
    };
    if let Some(text) = text.filter(|t| !t.is_empty()) {
        output.push_str(text);
        if !text.ends_with('\n') {
            output.push('\n');
        }
    }
}

fn tri_state(v: Option<bool>) -> &'static str {
    match v {
        None => "not run",
        Some(true) => "passed",
        Some(false) => "failed",
    }
}

fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}
