//! The self-critique loop run after an agent's first pass.
//!
//! Each iteration verifies the contract, asks a fresh runner to critique the
//! current output, and decides whether to stop. The loop always ends with a
//! quality-gate evaluation of the working copy.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use alphie_core::{AgentId, TokenTracker};
use alphie_quality::{Baseline, FocusedTestSelector, GateEvaluation, QualityGates, DEFAULT_GATE_TIMEOUT};
use alphie_runner::{collect_text, RunnerFactory, StartOptions};

use crate::contract::VerificationContract;
use crate::critique::{parse_critique, CritiquePrompt, RubricScore};
use crate::error::RalphError;
use crate::executor::meter;
use crate::iteration::IterationController;
use crate::lifecycle::AgentManager;

/// Characters of focused test output carried into the next critique.
const FOCUSED_OUTPUT_CHARS: usize = 2_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    VerificationPassedAndThresholdMet,
    VerificationPassedScoreAcceptable,
    AgentDoneVerified,
    ScoreThresholdMet,
    MaxIterationsReached,
    ContextCancelled,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VerificationPassedAndThresholdMet => "verification_passed_and_threshold_met",
            Self::VerificationPassedScoreAcceptable => "verification_passed_score_acceptable",
            Self::AgentDoneVerified => "agent_done_verified",
            Self::ScoreThresholdMet => "score_threshold_met",
            Self::MaxIterationsReached => "max_iterations_reached",
            Self::ContextCancelled => "context cancelled",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct RalphOutcome {
    pub iterations: u32,
    pub exit_reason: ExitReason,
    pub score: Option<RubricScore>,
    /// Output after the last critique, including appended failure sections.
    pub output: String,
    /// Result of the last verification, unset when no contract ran.
    pub verify_passed: Option<bool>,
    pub gates: GateEvaluation,
}

impl RalphOutcome {
    pub fn gates_passed(&self) -> bool {
        self.gates.passed
    }
}

pub struct RalphLoop {
    work_dir: PathBuf,
    controller: IterationController,
    prompt: CritiquePrompt,
    gates: QualityGates,
    baseline: Option<Baseline>,
    contract: Option<VerificationContract>,
    verify_timeout: Duration,
    focused: Option<(FocusedTestSelector, Vec<String>)>,
    factory: Option<Arc<dyn RunnerFactory>>,
    model: Option<String>,
    agent: Option<(Arc<AgentManager>, AgentId)>,
    tracker: Option<Arc<TokenTracker>>,
}

impl RalphLoop {
    pub fn new(work_dir: impl Into<PathBuf>, controller: IterationController) -> Self {
        let work_dir = work_dir.into();
        Self {
            prompt: CritiquePrompt::new(controller.threshold()),
            gates: QualityGates::new(work_dir.clone()),
            work_dir,
            controller,
            baseline: None,
            contract: None,
            verify_timeout: DEFAULT_GATE_TIMEOUT,
            focused: None,
            factory: None,
            model: None,
            agent: None,
            tracker: None,
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn RunnerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_gates(mut self, gates: QualityGates) -> Self {
        self.gates = gates;
        self
    }

    pub fn with_baseline(mut self, baseline: Option<Baseline>) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn with_contract(mut self, contract: Option<VerificationContract>) -> Self {
        self.contract = contract;
        self
    }

    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    /// Run the narrowest tests covering `modified` every iteration.
    pub fn with_focused_tests(mut self, selector: FocusedTestSelector, modified: Vec<String>) -> Self {
        if !modified.is_empty() {
            self.focused = Some((selector, modified));
        }
        self
    }

    /// Mirror iteration and score into the agent record.
    pub fn with_agent(mut self, agents: Arc<AgentManager>, agent_id: AgentId) -> Self {
        self.agent = Some((agents, agent_id));
        self
    }

    /// Charge critique runs to the task's token tracker.
    pub fn with_tracker(mut self, tracker: Arc<TokenTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn controller(&self) -> &IterationController {
        &self.controller
    }

    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        initial_output: &str,
    ) -> Result<RalphOutcome, RalphError> {
        let factory = self.factory.clone().ok_or(RalphError::NoRunnerFactory)?;
        let threshold = self.controller.threshold();
        let mut output = initial_output.to_string();
        let mut score: Option<RubricScore> = None;
        let mut verify_passed: Option<bool> = None;
        let mut reason = ExitReason::MaxIterationsReached;

        while self.controller.max_iterations() > 0 {
            if !self.controller.should_continue(score.as_ref()) {
                reason = if self.controller.is_at_max() {
                    ExitReason::MaxIterationsReached
                } else {
                    ExitReason::ScoreThresholdMet
                };
                break;
            }
            self.controller.increment();
            let iteration = self.controller.iteration();

            if cancel.is_cancelled() {
                reason = ExitReason::ContextCancelled;
                break;
            }

            let report = match &self.contract {
                Some(contract) => Some(contract.verify(&self.work_dir, self.verify_timeout).await),
                None => None,
            };
            if let Some(report) = &report {
                verify_passed = Some(report.passed());
            }
            // No contract counts as passing for the exit decision.
            let verify_ok = report.as_ref().map_or(true, |r| r.passed());

            let focused_section = match &self.focused {
                Some((selector, modified)) => selector
                    .run(modified)
                    .await
                    .and_then(|run| run.failure_section(FOCUSED_OUTPUT_CHARS)),
                None => None,
            };

            let mut runner = factory.new_runner();
            runner
                .start_with_options(
                    &self.prompt.build(&output),
                    &self.work_dir,
                    StartOptions {
                        model: self.model.clone(),
                    },
                )
                .await?;
            let collected = tokio::select! {
                () = cancel.cancelled() => None,
                res = collect_text(runner.as_mut()) => Some(res),
            };
            let Some(collected) = collected else {
                let _ = runner.kill().await;
                reason = ExitReason::ContextCancelled;
                break;
            };
            let collected = collected?;
            if let Some(tracker) = &self.tracker {
                for event in &collected.events {
                    meter(tracker, event);
                }
            }
            let critique_text = collected.text();

            let parsed = match parse_critique(&critique_text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(iteration, error = %e, "unparseable critique, treating as unscored");
                    Default::default()
                }
            };
            score = parsed.score;
            if let Some((agents, id)) = &self.agent {
                let _ = agents.update_ralph(id, iteration, score);
            }
            debug!(
                iteration,
                score = score.map(|s| s.total()),
                done = parsed.is_done,
                verify_ok,
                "critique iteration"
            );

            let total = score.map(|s| s.total());
            let decision = if verify_ok && total.is_some_and(|t| t >= threshold) {
                Some(ExitReason::VerificationPassedAndThresholdMet)
            } else if verify_ok && total.is_some_and(|t| t + 1 >= threshold) {
                Some(ExitReason::VerificationPassedScoreAcceptable)
            } else if parsed.is_done && verify_ok {
                Some(ExitReason::AgentDoneVerified)
            } else if self.controller.is_at_max() {
                Some(ExitReason::MaxIterationsReached)
            } else {
                None
            };

            output = critique_text;
            if let Some(report) = report.filter(|r| !r.passed()) {
                output.push_str(&report.failure_section());
            }
            if let Some(section) = focused_section {
                output.push_str(&section);
            }

            if let Some(decision) = decision {
                reason = decision;
                break;
            }
        }

        let gates = self.gates.evaluate(self.baseline.as_ref()).await;
        info!(
            iterations = self.controller.iteration(),
            reason = %reason,
            gates_passed = gates.passed,
            "critique loop finished"
        );
        Ok(RalphOutcome {
            iterations: self.controller.iteration(),
            exit_reason: reason,
            score,
            output,
            verify_passed,
            gates,
        })
    }
}
