//! Per-agent retry policy with escalation.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use alphie_core::AgentId;

use crate::learnings::LearningStore;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDecision {
    Retry,
    Escalate,
    Abort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    RetryOriginal,
    ApplyLearning,
    RetryWithContext,
    SimplifyApproach,
    DecomposeTask,
    EscalateToHuman,
}

impl RetryStrategy {
    const PROGRESSION: [RetryStrategy; 3] = [
        RetryStrategy::RetryWithContext,
        RetryStrategy::SimplifyApproach,
        RetryStrategy::DecomposeTask,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RetryOriginal => "retry_original",
            Self::ApplyLearning => "apply_learning",
            Self::RetryWithContext => "retry_with_context",
            Self::SimplifyApproach => "simplify_approach",
            Self::DecomposeTask => "decompose_task",
            Self::EscalateToHuman => "escalate_to_human",
        }
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller should do for the next attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryContext {
    pub agent_id: AgentId,
    pub attempt: u32,
    pub max_attempts: u32,
    pub strategy: RetryStrategy,
    pub last_error: String,
    /// Action of the best matching learning, if one applied.
    pub suggested_fix: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationContext {
    pub agent_id: AgentId,
    pub attempts: u32,
    pub error_history: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub needs_learning: bool,
}

#[derive(Default)]
struct History {
    attempts: u32,
    errors: Vec<String>,
}

pub struct RetryHandler {
    max_attempts: u32,
    learnings: Option<Arc<dyn LearningStore>>,
    state: DashMap<AgentId, History>,
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryHandler {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            learnings: None,
            state: DashMap::new(),
        }
    }

    pub fn with_learnings(mut self, store: Arc<dyn LearningStore>) -> Self {
        self.learnings = Some(store);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Record a failure and decide what happens next.
    ///
    /// A cancelled `cancel` token aborts without recording the attempt.
    pub async fn handle_failure(
        &self,
        cancel: &CancellationToken,
        agent_id: &AgentId,
        error: &str,
    ) -> (RetryContext, RetryDecision) {
        let mut ctx = RetryContext {
            agent_id: agent_id.clone(),
            attempt: 0,
            max_attempts: self.max_attempts,
            strategy: RetryStrategy::RetryOriginal,
            last_error: error.to_string(),
            suggested_fix: None,
        };
        if cancel.is_cancelled() {
            ctx.attempt = self.attempts(agent_id);
            debug!(agent_id = %agent_id, "retry aborted: cancelled");
            return (ctx, RetryDecision::Abort);
        }

        let attempt = {
            let mut history = self.state.entry(agent_id.clone()).or_default();
            history.attempts += 1;
            history.errors.push(error.to_string());
            history.attempts
        };
        ctx.attempt = attempt;

        if attempt >= self.max_attempts {
            ctx.strategy = RetryStrategy::EscalateToHuman;
            warn!(agent_id = %agent_id, attempt, "retries exhausted, escalating");
            return (ctx, RetryDecision::Escalate);
        }
        if attempt == 1 {
            info!(agent_id = %agent_id, attempt, strategy = %ctx.strategy, "retrying");
            return (ctx, RetryDecision::Retry);
        }

        if let Some(store) = &self.learnings {
            match store.on_failure(error).await {
                Ok(matches) => {
                    if let Some(best) = matches.into_iter().next() {
                        ctx.strategy = RetryStrategy::ApplyLearning;
                        ctx.suggested_fix = Some(best.learning.action);
                    }
                }
                Err(e) => warn!(agent_id = %agent_id, error = %e, "learning lookup failed"),
            }
        }
        if ctx.suggested_fix.is_none() {
            let idx = ((attempt - 2) as usize).min(RetryStrategy::PROGRESSION.len() - 1);
            ctx.strategy = RetryStrategy::PROGRESSION[idx];
        }
        info!(agent_id = %agent_id, attempt, strategy = %ctx.strategy, "retrying");
        (ctx, RetryDecision::Retry)
    }

    pub fn on_escalate(&self, agent_id: &AgentId) -> EscalationContext {
        let (attempts, error_history) = self
            .state
            .get(agent_id)
            .map(|h| (h.attempts, h.errors.clone()))
            .unwrap_or_default();
        EscalationContext {
            agent_id: agent_id.clone(),
            attempts,
            error_history,
            timestamp: Utc::now(),
            needs_learning: true,
        }
    }

    pub fn attempts(&self, agent_id: &AgentId) -> u32 {
        self.state.get(agent_id).map_or(0, |h| h.attempts)
    }

    /// Forget an agent's history, e.g. after it succeeds.
    pub fn reset(&self, agent_id: &AgentId) {
        let _ = self.state.remove(agent_id);
    }
}
