use std::time::Duration;

use alphie_core::AgentId;
use alphie_runner::RunnerError;
use alphie_worktree::WorktreeError;

use crate::lifecycle::AgentStatus;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    #[error("agent not found: {0}")]
    NotFound(AgentId),

    #[error("agent already exists: {0}")]
    AlreadyExists(AgentId),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: AgentStatus, to: AgentStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScoreError {
    #[error("malformed critique response: {0}")]
    MalformedResponse(String),

    #[error("missing score: {0}")]
    MissingScore(&'static str),

    #[error("score out of range: {field}={value} (expected 1-3)")]
    ScoreOutOfRange { field: &'static str, value: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("contract io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("contract json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("refinement drops {0} draft check(s)")]
    Weakened(usize),

    #[error("contract generation failed: {0}")]
    Generation(String),

    #[error("task id {0:?} is not usable as a contract directory name")]
    InvalidTaskId(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RalphError {
    #[error("no runner factory configured")]
    NoRunnerFactory,

    #[error("critique runner failed: {0}")]
    Runner(#[from] RunnerError),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Ralph(#[from] RalphError),

    #[error("task timed out after {}", format_duration(*.0))]
    Timeout(Duration),

    #[error("quality gates failed (regression detected or new failures)")]
    GatesFailed,

    #[error("verification contract failed")]
    VerificationFailed,

    #[error("task cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

/// `1h2m3s`, `20m0s`, `45s`, `500ms`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return format!("{}ms", d.as_millis());
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{s}s"),
        (0, m) => format!("{m}m{s}s"),
        (h, m) => format!("{h}h{m}m{s}s"),
    }
}
