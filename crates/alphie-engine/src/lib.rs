//! # alphie-engine
//!
//! Task execution for a single agent: lifecycle tracking, model selection,
//! prompt assembly, the streaming runner pipeline with startup retry and
//! token metering, verification contracts, the critique loop, timeouts,
//! retry escalation, and failure learnings.

pub mod contract;
pub mod critique;
pub mod error;
pub mod executor;
pub mod iteration;
pub mod learnings;
pub mod lifecycle;
pub mod model;
pub mod prompt;
pub mod ralph;
pub mod retry;
pub mod task;
pub mod timeout;

pub use contract::{
    refine_monotonic, Check, CheckResult, ContractGenerator, ContractSession, ContractStore,
    IntentContractGenerator, Refinement, VerificationContract, VerificationReport,
};
pub use critique::{parse_critique, parse_score, CritiquePrompt, CritiqueResult, RubricScore};
pub use error::{format_duration, AgentError, ContractError, EngineError, RalphError, ScoreError};
pub use executor::{
    EngineConfig, ExecuteOptions, ExecutionEngine, ExecutionResult, ProgressCallback, ProgressUpdate,
};
pub use iteration::IterationController;
pub use learnings::{analyze_failure, InMemoryLearningStore, Learning, LearningError, LearningMatch, LearningStore};
pub use lifecycle::{Agent, AgentManager, AgentStatus, LifecycleEvent, LifecycleEventKind, LifecycleHandler};
pub use model::select_model;
pub use prompt::{build_agent_prompt, ProjectStructure, PromptContext, StructureCache};
pub use ralph::{ExitReason, RalphLoop, RalphOutcome};
pub use retry::{EscalationContext, RetryContext, RetryDecision, RetryHandler, RetryStrategy};
pub use task::Task;
pub use timeout::{TimeoutAction, TimeoutEvent, TimeoutHandler};
