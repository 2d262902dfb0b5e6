//! # alphie-worktree
//!
//! Per-agent isolated working copies backed by `git worktree`.
//!
//! Each agent gets `<base>/agent-<id>` on branch `agent-<id>`. Worktrees on
//! branches with a reserved prefix (`agent-`, `alphie/`, `session-`) are
//! managed and eligible for orphan cleanup; everything else, the main
//! repository included, is left alone.

pub mod error;
pub mod git;
pub mod manager;

pub use error::{Result, WorktreeError};
pub use git::{session_id_from_branch, WorktreeEntry, RESERVED_PREFIXES};
pub use manager::{CommitOutcome, WorkingCopies, Worktree, WorktreeManager};
