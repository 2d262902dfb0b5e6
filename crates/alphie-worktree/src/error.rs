use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("refusing to remove the main repository at {}", .0.display())]
    MainRepository(PathBuf),

    #[error("worktree io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;
