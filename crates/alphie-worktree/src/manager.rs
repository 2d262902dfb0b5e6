//! Git worktree manager giving each agent an isolated sibling directory.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, WorktreeError};
use crate::git::{git, parse_status_paths, parse_worktree_list, WorktreeEntry};

/// A worktree created for one agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of [`WorkingCopies::commit_all`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(String),
    NoChanges,
}

/// The working-copy operations the execution engine depends on.
#[async_trait]
pub trait WorkingCopies: Send + Sync {
    async fn create(&self, agent_id: &str) -> Result<Worktree>;
    async fn remove(&self, path: &Path, force: bool) -> Result<()>;
    async fn modified_files(&self, path: &Path) -> Result<Vec<String>>;
    async fn commit_all(&self, path: &Path, message: &str) -> Result<CommitOutcome>;
}

pub struct WorktreeManager {
    repo_path: PathBuf,
    base_dir: PathBuf,
    lock: Mutex<()>,
}

impl WorktreeManager {
    pub fn new(repo_path: impl Into<PathBuf>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            base_dir: base_dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create `<base>/agent-<id>` on a new branch `agent-<id>`.
    pub async fn create(&self, agent_id: &str) -> Result<Worktree> {
        let _guard = self.lock.lock().await;
        let name = format!("agent-{agent_id}");
        let path = self.base_dir.join(&name);

        tokio::fs::create_dir_all(&self.base_dir).await?;
        let _ = git(
            &self.repo_path,
            [
                OsStr::new("worktree"),
                OsStr::new("add"),
                OsStr::new("-b"),
                OsStr::new(&name),
                path.as_os_str(),
            ],
        )
        .await?;

        info!(agent_id, path = %path.display(), "worktree created");
        Ok(Worktree {
            path,
            branch: name,
            agent_id: agent_id.to_string(),
            created_at: Utc::now(),
        })
    }

    pub async fn remove(&self, path: &Path, force: bool) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.remove_unlocked(path, force).await
    }

    async fn remove_unlocked(&self, path: &Path, force: bool) -> Result<()> {
        if same_path(path, &self.repo_path) {
            return Err(WorktreeError::MainRepository(path.to_path_buf()));
        }
        let mut args = vec![OsStr::new("worktree"), OsStr::new("remove")];
        if force {
            args.push(OsStr::new("--force"));
        }
        args.push(path.as_os_str());
        let _ = git(&self.repo_path, args).await?;
        info!(path = %path.display(), "worktree removed");
        Ok(())
    }

    pub async fn unlock(&self, path: &Path) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.unlock_unlocked(path).await
    }

    async fn unlock_unlocked(&self, path: &Path) -> Result<()> {
        let _ = git(
            &self.repo_path,
            [OsStr::new("worktree"), OsStr::new("unlock"), path.as_os_str()],
        )
        .await?;
        Ok(())
    }

    /// All worktrees known to git, main working tree first.
    pub async fn list(&self) -> Result<Vec<WorktreeEntry>> {
        let _guard = self.lock.lock().await;
        self.list_unlocked().await
    }

    async fn list_unlocked(&self) -> Result<Vec<WorktreeEntry>> {
        let out = git(&self.repo_path, ["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&out))
    }

    pub async fn prune(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.prune_unlocked().await
    }

    async fn prune_unlocked(&self) -> Result<()> {
        let _ = git(&self.repo_path, ["worktree", "prune"]).await?;
        Ok(())
    }

    /// Managed worktrees whose session id is not in `active`.
    pub async fn list_orphans(&self, active: &[String]) -> Result<Vec<WorktreeEntry>> {
        let _guard = self.lock.lock().await;
        self.list_orphans_unlocked(active).await
    }

    async fn list_orphans_unlocked(&self, active: &[String]) -> Result<Vec<WorktreeEntry>> {
        let active: HashSet<&str> = active.iter().map(String::as_str).collect();
        let entries = self.list_unlocked().await?;
        Ok(entries
            .into_iter()
            .enumerate()
            .filter(|(i, e)| *i != 0 && !same_path(&e.path, &self.repo_path))
            .map(|(_, e)| e)
            .filter(|e| e.is_managed())
            .filter(|e| e.session_id().is_some_and(|id| !active.contains(id)))
            .collect())
    }

    /// Remove every orphaned managed worktree, returning how many were
    /// removed. Falls back to deleting the directory when git refuses.
    pub async fn cleanup_orphans(
        &self,
        active: &[String],
        on_remove: Option<&(dyn Fn(&WorktreeEntry) + Send + Sync)>,
    ) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let orphans = self.list_orphans_unlocked(active).await?;
        let mut removed = 0;

        for orphan in &orphans {
            if orphan.locked {
                if let Err(e) = self.unlock_unlocked(&orphan.path).await {
                    debug!(path = %orphan.path.display(), error = %e, "unlock failed");
                }
            }
            let gone = match self.remove_unlocked(&orphan.path, true).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        path = %orphan.path.display(),
                        error = %e,
                        "git worktree remove failed, falling back to directory removal"
                    );
                    match tokio::fs::remove_dir_all(&orphan.path).await {
                        Ok(()) => true,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
                        Err(e) => {
                            warn!(path = %orphan.path.display(), error = %e, "failed to remove worktree directory");
                            false
                        }
                    }
                }
            };
            if gone {
                removed += 1;
                if let Some(cb) = on_remove {
                    cb(orphan);
                }
            }
        }

        if let Err(e) = self.prune_unlocked().await {
            warn!(error = %e, "worktree prune failed");
        }
        info!(removed, "orphan cleanup finished");
        Ok(removed)
    }

    /// Remove directories under the base dir that git no longer tracks.
    ///
    /// The base dir may be shared with other repositories, so a directory is
    /// only removed when it is not a live worktree of any repository: either
    /// it has no `.git` file or its `gitdir` pointer is dangling.
    pub async fn recover_orphaned(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let tracked: Vec<PathBuf> = self
            .list_unlocked()
            .await?
            .into_iter()
            .map(|e| e.path)
            .collect();

        let mut dir = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if tracked.iter().any(|t| same_path(t, &path)) || is_live_worktree(&path).await {
                continue;
            }
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    info!(path = %path.display(), "removed untracked worktree directory");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove directory"),
            }
        }
        if removed > 0 {
            if let Err(e) = self.prune_unlocked().await {
                warn!(error = %e, "worktree prune failed");
            }
        }
        Ok(removed)
    }

    /// Files changed in a worktree relative to its HEAD, untracked included.
    pub async fn modified_files(&self, path: &Path) -> Result<Vec<String>> {
        let out = git(path, ["status", "--porcelain", "--untracked-files=all"]).await?;
        Ok(parse_status_paths(&out))
    }

    /// Stage everything and commit. A clean tree yields `NoChanges`.
    pub async fn commit_all(&self, path: &Path, message: &str) -> Result<CommitOutcome> {
        let _ = git(path, ["add", "-A"]).await?;
        let status = git(path, ["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            debug!(path = %path.display(), "nothing to commit");
            return Ok(CommitOutcome::NoChanges);
        }
        let _ = git(path, ["commit", "-q", "-m", message]).await?;
        let sha = git(path, ["rev-parse", "HEAD"]).await?.trim().to_string();
        info!(path = %path.display(), %sha, "worktree committed");
        Ok(CommitOutcome::Committed(sha))
    }
}

#[async_trait]
impl WorkingCopies for WorktreeManager {
    async fn create(&self, agent_id: &str) -> Result<Worktree> {
        WorktreeManager::create(self, agent_id).await
    }

    async fn remove(&self, path: &Path, force: bool) -> Result<()> {
        WorktreeManager::remove(self, path, force).await
    }

    async fn modified_files(&self, path: &Path) -> Result<Vec<String>> {
        WorktreeManager::modified_files(self, path).await
    }

    async fn commit_all(&self, path: &Path, message: &str) -> Result<CommitOutcome> {
        WorktreeManager::commit_all(self, path, message).await
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

async fn is_live_worktree(path: &Path) -> bool {
    let Ok(contents) = tokio::fs::read_to_string(path.join(".git")).await else {
        return false;
    };
    contents
        .trim()
        .strip_prefix("gitdir:")
        .is_some_and(|gitdir| Path::new(gitdir.trim()).exists())
}
