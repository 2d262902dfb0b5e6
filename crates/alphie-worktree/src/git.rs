//! Thin async wrapper over the `git` CLI plus porcelain parsing.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::trace;

use crate::error::{Result, WorktreeError};

/// Branch prefixes that mark a worktree as managed by alphie.
pub const RESERVED_PREFIXES: &[&str] = &["agent-", "alphie/", "session-"];

/// Run `git <args>` in `dir`, returning stdout on success.
pub(crate) async fn git<I, S>(dir: &Path, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let args: Vec<std::ffi::OsString> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
    let command = args
        .iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    trace!(dir = %dir.display(), %command, "git");

    let output = Command::new("git")
        .args(&args)
        .current_dir(dir)
        .output()
        .await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(WorktreeError::Git {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// One entry of `git worktree list --porcelain`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    /// Short branch name, without `refs/heads/`.
    pub branch: Option<String>,
    pub locked: bool,
    pub prunable: bool,
    pub bare: bool,
    pub detached: bool,
}

impl WorktreeEntry {
    /// Whether the branch carries one of the reserved prefixes.
    pub fn is_managed(&self) -> bool {
        self.branch
            .as_deref()
            .is_some_and(|b| RESERVED_PREFIXES.iter().any(|p| b.starts_with(p)))
    }

    /// Session id encoded in a managed branch name, e.g. `agent-abc` → `abc`.
    pub fn session_id(&self) -> Option<&str> {
        self.branch.as_deref().and_then(session_id_from_branch)
    }
}

pub fn session_id_from_branch(branch: &str) -> Option<&str> {
    RESERVED_PREFIXES.iter().find_map(|prefix| {
        let rest = branch.strip_prefix(prefix)?;
        let id = rest.split('/').next().unwrap_or(rest);
        (!id.is_empty()).then_some(id)
    })
}

/// Parse `git worktree list --porcelain`. The first entry is the main
/// working tree.
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            continue;
        }
        let (key, value) = line.split_once(' ').unwrap_or((line, ""));
        if key == "worktree" {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(value),
                ..WorktreeEntry::default()
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        match key {
            "HEAD" => entry.head = Some(value.to_string()),
            "branch" => {
                entry.branch = Some(value.strip_prefix("refs/heads/").unwrap_or(value).to_string());
            }
            "locked" => entry.locked = true,
            "prunable" => entry.prunable = true,
            "bare" => entry.bare = true,
            "detached" => entry.detached = true,
            _ => {}
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

/// Paths from `git status --porcelain`, renames resolved to their target.
pub fn parse_status_paths(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|l| l.len() > 3)
        .map(|l| {
            let path = &l[3..];
            let path = path.rsplit_once(" -> ").map_or(path, |(_, to)| to);
            path.trim_matches('"').to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = "worktree /repo
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /wt/agent-a
HEAD 2222222222222222222222222222222222222222
branch refs/heads/agent-a
locked

worktree /wt/feature-x
HEAD 3333333333333333333333333333333333333333
branch refs/heads/feature-x

worktree /wt/detached
HEAD 4444444444444444444444444444444444444444
detached
prunable gitdir file points to non-existent location
";

    #[test]
    fn parses_porcelain_list() {
        let entries = parse_worktree_list(LIST);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].path, PathBuf::from("/repo"));
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert!(entries[1].locked);
        assert!(entries[1].is_managed());
        assert_eq!(entries[1].session_id(), Some("a"));
        assert!(!entries[2].is_managed());
        assert!(entries[3].detached && entries[3].prunable);
        assert!(entries[3].branch.is_none());
    }

    #[test]
    fn session_ids_for_each_prefix() {
        assert_eq!(session_id_from_branch("agent-123"), Some("123"));
        assert_eq!(session_id_from_branch("session-xyz"), Some("xyz"));
        assert_eq!(session_id_from_branch("alphie/s1/task"), Some("s1"));
        assert_eq!(session_id_from_branch("agent-"), None);
        assert_eq!(session_id_from_branch("main"), None);
    }

    #[test]
    fn status_paths() {
        let out = " M src/lib.rs\n?? new.txt\nR  old.rs -> renamed.rs\nA  \"spaced name.txt\"\n";
        assert_eq!(
            parse_status_paths(out),
            vec!["src/lib.rs", "new.txt", "renamed.rs", "spaced name.txt"]
        );
    }
}
