//! Agent-facing prompt and the cached project structure it embeds.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use alphie_core::Tier;

use crate::learnings::Learning;
use crate::task::Task;

/// How long a cached structure stays fresh.
pub const STRUCTURE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const SKIP_DIRS: &[&str] = &[
    ".git",
    ".alphie",
    "node_modules",
    "vendor",
    "target",
    "dist",
    "build",
    "__pycache__",
    ".venv",
];

const MAX_DEPTH: usize = 6;
const MAX_EXTENSIONS: usize = 3;

/// File counts and dominant extensions for one top-level directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirPattern {
    pub path: String,
    pub files: usize,
    pub extensions: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStructure {
    pub generated_at: DateTime<Utc>,
    pub directories: Vec<DirPattern>,
}

impl ProjectStructure {
    pub fn scan(repo: &Path) -> Self {
        let mut counts: BTreeMap<String, (usize, BTreeMap<String, usize>)> = BTreeMap::new();
        let walker = WalkDir::new(repo)
            .min_depth(1)
            .max_depth(MAX_DEPTH)
            .into_iter()
            .filter_entry(|e| {
                !(e.file_type().is_dir()
                    && e.file_name().to_str().is_some_and(|n| SKIP_DIRS.contains(&n)))
            });
        for entry in walker.flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(repo) else {
                continue;
            };
            let mut components = rel.components();
            let top = match (components.next(), components.next()) {
                (Some(first), Some(_)) => first.as_os_str().to_string_lossy().into_owned(),
                _ => ".".to_string(),
            };
            let ext = rel
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default();
            let slot = counts.entry(top).or_default();
            slot.0 += 1;
            if !ext.is_empty() {
                *slot.1.entry(ext).or_default() += 1;
            }
        }

        let directories = counts
            .into_iter()
            .map(|(path, (files, exts))| {
                let mut exts: Vec<(String, usize)> = exts.into_iter().collect();
                exts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                DirPattern {
                    path,
                    files,
                    extensions: exts.into_iter().take(MAX_EXTENSIONS).map(|(e, _)| e).collect(),
                }
            })
            .collect();
        Self {
            generated_at: Utc::now(),
            directories,
        }
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.generated_at);
        age.to_std().map_or(true, |age| age < ttl)
    }

    pub fn render(&self) -> String {
        self.directories
            .iter()
            .map(|d| {
                let label = if d.path == "." { "(root)".to_string() } else { format!("{}/", d.path) };
                if d.extensions.is_empty() {
                    format!("- {label} {} files", d.files)
                } else {
                    format!("- {label} {} files (.{})", d.files, d.extensions.join(", ."))
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// `<repo>/.alphie/structure_cache.json`.
#[derive(Clone, Debug)]
pub struct StructureCache {
    repo: std::path::PathBuf,
    ttl: Duration,
}

impl StructureCache {
    pub fn new(repo: &Path) -> Self {
        Self {
            repo: repo.to_path_buf(),
            ttl: STRUCTURE_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn path(&self) -> std::path::PathBuf {
        self.repo.join(".alphie").join("structure_cache.json")
    }

    /// Cached structure when fresh, otherwise a new scan written back.
    /// Cache I/O failures only cost a rescan.
    pub fn load_or_scan(&self) -> ProjectStructure {
        if let Some(cached) = self.read() {
            if cached.is_fresh(self.ttl) {
                debug!("structure cache hit");
                return cached;
            }
        }
        let structure = ProjectStructure::scan(&self.repo);
        if let Err(e) = self.write(&structure) {
            warn!(error = %e, "failed to write structure cache");
        }
        structure
    }

    fn read(&self) -> Option<ProjectStructure> {
        let raw = std::fs::read_to_string(self.path()).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn write(&self, structure: &ProjectStructure) -> std::io::Result<()> {
        let path = self.path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(structure).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}

const SCOPE_PREAMBLE: &str = "You are working in an isolated git worktree on a single task. \
Stay strictly within the scope of the task: do not refactor unrelated code, \
do not reformat files you did not need to change, and do not add features \
that were not asked for. When you are finished, leave the working tree in a \
state that builds and passes its tests.";

fn tier_guidance(tier: Option<Tier>) -> &'static str {
    match tier {
        Some(Tier::Architect) => {
            "This is an architect-level task. Plan the change before editing, keep \
             interfaces coherent across modules, and cover the new behavior with tests."
        }
        Some(Tier::Builder) => {
            "This is a builder-level task. Implement the feature completely, including \
             error handling and tests for the main paths."
        }
        Some(Tier::Scout) | None => {
            "This is a scout-level task. Make the smallest change that solves it."
        }
    }
}

/// Everything the agent prompt is assembled from.
#[derive(Clone, Debug, Default)]
pub struct PromptContext<'a> {
    pub tier: Option<Tier>,
    pub structure: Option<&'a ProjectStructure>,
    pub learnings: &'a [Learning],
}

pub fn build_agent_prompt(task: &Task, ctx: &PromptContext<'_>) -> String {
    let mut sections = vec![SCOPE_PREAMBLE.to_string()];

    let mut meta = format!("## Task\n\nID: {}\nTitle: {}", task.id, task.title);
    if !task.description.trim().is_empty() {
        meta.push_str(&format!("\n\n{}", task.description.trim()));
    }
    sections.push(meta);

    if !task.file_boundaries.is_empty() {
        let list: Vec<String> = task.file_boundaries.iter().map(|b| format!("- {b}")).collect();
        sections.push(format!(
            "## File Boundaries\n\nOnly modify files matching:\n{}",
            list.join("\n")
        ));
    }

    if !task.verification_intent.trim().is_empty() {
        sections.push(format!(
            "## Verification\n\nYour work will be checked against:\n{}",
            task.verification_intent.trim()
        ));
    }

    sections.push(format!("## Guidance\n\n{}", tier_guidance(ctx.tier)));

    if let Some(structure) = ctx.structure {
        if !structure.directories.is_empty() {
            sections.push(format!("## Project Layout\n\n{}", structure.render()));
        }
    }

    if !ctx.learnings.is_empty() {
        let list: Vec<String> = ctx.learnings.iter().map(|l| format!("- {}", l.render())).collect();
        sections.push(format!("## Learnings From Past Tasks\n\n{}", list.join("\n")));
    }

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src/api")).unwrap();
        fs::create_dir_all(root.join("node_modules/x")).unwrap();
        fs::write(root.join("src/main.go"), "").unwrap();
        fs::write(root.join("src/api/h.go"), "").unwrap();
        fs::write(root.join("src/api/h.md"), "").unwrap();
        fs::write(root.join("node_modules/x/i.js"), "").unwrap();
        fs::write(root.join("go.mod"), "").unwrap();
        dir
    }

    #[test]
    fn scan_groups_by_top_level_dir() {
        let dir = fixture();
        let s = ProjectStructure::scan(dir.path());
        let paths: Vec<&str> = s.directories.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec![".", "src"]);
        let src = &s.directories[1];
        assert_eq!(src.files, 3);
        assert_eq!(src.extensions, vec!["go", "md"]);
        assert!(s.render().contains("- src/ 3 files (.go, .md)"));
    }

    #[test]
    fn cache_is_reused_until_stale() {
        let dir = fixture();
        let cache = StructureCache::new(dir.path());
        let first = cache.load_or_scan();
        assert!(cache.path().is_file());
        fs::write(dir.path().join("src/new.go"), "").unwrap();
        assert_eq!(cache.load_or_scan(), first);

        let stale = StructureCache::new(dir.path()).with_ttl(Duration::ZERO);
        let rescanned = stale.load_or_scan();
        assert_eq!(rescanned.directories[1].files, 4);
    }

    #[test]
    fn prompt_sections() {
        let task = Task::new("Add login")
            .with_description("Add a login endpoint.")
            .with_verification("`go test ./...` passes")
            .with_boundaries(vec!["api/**".into()]);
        let learnings = [Learning::new("tests fail", "run them", "pass")];
        let prompt = build_agent_prompt(
            &task,
            &PromptContext {
                tier: Some(Tier::Builder),
                structure: None,
                learnings: &learnings,
            },
        );
        assert!(prompt.starts_with("You are working in an isolated git worktree"));
        assert!(prompt.contains("Title: Add login"));
        assert!(prompt.contains("- api/**"));
        assert!(prompt.contains("builder-level"));
        assert!(prompt.contains("WHEN tests fail DO run them RESULT pass"));
        assert!(!prompt.contains("Project Layout"));
    }

    #[test]
    fn minimal_prompt_omits_optional_sections() {
        let prompt = build_agent_prompt(&Task::new("Fix"), &PromptContext::default());
        assert!(!prompt.contains("File Boundaries"));
        assert!(!prompt.contains("Learnings"));
        assert!(prompt.contains("scout-level"));
    }
}
