//! # alphie
//!
//! Command-line entry point: run one task through the execution engine,
//! clean up orphaned agent worktrees, or capture a quality baseline.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use alphie_core::pricing::{format_cost, format_tokens};
use alphie_core::{AgentId, Tier};
use alphie_engine::{
    format_duration, EngineConfig, ExecuteOptions, ExecutionEngine, ExecutionResult, InMemoryLearningStore,
    ProgressCallback, ProgressUpdate, RetryDecision, RetryHandler, Task,
};
use alphie_quality::{capture_baseline, Baseline};
use alphie_runner::{ClaudeConfig, ClaudeRunnerFactory};
use alphie_settings::{install_tier_table, load_settings, AlphieSettings};
use alphie_telemetry::{init_telemetry, TelemetryConfig};
use alphie_worktree::{WorktreeEntry, WorktreeManager};

/// Orchestrate coding agents in isolated git worktrees.
#[derive(Parser, Debug)]
#[command(name = "alphie", about = "AI coding agent orchestrator")]
struct Cli {
    /// Repository root (defaults to the current directory).
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single task in a fresh worktree.
    Run {
        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        description: String,

        /// How success can be checked, e.g. "`go test ./...` passes".
        #[arg(long = "verify", default_value = "")]
        verification: String,

        /// Path or glob the agent may modify. Repeatable.
        #[arg(long = "boundary")]
        boundaries: Vec<String>,

        /// scout, builder or architect.
        #[arg(long)]
        tier: Option<String>,

        /// Run the self-critique loop after the first pass.
        #[arg(long)]
        ralph: bool,

        /// Run quality gates before accepting the result.
        #[arg(long)]
        gates: bool,

        /// Capture a baseline first and only fail on regressions.
        #[arg(long)]
        baseline: bool,
    },

    /// Remove managed worktrees that no active session owns.
    Cleanup {
        /// Session id to keep. Repeatable.
        #[arg(long = "active")]
        active: Vec<String>,
    },

    /// Capture pre-existing gate failures.
    Baseline {
        /// Output path (defaults to `.alphie/baseline.json`).
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn default_baseline_path(repo: &Path) -> PathBuf {
    repo.join(".alphie").join("baseline.json")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let repo = match cli.repo {
        Some(repo) => repo,
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };

    let settings = load_settings(&repo).context("Failed to load settings")?;
    let _telemetry = init_telemetry(TelemetryConfig::from_level_str(
        &settings.logging.level,
        settings.logging.json,
    ));
    let _ = install_tier_table(settings.tiers.clone());

    match cli.command {
        Command::Run {
            title,
            description,
            verification,
            boundaries,
            tier,
            ralph,
            gates,
            baseline,
        } => {
            let task = Task::new(title)
                .with_description(description)
                .with_verification(verification)
                .with_boundaries(boundaries);
            let tier = match tier.as_deref() {
                Some(name) => Some(Tier::parse(name).with_context(|| format!("Unknown tier: {name}"))?),
                None => None,
            };
            run(&repo, &settings, task, tier, ralph, gates, baseline).await
        }
        Command::Cleanup { active } => cleanup(&repo, &settings, &active).await,
        Command::Baseline { out } => {
            let path = out.unwrap_or_else(|| default_baseline_path(&repo));
            let baseline = capture_baseline(&repo, settings.gates.timeout()).await;
            baseline
                .save(&path)
                .with_context(|| format!("Failed to write baseline to {}", path.display()))?;
            println!(
                "baseline: {} test failure(s), {} lint error(s), {} type error(s) -> {}",
                baseline.results.failing_tests.len(),
                baseline.results.lint_errors.len(),
                baseline.results.type_errors.len(),
                path.display()
            );
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    repo: &Path,
    settings: &AlphieSettings,
    task: Task,
    tier: Option<Tier>,
    ralph: bool,
    gates: bool,
    capture: bool,
) -> Result<()> {
    let worktrees = Arc::new(WorktreeManager::new(repo, settings.worktree.resolved_base_dir()));
    match worktrees.recover_orphaned().await {
        Ok(0) => {}
        Ok(n) => tracing::info!(removed = n, "recovered orphaned worktree directories"),
        Err(e) => tracing::warn!(error = %e, "orphan recovery failed"),
    }

    let factory = Arc::new(ClaudeRunnerFactory::new(ClaudeConfig {
        binary: settings.runner.binary.clone(),
        extra_args: settings.runner.extra_args.clone(),
    }));
    let learnings = Arc::new(InMemoryLearningStore::new());
    let engine = ExecutionEngine::new(EngineConfig::from_settings(repo, settings), worktrees, factory)
        .with_learnings(learnings.clone());
    let retries = RetryHandler::new(settings.retry.max_attempts).with_learnings(learnings.clone());

    let baseline = if capture {
        let baseline = capture_baseline(repo, settings.gates.timeout()).await;
        let path = default_baseline_path(repo);
        if let Err(e) = baseline.save(&path) {
            tracing::warn!(error = %e, "failed to persist baseline");
        }
        Some(baseline)
    } else {
        Baseline::load(&default_baseline_path(repo)).ok().filter(|_| gates)
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ninterrupted, stopping agent");
                cancel.cancel();
            }
        });
    }

    let progress: ProgressCallback = Arc::new(|u: &ProgressUpdate| {
        eprintln!(
            "[{}] {} tokens, {}{}",
            format_duration(u.elapsed),
            format_tokens(u.tokens.total()),
            format_cost(u.cost),
            u.current_action.as_deref().map(|a| format!(", {a}")).unwrap_or_default()
        );
    });

    // Retry bookkeeping is keyed by the task, each attempt gets its own agent.
    let task_key = AgentId::from(task.id.as_str());
    let mut attempt_task = task.clone();
    loop {
        let result = engine
            .execute(
                &attempt_task,
                ExecuteOptions {
                    tier,
                    ralph,
                    quality_gates: gates,
                    baseline: baseline.clone(),
                    progress: Some(progress.clone()),
                    cancel: Some(cancel.clone()),
                    ..ExecuteOptions::default()
                },
            )
            .await
            .context("Task setup failed")?;
        report(&result);
        if result.success {
            retries.reset(&task_key);
            return Ok(());
        }

        for learning in &result.suggested_learnings {
            learnings.add(learning.clone());
        }
        let error = result.error.clone().unwrap_or_default();
        let (ctx, decision) = retries.handle_failure(&cancel, &task_key, &error).await;
        match decision {
            RetryDecision::Retry => {
                eprintln!(
                    "attempt {}/{} failed, retrying with strategy {}",
                    ctx.attempt,
                    ctx.max_attempts,
                    ctx.strategy.as_str()
                );
                attempt_task = task.clone();
                if let Some(fix) = ctx.suggested_fix {
                    attempt_task.description = format!(
                        "{}\n\nPrevious attempt failed with: {}\nSuggested fix: {fix}",
                        task.description, ctx.last_error
                    );
                }
            }
            RetryDecision::Escalate => {
                let escalation = retries.on_escalate(&task_key);
                bail!(
                    "task failed after {} attempt(s), needs human attention: {}",
                    escalation.attempts,
                    escalation.error_history.last().map(String::as_str).unwrap_or(&error)
                );
            }
            RetryDecision::Abort => bail!("task aborted: {error}"),
        }
    }
}

fn report(result: &ExecutionResult) {
    println!("{}", result.output.trim_end());
    println!("---");
    println!(
        "{} in {} | model {} | {} tokens | {}",
        if result.success { "succeeded" } else { "failed" },
        format_duration(result.duration),
        result.model,
        format_tokens(result.usage.total()),
        format_cost(result.cost)
    );
    if let (Some(n), Some(reason)) = (result.loop_iterations, result.loop_exit_reason) {
        println!("critique: {n} iteration(s), {reason}");
    }
    if let Some(err) = &result.error {
        println!("error: {err}");
    }
    if let Some(log) = &result.log_file {
        println!("log: {}", log.display());
    }
}

async fn cleanup(repo: &Path, settings: &AlphieSettings, active: &[String]) -> Result<()> {
    let manager = WorktreeManager::new(repo, settings.worktree.resolved_base_dir());
    let on_remove: &(dyn Fn(&WorktreeEntry) + Send + Sync) =
        &|entry: &WorktreeEntry| println!("removed {}", entry.path.display());
    let removed = manager
        .cleanup_orphans(active, Some(on_remove))
        .await
        .context("Failed to clean up orphaned worktrees")?;
    let recovered = manager
        .recover_orphaned()
        .await
        .context("Failed to recover orphaned worktree directories")?;
    println!("{removed} orphaned worktree(s) removed, {recovered} stray director(ies) recovered");
    Ok(())
}
