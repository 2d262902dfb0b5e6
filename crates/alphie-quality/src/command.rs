//! Running a single check command under a deadline.

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

/// Message recorded when a command outlives its deadline.
pub const TIMED_OUT: &str = "Command timed out";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
        }
    }

    /// Run through `sh -c`, for free-form contract commands.
    pub fn shell(script: &str) -> Self {
        Self::new("sh", &["-c", script])
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.program == "sh" && self.args.len() == 2 && self.args[0] == "-c" {
            return f.write_str(&self.args[1]);
        }
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Exit code 0.
    Success,
    /// Non-zero exit.
    Failed(i32),
    /// Could not be spawned, was killed by a signal, or timed out.
    Error,
}

#[derive(Clone, Debug)]
pub struct CommandOutcome {
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.status == CommandStatus::Success
    }

    /// stdout and stderr joined, the way a user would have seen them.
    pub fn combined(&self) -> String {
        match (self.stdout.trim_end(), self.stderr.trim_end()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }

    fn error(message: String, started: Instant) -> Self {
        Self {
            status: CommandStatus::Error,
            stdout: String::new(),
            stderr: message,
            duration: started.elapsed(),
        }
    }
}

/// Run `spec` in `dir`, killing it when `timeout` elapses.
pub async fn run_command(spec: &CommandSpec, dir: &Path, timeout: Duration) -> CommandOutcome {
    let started = Instant::now();
    debug!(command = %spec, dir = %dir.display(), "running check");

    let child = Command::new(&spec.program)
        .args(&spec.args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(c) => c,
        Err(e) => return CommandOutcome::error(format!("failed to run {}: {e}", spec.program), started),
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => CommandOutcome {
            status: match output.status.code() {
                Some(0) => CommandStatus::Success,
                Some(code) => CommandStatus::Failed(code),
                None => CommandStatus::Error,
            },
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
        },
        Ok(Err(e)) => CommandOutcome::error(format!("{}: {e}", spec.program), started),
        Err(_) => {
            warn!(command = %spec, timeout_secs = timeout.as_secs(), "check timed out");
            CommandOutcome::error(TIMED_OUT.to_string(), started)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn success_and_failure() {
        let dir = std::env::temp_dir();
        let ok = run_command(&CommandSpec::shell("echo hi"), &dir, Duration::from_secs(10)).await;
        assert!(ok.success());
        assert_eq!(ok.combined(), "hi");

        let fail = run_command(&CommandSpec::shell("echo bad >&2; exit 3"), &dir, Duration::from_secs(10)).await;
        assert_eq!(fail.status, CommandStatus::Failed(3));
        assert_eq!(fail.combined(), "bad");
    }

    #[tokio::test]
    async fn missing_program_is_error() {
        let out = run_command(
            &CommandSpec::new("alphie-no-such-program", &[]),
            &std::env::temp_dir(),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(out.status, CommandStatus::Error);
    }

    #[tokio::test]
    async fn timeout_is_error() {
        let out = run_command(&CommandSpec::shell("sleep 5"), &std::env::temp_dir(), Duration::from_millis(100)).await;
        assert_eq!(out.status, CommandStatus::Error);
        assert_eq!(out.stderr, TIMED_OUT);
    }

    #[test]
    fn display() {
        assert_eq!(CommandSpec::new("go", &["test", "./..."]).to_string(), "go test ./...");
        assert_eq!(CommandSpec::shell("make check").to_string(), "make check");
    }
}
