//! Runner backed by the `claude` CLI in stream-json mode.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use alphie_core::StreamEvent;

use crate::error::RunnerError;
use crate::parser::{spawn_event_stream, StderrSink};
use crate::runner::{Runner, RunnerFactory, StartOptions};

/// Launch configuration shared by every runner a factory creates.
#[derive(Clone, Debug)]
pub struct ClaudeConfig {
    pub binary: String,
    pub extra_args: Vec<String>,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            extra_args: Vec::new(),
        }
    }
}

pub struct ClaudeRunner {
    config: ClaudeConfig,
    child: Option<Child>,
    output: Option<mpsc::Receiver<StreamEvent>>,
    reader: Option<JoinHandle<()>>,
    stderr: StderrSink,
    cancel: CancellationToken,
    pid: u32,
}

impl ClaudeRunner {
    pub fn new(config: ClaudeConfig) -> Self {
        Self {
            config,
            child: None,
            output: None,
            reader: None,
            stderr: StderrSink::new(),
            cancel: CancellationToken::new(),
            pid: 0,
        }
    }

    /// Arguments passed to the CLI for one prompt.
    pub fn build_args(&self, prompt: &str, options: &StartOptions) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(model) = &options.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.extend(self.config.extra_args.iter().cloned());
        args.push(prompt.to_string());
        args
    }
}

#[async_trait]
impl Runner for ClaudeRunner {
    async fn start_with_options(
        &mut self,
        prompt: &str,
        work_dir: &Path,
        options: StartOptions,
    ) -> Result<(), RunnerError> {
        if self.child.is_some() {
            return Err(RunnerError::AlreadyStarted);
        }

        let mut cmd = Command::new(&self.config.binary);
        let _ = cmd
            .args(self.build_args(prompt, &options))
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RunnerError::Spawn(format!("{}: {e}", self.config.binary)))?;
        self.pid = child.id().unwrap_or(0);

        if let Some(stderr) = child.stderr.take() {
            let _ = tokio::spawn(self.stderr.clone().collect(stderr));
        }
        if let Some(stdout) = child.stdout.take() {
            let (rx, handle) = spawn_event_stream(BufReader::new(stdout), self.cancel.clone());
            self.output = Some(rx);
            self.reader = Some(handle);
        }

        info!(
            pid = self.pid,
            model = options.model.as_deref().unwrap_or("default"),
            work_dir = %work_dir.display(),
            "runner started"
        );
        self.child = Some(child);
        Ok(())
    }

    fn output(&mut self) -> Option<mpsc::Receiver<StreamEvent>> {
        self.output.take()
    }

    async fn wait(&mut self) -> Result<(), RunnerError> {
        let child = self.child.as_mut().ok_or(RunnerError::NotStarted)?;
        let status = child.wait().await?;
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
        self.pid = 0;
        debug!(?status, "runner exited");
        if status.success() {
            Ok(())
        } else {
            match status.code() {
                Some(code) => Err(RunnerError::ExitStatus(code)),
                None => Err(RunnerError::Terminated),
            }
        }
    }

    async fn kill(&mut self) -> Result<(), RunnerError> {
        self.cancel.cancel();
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        if let Err(e) = child.kill().await {
            warn!(pid = self.pid, error = %e, "failed to kill runner");
            return Err(e.into());
        }
        info!(pid = self.pid, "runner killed");
        self.pid = 0;
        Ok(())
    }

    fn stderr(&self) -> String {
        self.stderr.contents()
    }

    fn pid(&self) -> u32 {
        self.pid
    }
}

/// Creates [`ClaudeRunner`]s sharing one launch configuration.
#[derive(Clone, Debug, Default)]
pub struct ClaudeRunnerFactory {
    config: ClaudeConfig,
}

impl ClaudeRunnerFactory {
    pub fn new(config: ClaudeConfig) -> Self {
        Self { config }
    }
}

impl RunnerFactory for ClaudeRunnerFactory {
    fn new_runner(&self) -> Box<dyn Runner> {
        Box::new(ClaudeRunner::new(self.config.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_include_model_and_prompt_last() {
        let runner = ClaudeRunner::new(ClaudeConfig {
            binary: "claude".into(),
            extra_args: vec!["--dangerously-skip-permissions".into()],
        });
        let args = runner.build_args(
            "fix it",
            &StartOptions {
                model: Some("sonnet".into()),
            },
        );
        assert_eq!(&args[..4], ["-p", "--output-format", "stream-json", "--verbose"]);
        assert!(args.windows(2).any(|w| w == ["--model", "sonnet"]));
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("fix it"));
    }

    #[test]
    fn args_without_model() {
        let runner = ClaudeRunner::new(ClaudeConfig::default());
        let args = runner.build_args("p", &StartOptions::default());
        assert!(!args.contains(&"--model".to_string()));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_start() {
        let mut runner = ClaudeRunner::new(ClaudeConfig {
            binary: "alphie-no-such-binary".into(),
            extra_args: Vec::new(),
        });
        let err = runner.start("hi", &std::env::temp_dir()).await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn(_)));
        assert_eq!(runner.pid(), 0);
    }

    #[tokio::test]
    async fn wait_before_start_errors() {
        let mut runner = ClaudeRunner::new(ClaudeConfig::default());
        assert!(matches!(runner.wait().await, Err(RunnerError::NotStarted)));
        assert!(runner.output().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_json_stdout_becomes_parse_errors() {
        // `echo` prints its arguments as one line that is not JSON.
        let mut runner = ClaudeRunner::new(ClaudeConfig {
            binary: "echo".into(),
            extra_args: Vec::new(),
        });
        runner.start("prompt", &std::env::temp_dir()).await.unwrap();
        assert!(runner.pid() > 0);
        let mut rx = runner.output().unwrap();
        let evt = rx.recv().await.unwrap();
        assert!(evt.is_error());
        assert!(evt.raw.ends_with("prompt"));
        assert!(rx.recv().await.is_none());
        runner.wait().await.unwrap();
        assert_eq!(runner.pid(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let mut runner = ClaudeRunner::new(ClaudeConfig {
            binary: "false".into(),
            extra_args: Vec::new(),
        });
        runner.start("prompt", &std::env::temp_dir()).await.unwrap();
        let mut rx = runner.output().unwrap();
        while rx.recv().await.is_some() {}
        assert!(matches!(runner.wait().await, Err(RunnerError::ExitStatus(1))));
    }
}
