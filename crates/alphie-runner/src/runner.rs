//! The behavioral contract every runner satisfies.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;

use alphie_core::StreamEvent;

use crate::error::RunnerError;

/// Options applied when starting a runner.
#[derive(Clone, Debug, Default)]
pub struct StartOptions {
    pub model: Option<String>,
}

/// A process or streaming session that produces model output as events.
///
/// The output channel is the single termination signal: it closes when the
/// runner stops producing events, whether it exited, was killed, or its
/// reader was cancelled.
#[async_trait]
pub trait Runner: Send {
    async fn start(&mut self, prompt: &str, work_dir: &Path) -> Result<(), RunnerError> {
        self.start_with_options(prompt, work_dir, StartOptions::default())
            .await
    }

    async fn start_with_options(
        &mut self,
        prompt: &str,
        work_dir: &Path,
        options: StartOptions,
    ) -> Result<(), RunnerError>;

    /// Take the receiving end of the event channel. Returns `None` before
    /// `start` or if already taken.
    fn output(&mut self) -> Option<mpsc::Receiver<StreamEvent>>;

    /// Wait for the runner to exit.
    async fn wait(&mut self) -> Result<(), RunnerError>;

    async fn kill(&mut self) -> Result<(), RunnerError>;

    /// Captured stderr so far.
    fn stderr(&self) -> String;

    /// Process id, 0 when detached or not started.
    fn pid(&self) -> u32;
}

/// Produces fresh runners, one per task attempt or critique iteration.
pub trait RunnerFactory: Send + Sync {
    fn new_runner(&self) -> Box<dyn Runner>;
}

/// Drain a started runner's events, concatenating assistant text (or the
/// final result text when no assistant text arrived), then wait for exit.
pub async fn collect_text(runner: &mut dyn Runner) -> Result<CollectedOutput, RunnerError> {
    let mut collected = CollectedOutput::default();
    if let Some(mut rx) = runner.output() {
        while let Some(event) = rx.recv().await {
            collected.push(event);
        }
    }
    runner.wait().await?;
    Ok(collected)
}

/// Text and raw events gathered by [`collect_text`].
#[derive(Clone, Debug, Default)]
pub struct CollectedOutput {
    assistant: Vec<String>,
    result: Option<String>,
    pub events: Vec<StreamEvent>,
}

impl CollectedOutput {
    pub fn push(&mut self, event: StreamEvent) {
        use alphie_core::StreamEventKind;
        match event.kind {
            StreamEventKind::Assistant => {
                if let Some(msg) = &event.message {
                    self.assistant.push(msg.clone());
                }
            }
            StreamEventKind::Result => {
                if let Some(msg) = &event.message {
                    self.result = Some(msg.clone());
                }
            }
            _ => {}
        }
        self.events.push(event);
    }

    pub fn text(&self) -> String {
        if self.assistant.is_empty() {
            self.result.clone().unwrap_or_default()
        } else {
            self.assistant.join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alphie_core::StreamEventKind;

    #[test]
    fn collected_text_prefers_assistant() {
        let mut out = CollectedOutput::default();
        out.push(StreamEvent::assistant_text("one"));
        out.push(StreamEvent::assistant_text("two"));
        let mut result = StreamEvent::new(StreamEventKind::Result, "{}");
        result.message = Some("one\ntwo".into());
        out.push(result);
        assert_eq!(out.text(), "one\ntwo");
        assert_eq!(out.events.len(), 3);
    }

    #[test]
    fn collected_text_falls_back_to_result() {
        let mut out = CollectedOutput::default();
        let mut result = StreamEvent::new(StreamEventKind::Result, "{}");
        result.message = Some("final".into());
        out.push(result);
        assert_eq!(out.text(), "final");
    }
}
