//! Scripted runner for tests.
//!
//! A [`MockRunnerFactory`] hands out runners that play back one
//! [`MockBehavior`] each, in order, falling back to a default once the
//! script is exhausted. Prompts and models are recorded for assertions.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use alphie_core::StreamEvent;

use crate::error::RunnerError;
use crate::parser::{parse_line, EVENT_CHANNEL_CAPACITY};
use crate::runner::{Runner, RunnerFactory, StartOptions};

static NEXT_PID: AtomicU32 = AtomicU32::new(40_000);

/// What a single mock runner does once started.
#[derive(Clone, Debug)]
pub enum MockBehavior {
    /// Emit the events, close the channel, exit cleanly.
    Events(Vec<StreamEvent>),
    /// Sleep before emitting the events.
    Delayed(Duration, Vec<StreamEvent>),
    /// Emit the events, then exit with an error and the given stderr.
    Fail { events: Vec<StreamEvent>, stderr: String },
    /// Never emit anything; the channel stays open until killed.
    Hang,
    /// Fail to start at all.
    StartError(String),
}

impl MockBehavior {
    /// Events parsed from raw JSON lines, exactly as a subprocess would
    /// produce them.
    pub fn lines(lines: &[&str]) -> Self {
        Self::Events(lines.iter().filter_map(|l| parse_line(l)).collect())
    }

    /// One assistant message carrying usage, then a result line.
    pub fn reply(text: &str, input_tokens: u64, output_tokens: u64) -> Self {
        let assistant = serde_json::json!({
            "type": "assistant",
            "message": {
                "content": [{"type": "text", "text": text}],
                "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens}
            }
        })
        .to_string();
        let result = serde_json::json!({"type": "result", "result": text}).to_string();
        Self::lines(&[&assistant, &result])
    }

    /// Assistant text with no usage block.
    pub fn text(text: &str) -> Self {
        Self::Events(vec![StreamEvent::assistant_text(text)])
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedStart {
    pub prompt: String,
    pub model: Option<String>,
    pub work_dir: std::path::PathBuf,
}

#[derive(Default)]
struct Shared {
    script: Mutex<VecDeque<MockBehavior>>,
    starts: Mutex<Vec<RecordedStart>>,
}

pub struct MockRunnerFactory {
    shared: Arc<Shared>,
    fallback: MockBehavior,
}

impl MockRunnerFactory {
    pub fn new(script: Vec<MockBehavior>) -> Self {
        Self {
            shared: Arc::new(Shared {
                script: Mutex::new(script.into()),
                starts: Mutex::new(Vec::new()),
            }),
            fallback: MockBehavior::Events(Vec::new()),
        }
    }

    /// Behavior used once the script runs out.
    pub fn with_fallback(mut self, fallback: MockBehavior) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn push(&self, behavior: MockBehavior) {
        self.shared.script.lock().push_back(behavior);
    }

    /// Every successful or attempted start, in order.
    pub fn starts(&self) -> Vec<RecordedStart> {
        self.shared.starts.lock().clone()
    }

    pub fn start_count(&self) -> usize {
        self.shared.starts.lock().len()
    }
}

impl RunnerFactory for MockRunnerFactory {
    fn new_runner(&self) -> Box<dyn Runner> {
        let behavior = self
            .shared
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Box::new(MockRunner::new(behavior, Some(self.shared.clone())))
    }
}

pub struct MockRunner {
    behavior: Option<MockBehavior>,
    shared: Option<Arc<Shared>>,
    output: Option<mpsc::Receiver<StreamEvent>>,
    producer: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    stderr: String,
    exit_error: Option<RunnerError>,
    pid: u32,
    started: bool,
}

impl MockRunner {
    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self::new(behavior, None)
    }

    fn new(behavior: MockBehavior, shared: Option<Arc<Shared>>) -> Self {
        Self {
            behavior: Some(behavior),
            shared,
            output: None,
            producer: None,
            cancel: CancellationToken::new(),
            stderr: String::new(),
            exit_error: None,
            pid: 0,
            started: false,
        }
    }
}

async fn produce(
    events: Vec<StreamEvent>,
    delay: Option<Duration>,
    hang: bool,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) {
    if let Some(delay) = delay {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
    for event in events {
        tokio::select! {
            () = cancel.cancelled() => return,
            res = tx.send(event) => if res.is_err() { return },
        }
    }
    if hang {
        cancel.cancelled().await;
    }
}

#[async_trait]
impl Runner for MockRunner {
    async fn start_with_options(
        &mut self,
        prompt: &str,
        work_dir: &Path,
        options: StartOptions,
    ) -> Result<(), RunnerError> {
        if self.started {
            return Err(RunnerError::AlreadyStarted);
        }
        if let Some(shared) = &self.shared {
            shared.starts.lock().push(RecordedStart {
                prompt: prompt.to_string(),
                model: options.model.clone(),
                work_dir: work_dir.to_path_buf(),
            });
        }

        let behavior = self.behavior.take().unwrap_or(MockBehavior::Events(Vec::new()));
        let (events, delay, hang) = match behavior {
            MockBehavior::StartError(msg) => return Err(RunnerError::Spawn(msg)),
            MockBehavior::Events(events) => (events, None, false),
            MockBehavior::Delayed(delay, events) => (events, Some(delay), false),
            MockBehavior::Fail { events, stderr } => {
                self.stderr = stderr;
                self.exit_error = Some(RunnerError::ExitStatus(1));
                (events, None, false)
            }
            MockBehavior::Hang => (Vec::new(), None, true),
        };

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.producer = Some(tokio::spawn(produce(
            events,
            delay,
            hang,
            tx,
            self.cancel.clone(),
        )));
        self.output = Some(rx);
        self.pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
        self.started = true;
        Ok(())
    }

    fn output(&mut self) -> Option<mpsc::Receiver<StreamEvent>> {
        self.output.take()
    }

    async fn wait(&mut self) -> Result<(), RunnerError> {
        if !self.started {
            return Err(RunnerError::NotStarted);
        }
        if let Some(producer) = self.producer.take() {
            let _ = producer.await;
        }
        self.pid = 0;
        if self.cancel.is_cancelled() {
            return Err(RunnerError::Terminated);
        }
        match &self.exit_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn kill(&mut self) -> Result<(), RunnerError> {
        self.cancel.cancel();
        self.pid = 0;
        Ok(())
    }

    fn stderr(&self) -> String {
        self.stderr.clone()
    }

    fn pid(&self) -> u32 {
        self.pid
    }
}
