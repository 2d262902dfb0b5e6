//! # alphie-runner
//!
//! The runner seam: a small behavioral contract (`start`, `output`, `wait`,
//! `kill`, `pid`, `stderr`) over whatever actually produces model output,
//! plus the line-delimited JSON event parser, the `claude` CLI runner, and a
//! scripted mock used by tests throughout the workspace.

pub mod error;
pub mod mock;
pub mod parser;
pub mod runner;
pub mod subprocess;

pub use error::RunnerError;
pub use mock::{MockBehavior, MockRunner, MockRunnerFactory};
pub use parser::{parse_line, summarize_tool, EVENT_CHANNEL_CAPACITY};
pub use runner::{collect_text, CollectedOutput, Runner, RunnerFactory, StartOptions};
pub use subprocess::{ClaudeConfig, ClaudeRunner, ClaudeRunnerFactory};
