//! External engine invocation.
//!
//! [`Engine`] is the raw backend: it spawns one engine process, feeds its
//! stdin, captures output, and waits for exit, timeout or cancellation.
//! [`EngineInvoker`] sits on top and turns an [`EngineInvocation`] from a
//! stage descriptor into a classified [`InvocationResult`].
//!
//! [`EngineInvocation`]: crate::stages::EngineInvocation

mod capture;
mod invoker;
mod process;

pub use capture::{
    CaptureLimits, CapturedLog, LineSplitter, LogCapture, DEFAULT_HEAD_BYTES, DEFAULT_TAIL_BYTES,
    MAX_LINE_BYTES,
};
pub use invoker::{EngineInvoker, InvocationResult};
pub use process::{resolve_program, ProcessEngine};

use crate::cancellation::CancellationToken;
use crate::errors::EngineError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// One fully resolved engine command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    /// Engine subcommand (e.g. `grompp`).
    pub subcommand: String,
    /// Arguments after the subcommand, placeholders already resolved.
    pub args: Vec<String>,
    /// Absolute working directory of the process.
    pub work_dir: PathBuf,
    /// Text written to stdin before it is closed.
    pub stdin: Option<String>,
    /// Kill the process after this long.
    pub timeout: Option<Duration>,
}

impl EngineCommand {
    /// Creates a command with no arguments.
    #[must_use]
    pub fn new(subcommand: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            subcommand: subcommand.into(),
            args: Vec::new(),
            work_dir: work_dir.into(),
            stdin: None,
            timeout: None,
        }
    }

    /// Renders the command line for logs.
    #[must_use]
    pub fn display_line(&self, program: &str) -> String {
        let mut line = format!("{program} {}", self.subcommand);
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// How an engine process ended when it was not interrupted.
#[derive(Debug, Clone, Default)]
pub struct EngineExit {
    /// Exit code, absent when terminated by a signal.
    pub code: Option<i32>,
    /// Whether the process exited with status zero.
    pub success: bool,
    /// Captured stdout and stderr.
    pub log: CapturedLog,
    /// Wall-clock duration.
    pub duration: Duration,
}

/// Backend that runs engine processes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Engine: Send + Sync {
    /// Program name or path, for logs and events.
    fn program(&self) -> String;

    /// Resolves the program to an existing executable, if possible.
    fn locate(&self) -> Option<PathBuf>;

    /// Runs one command to completion.
    ///
    /// Returns `Err` when the process could not be started, exceeded its
    /// timeout, or was cancelled. A non-zero exit is `Ok`.
    async fn execute(
        &self,
        command: &EngineCommand,
        cancel: &CancellationToken,
    ) -> Result<EngineExit, EngineError>;
}
