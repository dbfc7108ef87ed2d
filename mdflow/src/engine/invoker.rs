//! Turns stage engine calls into classified invocation results.

use super::{CapturedLog, Engine, EngineCommand, EngineExit};
use crate::cancellation::CancellationToken;
use crate::core::{FailureReason, InvocationSummary};
use crate::errors::EngineError;
use crate::stages::{EngineInvocation, Placeholders};
use crate::utils::missing_or_empty;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one engine call.
#[derive(Debug, Clone)]
pub struct InvocationResult {
    /// Position of the call within its stage.
    pub index: usize,
    /// The engine subcommand.
    pub subcommand: String,
    /// Exit code, if the process exited.
    pub exit_code: Option<i32>,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Retained output.
    pub log: CapturedLog,
    /// Where the output was written, if it was.
    pub log_file: Option<PathBuf>,
    /// Why the call failed, if it did.
    pub failure: Option<FailureReason>,
}

impl InvocationResult {
    /// Returns true if the call succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Summary stored on the stage result.
    #[must_use]
    pub fn summary(&self) -> InvocationSummary {
        InvocationSummary {
            index: self.index,
            subcommand: self.subcommand.clone(),
            exit_code: self.exit_code,
            duration_ms: self.duration.as_secs_f64() * 1000.0,
            log_file: self.log_file.clone(),
        }
    }
}

/// Runs stage engine calls against an [`Engine`] backend.
pub struct EngineInvoker<'a> {
    engine: &'a dyn Engine,
    default_timeout: Option<Duration>,
    write_logs: bool,
}

impl<'a> EngineInvoker<'a> {
    /// Creates an invoker over `engine`.
    #[must_use]
    pub fn new(engine: &'a dyn Engine) -> Self {
        Self {
            engine,
            default_timeout: None,
            write_logs: true,
        }
    }

    /// Timeout for calls that do not declare their own.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Disables the per-call log files.
    #[must_use]
    pub fn without_log_files(mut self) -> Self {
        self.write_logs = false;
        self
    }

    /// Builds the resolved command for an invocation.
    #[must_use]
    pub fn command(
        &self,
        invocation: &EngineInvocation,
        placeholders: &Placeholders,
    ) -> EngineCommand {
        EngineCommand {
            subcommand: invocation.subcommand.clone(),
            args: invocation.args.iter().map(|a| placeholders.resolve(a)).collect(),
            work_dir: placeholders.workdir.clone(),
            stdin: invocation.stdin_script.clone(),
            timeout: invocation.timeout_duration().or(self.default_timeout),
        }
    }

    /// Runs one call and classifies it.
    pub async fn invoke(
        &self,
        index: usize,
        invocation: &EngineInvocation,
        placeholders: &Placeholders,
        cancel: &CancellationToken,
    ) -> InvocationResult {
        let command = self.command(invocation, placeholders);
        info!(
            stage = %placeholders.stage,
            subcommand = %command.subcommand,
            command = %command.display_line(&self.engine.program()),
            "Invoking engine"
        );

        let outcome = self.engine.execute(&command, cancel).await;
        let (exit_code, duration, log, failure) = match outcome {
            Ok(exit) => {
                let failure = classify(invocation, &exit, &command.work_dir);
                (exit.code, exit.duration, exit.log, failure)
            }
            Err(err) => {
                let log = CapturedLog::from_text(err.captured());
                (None, Duration::ZERO, log, Some(failure_from_engine_error(&err)))
            }
        };

        let launched = !matches!(failure, Some(FailureReason::Launch { .. }));
        let log_file = if self.write_logs && launched {
            write_log_file(&command.work_dir, index, &command.subcommand, &log)
        } else {
            None
        };

        match &failure {
            None => debug!(
                stage = %placeholders.stage,
                subcommand = %command.subcommand,
                exit_code = ?exit_code,
                duration_ms = duration.as_secs_f64() * 1000.0,
                "Engine call succeeded"
            ),
            Some(reason) => warn!(
                stage = %placeholders.stage,
                subcommand = %command.subcommand,
                exit_code = ?exit_code,
                failure = %reason,
                "Engine call failed"
            ),
        }

        InvocationResult {
            index,
            subcommand: command.subcommand,
            exit_code,
            duration,
            log,
            log_file,
            failure,
        }
    }
}

fn failure_from_engine_error(err: &EngineError) -> FailureReason {
    match err {
        EngineError::Launch { program, message } => FailureReason::Launch {
            program: program.clone(),
            message: message.clone(),
        },
        EngineError::Timeout {
            subcommand, timeout, ..
        } => FailureReason::Timeout {
            subcommand: subcommand.clone(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        },
        EngineError::Cancelled { reason, .. } => FailureReason::Cancelled {
            reason: reason.clone(),
        },
    }
}

/// Classifies a call that exited on its own.
///
/// Order: non-zero exit, then failure patterns, then expected outputs.
fn classify(
    invocation: &EngineInvocation,
    exit: &EngineExit,
    work_dir: &Path,
) -> Option<FailureReason> {
    if !exit.success {
        return Some(FailureReason::NonZeroExit {
            subcommand: invocation.subcommand.clone(),
            code: exit.code,
        });
    }

    for pattern in &invocation.failure_patterns {
        let re = match regex::Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Skipping invalid failure pattern");
                continue;
            }
        };
        if let Some(line) = exit.log.lines().iter().find(|l| re.is_match(l)) {
            return Some(FailureReason::LogPattern {
                subcommand: invocation.subcommand.clone(),
                pattern: pattern.clone(),
                line: line.clone(),
            });
        }
    }

    let missing = missing_or_empty(work_dir, &invocation.expected_outputs);
    if !missing.is_empty() {
        return Some(FailureReason::SilentFailure {
            subcommand: Some(invocation.subcommand.clone()),
            missing,
        });
    }
    None
}

fn write_log_file(
    work_dir: &Path,
    index: usize,
    subcommand: &str,
    log: &CapturedLog,
) -> Option<PathBuf> {
    let path = work_dir.join(format!("{index:02}_{subcommand}.log"));
    let mut text = log.text();
    text.push('\n');
    match std::fs::write(&path, text) {
        Ok(()) => Some(path),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not write engine log");
            None
        }
    }
}
