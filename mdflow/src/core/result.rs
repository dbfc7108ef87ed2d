//! Stage result type with factory methods.

use super::StageStatus;
use crate::utils::timestamps::format_duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Why a stage failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The engine exited with a non-zero status (or was killed by a signal).
    NonZeroExit {
        /// The engine subcommand.
        subcommand: String,
        /// The exit code, absent when the process ended by signal.
        code: Option<i32>,
    },
    /// The engine exited zero but declared outputs are missing or empty.
    SilentFailure {
        /// The subcommand whose outputs were checked, or `None` for the
        /// stage-level postcondition.
        subcommand: Option<String>,
        /// The missing or empty files.
        missing: Vec<String>,
    },
    /// The engine exited zero but its log matched a failure pattern.
    LogPattern {
        /// The engine subcommand.
        subcommand: String,
        /// The pattern that matched.
        pattern: String,
        /// The first matching log line.
        line: String,
    },
    /// The engine could not be started.
    Launch {
        /// The program that failed to start.
        program: String,
        /// The OS error message.
        message: String,
    },
    /// The engine exceeded its timeout and was killed.
    Timeout {
        /// The engine subcommand.
        subcommand: String,
        /// The timeout in milliseconds.
        timeout_ms: u64,
    },
    /// The run was cancelled.
    Cancelled {
        /// The cancellation reason.
        reason: String,
    },
    /// A required input was absent from the upstream directory.
    MissingDependency {
        /// The missing file name.
        file: String,
        /// The directory that should have contained it.
        directory: PathBuf,
    },
    /// A filesystem operation on the stage directory failed.
    Io {
        /// The failed operation.
        operation: String,
        /// The OS error message.
        message: String,
    },
}

impl FailureReason {
    /// Short marker naming the failure class.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NonZeroExit { .. } => "NonZeroExit",
            Self::SilentFailure { .. } => "SilentFailure",
            Self::LogPattern { .. } => "LogPattern",
            Self::Launch { .. } => "LaunchError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Cancelled { .. } => "Cancelled",
            Self::MissingDependency { .. } => "MissingDependencyError",
            Self::Io { .. } => "IoError",
        }
    }

    /// Returns true for failures that indicate a pipeline invariant
    /// violation rather than a simulation problem.
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::MissingDependency { .. })
    }

    pub(crate) fn io(operation: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonZeroExit { subcommand, code: Some(code) } => {
                write!(f, "'{subcommand}' exited with code {code}")
            }
            Self::NonZeroExit { subcommand, code: None } => {
                write!(f, "'{subcommand}' was terminated by a signal")
            }
            Self::SilentFailure { subcommand: Some(sub), missing } => write!(
                f,
                "'{sub}' exited 0 but produced no usable output: {}",
                missing.join(", ")
            ),
            Self::SilentFailure { subcommand: None, missing } => write!(
                f,
                "stage outputs missing or empty after the last engine call: {}",
                missing.join(", ")
            ),
            Self::LogPattern { subcommand, pattern, line } => {
                write!(f, "'{subcommand}' log matched '{pattern}': {line}")
            }
            Self::Launch { program, message } => {
                write!(f, "failed to launch '{program}': {message}")
            }
            Self::Timeout {
                subcommand,
                timeout_ms,
            } => write!(
                f,
                "'{subcommand}' timed out after {}",
                format_duration(Duration::from_millis(*timeout_ms))
            ),
            Self::Cancelled { reason } => write!(f, "cancelled: {reason}"),
            Self::MissingDependency { file, directory } => write!(
                f,
                "required input '{file}' missing from {}",
                directory.display()
            ),
            Self::Io { operation, message } => write!(f, "{operation}: {message}"),
        }
    }
}

/// Summary of one engine invocation within a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationSummary {
    /// Position of the call within the stage.
    pub index: usize,
    /// The engine subcommand.
    pub subcommand: String,
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
    /// File holding the call's captured output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// The result of executing (or skipping) one stage.
///
/// `StageResult` is immutable once recorded in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// The stage name.
    pub stage_name: String,
    /// The stage outcome.
    pub status: StageStatus,
    /// Failure reason (for failed stages).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// Exit code of the last engine call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Tail of the captured engine output.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_excerpt: String,
    /// The stage working directory.
    pub output_dir: PathBuf,
    /// When the stage started.
    pub started_at: DateTime<Utc>,
    /// When the stage ended.
    pub finished_at: DateTime<Utc>,
    /// Engine calls made by the stage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invocations: Vec<InvocationSummary>,
}

impl StageResult {
    fn new(
        stage_name: impl Into<String>,
        status: StageStatus,
        output_dir: &Path,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            status,
            failure: None,
            exit_code: None,
            log_excerpt: String::new(),
            output_dir: output_dir.to_path_buf(),
            started_at,
            finished_at: Utc::now(),
            invocations: Vec::new(),
        }
    }

    /// Creates a skipped result.
    #[must_use]
    pub fn skipped(
        stage_name: impl Into<String>,
        output_dir: &Path,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self::new(stage_name, StageStatus::Skipped, output_dir, started_at)
    }

    /// Creates a succeeded result.
    #[must_use]
    pub fn succeeded(
        stage_name: impl Into<String>,
        output_dir: &Path,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self::new(stage_name, StageStatus::Succeeded, output_dir, started_at)
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failed(
        stage_name: impl Into<String>,
        output_dir: &Path,
        started_at: DateTime<Utc>,
        reason: FailureReason,
    ) -> Self {
        let mut result = Self::new(stage_name, StageStatus::Failed, output_dir, started_at);
        result.failure = Some(reason);
        result
    }

    /// Sets the exit code.
    #[must_use]
    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Sets the log excerpt.
    #[must_use]
    pub fn with_log_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.log_excerpt = excerpt.into();
        self
    }

    /// Sets the invocation summaries.
    #[must_use]
    pub fn with_invocations(mut self, invocations: Vec<InvocationSummary>) -> Self {
        self.invocations = invocations;
        self
    }

    /// Returns the duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64
    }

    /// Returns true if the stage succeeded or was skipped.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.allows_advance()
    }

    /// Returns true if the stage failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }

    /// Converts the result to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("stage".to_string(), serde_json::json!(self.stage_name));
        map.insert("status".to_string(), serde_json::json!(self.status.to_string()));
        map.insert(
            "output_dir".to_string(),
            serde_json::json!(self.output_dir.display().to_string()),
        );
        map.insert("duration_ms".to_string(), serde_json::json!(self.duration_ms()));

        if let Some(code) = self.exit_code {
            map.insert("exit_code".to_string(), serde_json::json!(code));
        }
        if let Some(ref failure) = self.failure {
            map.insert("failure".to_string(), serde_json::json!(failure.code()));
            map.insert("error".to_string(), serde_json::json!(failure.to_string()));
        }
        if !self.log_excerpt.is_empty() {
            map.insert("log_excerpt".to_string(), serde_json::json!(self.log_excerpt));
        }

        map
    }
}
