//! Error types for the mdflow orchestrator.
//!
//! Failures that prevent a run from starting (bad stage definitions, absent
//! engine or templates, a concurrently held work directory) surface as
//! [`MdflowError`]. Failures that happen while a stage executes are recorded
//! on the stage result as a [`crate::core::FailureReason`] and abort the run;
//! the tool layer lifts a missing upstream output back into
//! [`MissingDependencyError`] because it means a completed stage lost its
//! files.

use crate::utils::timestamps::format_duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// The main error type for mdflow operations.
#[derive(Debug, Error)]
pub enum MdflowError {
    /// Static stage definitions are invalid.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// The engine binary or a parameter template is absent.
    #[error("{0}")]
    MissingPrerequisite(#[from] MissingPrerequisiteError),

    /// An upstream stage output is absent although the stage completed.
    #[error("{0}")]
    MissingDependency(#[from] MissingDependencyError),

    /// Another run holds the root work directory.
    #[error("{0}")]
    ConcurrentRun(#[from] ConcurrentRunError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MdflowError {
    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(ConfigurationError::new(message))
    }

    /// Returns the structured error info, when the variant carries one.
    #[must_use]
    pub fn error_info(&self) -> Option<&ErrorInfo> {
        match self {
            Self::Configuration(e) => e.error_info.as_ref(),
            Self::MissingPrerequisite(e) => Some(&e.error_info),
            Self::MissingDependency(e) => Some(&e.error_info),
            Self::ConcurrentRun(e) => Some(&e.error_info),
            _ => None,
        }
    }

    /// Short machine-readable kind used by the Python layer.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::MissingPrerequisite(_) => "MissingPrerequisiteError",
            Self::MissingDependency(_) => "MissingDependencyError",
            Self::ConcurrentRun(_) => "ConcurrentRunError",
            Self::Serialization(_) => "SerializationError",
            Self::Io(_) => "IoError",
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        if let Some(info) = self.error_info() {
            map.insert("code".to_string(), serde_json::json!(info.code));
            if let Some(ref hint) = info.fix_hint {
                map.insert("fix_hint".to_string(), serde_json::json!(hint));
            }
        }
        map
    }
}

impl From<serde_json::Error> for MdflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Metadata about an error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "MDFLOW-001-INPUT_ORDER").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when stage definitions fail validation.
#[derive(Debug, Clone, Error)]
#[error("Configuration error: {message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional error info.
    pub error_info: Option<ErrorInfo>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }
}

/// What kind of prerequisite is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prerequisite {
    /// The simulation engine binary.
    Engine,
    /// A stage parameter template.
    Template,
    /// The input structure handed in by the caller.
    InputStructure,
}

impl std::fmt::Display for Prerequisite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Engine => write!(f, "engine binary"),
            Self::Template => write!(f, "parameter template"),
            Self::InputStructure => write!(f, "input structure"),
        }
    }
}

/// Error raised when the engine or a template is not provisioned.
#[derive(Debug, Clone, Error)]
#[error("Missing {kind}: {}", path.display())]
pub struct MissingPrerequisiteError {
    /// What is missing.
    pub kind: Prerequisite,
    /// The path (or bare binary name) that did not resolve.
    pub path: PathBuf,
    /// Error info with a remediation hint.
    pub error_info: ErrorInfo,
}

impl MissingPrerequisiteError {
    /// Creates an error for an engine binary that does not resolve.
    #[must_use]
    pub fn engine(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let info = ErrorInfo::new(
            "MDFLOW-002-ENGINE",
            format!("Engine binary '{}' was not found", path.display()),
        )
        .with_fix_hint(
            "Install GROMACS and put `gmx` on PATH, or set MDFLOW_ENGINE to the binary path.",
        );
        Self {
            kind: Prerequisite::Engine,
            path,
            error_info: info,
        }
    }

    /// Creates an error for a template file that does not exist.
    #[must_use]
    pub fn template(stage: &str, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let info = ErrorInfo::new(
            "MDFLOW-002-TEMPLATE",
            format!("Template for stage '{}' not found at {}", stage, path.display()),
        )
        .with_fix_hint(
            "Run the resource provisioning step, or set MDFLOW_TEMPLATE_DIR to the \
             directory holding the .mdp files.",
        )
        .with_context_entry("stage", stage);
        Self {
            kind: Prerequisite::Template,
            path,
            error_info: info,
        }
    }

    /// Creates an error for an input structure that does not exist.
    #[must_use]
    pub fn input_structure(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let info = ErrorInfo::new(
            "MDFLOW-002-INPUT",
            format!("Input structure {} not found", path.display()),
        )
        .with_fix_hint("Pass the path of an existing PDB file.");
        Self {
            kind: Prerequisite::InputStructure,
            path,
            error_info: info,
        }
    }
}

/// Error raised when a required input is absent from the upstream directory.
///
/// This signals an ordering invariant violation rather than a simulation
/// failure: the upstream stage was recorded as complete.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage}' is missing required input '{file}' in {}", directory.display())]
pub struct MissingDependencyError {
    /// The stage that needed the input.
    pub stage: String,
    /// The missing file name.
    pub file: String,
    /// The directory that should have contained it.
    pub directory: PathBuf,
    /// Error info.
    pub error_info: ErrorInfo,
}

impl MissingDependencyError {
    /// Creates a new missing dependency error.
    #[must_use]
    pub fn new(stage: impl Into<String>, file: impl Into<String>, directory: &Path) -> Self {
        let stage = stage.into();
        let file = file.into();
        let error_info = ErrorInfo::new(
            "MDFLOW-004-DEPENDENCY",
            "Upstream stage output missing after completion",
        )
        .with_fix_hint(format!(
            "Restore '{file}' in {} or re-run with force so the upstream stage runs again.",
            directory.display()
        ))
        .with_context_entry("stage", stage.clone());
        Self {
            stage,
            file,
            directory: directory.to_path_buf(),
            error_info,
        }
    }
}

/// Error raised when the root work directory is already in use.
#[derive(Debug, Clone, Error)]
#[error("Work directory {} is in use by another run ({holder})", root.display())]
pub struct ConcurrentRunError {
    /// The contested root work directory.
    pub root: PathBuf,
    /// Description of the lock holder, as recorded in the lock file.
    pub holder: String,
    /// Error info with a remediation hint.
    pub error_info: ErrorInfo,
}

impl ConcurrentRunError {
    /// Creates a new concurrent run error.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, holder: impl Into<String>, lock_path: &Path) -> Self {
        let info = ErrorInfo::new("MDFLOW-003-LOCKED", "Root work directory is locked")
            .with_fix_hint(format!(
                "Use a distinct work directory, or remove {} if no run is active.",
                lock_path.display()
            ));
        Self {
            root: root.into(),
            holder: holder.into(),
            error_info: info,
        }
    }
}

/// Process-level failures of one engine invocation.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The process could not be started.
    #[error("Failed to launch '{program}': {message}")]
    Launch {
        /// The program that failed to start.
        program: String,
        /// The OS error message.
        message: String,
    },

    /// The process exceeded its timeout and was killed.
    #[error("'{subcommand}' timed out after {}", format_duration(*timeout))]
    Timeout {
        /// The engine subcommand.
        subcommand: String,
        /// The timeout that elapsed.
        timeout: Duration,
        /// Output captured before the process was killed.
        captured: String,
    },

    /// The run was cancelled while the process was running.
    #[error("'{subcommand}' cancelled: {reason}")]
    Cancelled {
        /// The engine subcommand.
        subcommand: String,
        /// The cancellation reason.
        reason: String,
        /// Output captured before the process was killed.
        captured: String,
    },
}

impl EngineError {
    /// Creates a launch error.
    #[must_use]
    pub fn launch(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Launch {
            program: program.into(),
            message: message.into(),
        }
    }

    /// Output captured before the failure, if any.
    #[must_use]
    pub fn captured(&self) -> &str {
        match self {
            Self::Launch { .. } => "",
            Self::Timeout { captured, .. } | Self::Cancelled { captured, .. } => captured,
        }
    }
}

/// Result type alias for mdflow operations.
pub type Result<T> = std::result::Result<T, MdflowError>;
