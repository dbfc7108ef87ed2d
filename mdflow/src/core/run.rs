//! The record of one pipeline run.

use super::{FailureReason, RunStatus, StageResult};
use crate::errors::{MissingDependencyError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// File name of the run report written into the root work directory.
pub const RUN_REPORT_FILE: &str = "run.json";

/// Ordered stage results of one run plus its terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique ID of this run.
    pub run_id: Uuid,
    /// The pipeline name.
    pub pipeline: String,
    /// Root work directory holding all stage directories.
    pub root_work_dir: PathBuf,
    /// Overall status.
    pub status: RunStatus,
    /// Stage results, in execution order.
    pub stages: Vec<StageResult>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Creates a new running record.
    #[must_use]
    pub fn new(pipeline: impl Into<String>, root_work_dir: &Path) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline: pipeline.into(),
            root_work_dir: root_work_dir.to_path_buf(),
            status: RunStatus::Running,
            stages: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub(crate) fn record(&mut self, result: StageResult) {
        self.stages.push(result);
    }

    pub(crate) fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Returns true if every stage succeeded or was skipped.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Returns the failing stage, if the run aborted.
    #[must_use]
    pub fn failed_stage(&self) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.is_failure())
    }

    /// The failing stage's missing upstream output, as an error.
    #[must_use]
    pub fn dependency_error(&self) -> Option<MissingDependencyError> {
        let failed = self.failed_stage()?;
        match failed.failure.as_ref()? {
            FailureReason::MissingDependency { file, directory } => Some(
                MissingDependencyError::new(&failed.stage_name, file, directory),
            ),
            _ => None,
        }
    }

    /// Gets a stage result by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage_name == name)
    }

    /// Names of the stages recorded with the given predicate.
    fn names_where(&self, pred: impl Fn(&StageResult) -> bool) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| pred(s))
            .map(|s| s.stage_name.as_str())
            .collect()
    }

    /// Stages that ran and succeeded.
    #[must_use]
    pub fn stages_succeeded(&self) -> Vec<&str> {
        self.names_where(|s| s.status == super::StageStatus::Succeeded)
    }

    /// Stages that were skipped.
    #[must_use]
    pub fn stages_skipped(&self) -> Vec<&str> {
        self.names_where(|s| s.status == super::StageStatus::Skipped)
    }

    /// Output directory of the last recorded stage.
    #[must_use]
    pub fn last_output_dir(&self) -> Option<&Path> {
        self.stages.last().map(|s| s.output_dir.as_path())
    }

    /// Writes the run report as pretty JSON into the root work directory.
    pub fn write_report(&self) -> Result<PathBuf> {
        let path = self.root_work_dir.join(RUN_REPORT_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    /// Converts the run to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("run_id".to_string(), serde_json::json!(self.run_id.to_string()));
        map.insert("pipeline".to_string(), serde_json::json!(self.pipeline));
        map.insert("status".to_string(), serde_json::json!(self.status.to_string()));
        map.insert(
            "root_work_dir".to_string(),
            serde_json::json!(self.root_work_dir.display().to_string()),
        );
        map.insert(
            "stages".to_string(),
            serde_json::json!(self.stages.iter().map(StageResult::to_dict).collect::<Vec<_>>()),
        );
        if let Some(failed) = self.failed_stage() {
            map.insert("failed_stage".to_string(), serde_json::json!(failed.stage_name));
        }
        map
    }
}
