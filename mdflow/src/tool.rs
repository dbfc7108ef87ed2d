//! Agent-facing entry point: run the standard pipeline on one structure.
//!
//! The caller hands in a structure file and optionally a work directory; the
//! structure is copied into the root as the seed input and the standard
//! `minimization -> nvt -> npt` pipeline is run against it. The returned
//! [`SimulationReport`] is what the agent shows to the user.

use crate::cancellation::CancellationToken;
use crate::config::{ParameterOverrides, SimulationSettings};
use crate::core::{PipelineRun, RunStatus, StageStatus};
use crate::engine::{Engine, ProcessEngine};
use crate::errors::{ConfigurationError, ErrorInfo, MissingPrerequisiteError, Result};
use crate::events::LoggingEventSink;
use crate::pipeline::{
    check_engine, check_templates, Orchestrator, Pipeline, PipelineBuilder, RequirementsReport,
    SeedFile,
};
use crate::stages::{standard_stages, StageDescriptor, SEED_STRUCTURE, STANDARD_STAGES};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Parameters of one simulation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationRequest {
    /// The input structure (PDB).
    pub structure: PathBuf,
    /// Root work directory; defaults to `<simulations_dir>/<structure stem>`.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// Re-run stages even if their outputs exist.
    #[serde(default)]
    pub force: bool,
    /// Last stage to run.
    #[serde(default)]
    pub stop_after: Option<String>,
    /// Per-stage parameter overrides, applied over the configured ones.
    #[serde(default)]
    pub overrides: BTreeMap<String, ParameterOverrides>,
}

impl SimulationRequest {
    /// Creates a request for `structure` with defaults.
    #[must_use]
    pub fn new(structure: impl Into<PathBuf>) -> Self {
        Self {
            structure: structure.into(),
            ..Self::default()
        }
    }

    /// Sets the root work directory.
    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Sets the force flag.
    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Stops after the named stage.
    #[must_use]
    pub fn stop_after(mut self, stage: impl Into<String>) -> Self {
        self.stop_after = Some(stage.into());
        self
    }

    /// Selects stages by list. The list must be a prefix of the standard
    /// stage order.
    pub fn with_stages<S: AsRef<str>>(
        mut self,
        stages: &[S],
    ) -> std::result::Result<Self, ConfigurationError> {
        let is_prefix = !stages.is_empty()
            && stages.len() <= STANDARD_STAGES.len()
            && stages
                .iter()
                .zip(STANDARD_STAGES)
                .all(|(given, expected)| given.as_ref() == expected);
        if !is_prefix {
            let given: Vec<String> = stages.iter().map(|s| s.as_ref().to_string()).collect();
            return Err(ConfigurationError::new(format!(
                "Stages [{}] are not a prefix of [{}]",
                given.join(", "),
                STANDARD_STAGES.join(", ")
            ))
            .with_stages(given)
            .with_error_info(
                ErrorInfo::new(
                    "MDFLOW-001-STAGE_SELECTION",
                    "Stage selection must follow pipeline order",
                )
                .with_fix_hint(
                    "Each stage needs the previous one's outputs; \
                     list stages from the first one on.",
                ),
            ));
        }
        self.stop_after = stages.last().map(|s| s.as_ref().to_string());
        Ok(self)
    }

    /// Adds overrides for one stage.
    #[must_use]
    pub fn with_overrides(
        mut self,
        stage: impl Into<String>,
        overrides: ParameterOverrides,
    ) -> Self {
        self.overrides.insert(stage.into(), overrides);
        self
    }

    fn root_dir(&self, settings: &SimulationSettings) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(|| {
            let stem = self
                .structure
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("simulation");
            settings.simulations_dir().join(stem)
        })
    }
}

/// Outcome of one stage as shown to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    /// Stage name.
    pub name: String,
    /// Stage status.
    pub status: StageStatus,
    /// Stage directory.
    pub output_dir: PathBuf,
}

/// What the agent gets back from a simulation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    /// Terminal run status.
    pub status: RunStatus,
    /// Run ID.
    pub run_id: String,
    /// Root work directory.
    pub work_dir: PathBuf,
    /// Final structure of the last stage, on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<PathBuf>,
    /// Name of the failing stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    /// Failure class of the failing stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<String>,
    /// Description of the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Tail of the failing engine call's output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_excerpt: Option<String>,
    /// Per-stage outcomes, in order.
    pub stages: Vec<StageOutcome>,
    /// Human-readable summary.
    pub message: String,
}

impl SimulationReport {
    /// Summarizes a finished run of `pipeline`.
    #[must_use]
    pub fn from_run(pipeline: &Pipeline, run: &PipelineRun) -> Self {
        let stages = run
            .stages
            .iter()
            .map(|s| StageOutcome {
                name: s.stage_name.clone(),
                status: s.status,
                output_dir: s.output_dir.clone(),
            })
            .collect();
        let failed = run.failed_stage();

        let final_output = if run.is_completed() {
            pipeline
                .stages()
                .last()
                .zip(run.last_output_dir())
                .and_then(|(stage, dir)| final_structure(stage).map(|f| dir.join(f)))
        } else {
            None
        };

        let message = match (failed, &final_output) {
            (Some(stage), _) => format!(
                "MD simulation failed at stage '{}': {}",
                stage.stage_name,
                stage
                    .failure
                    .as_ref()
                    .map_or_else(|| "unknown failure".to_string(), ToString::to_string)
            ),
            (None, Some(path)) => format!(
                "MD simulation completed successfully. Final output: {}",
                path.display()
            ),
            (None, None) => format!("MD simulation finished with status {}", run.status),
        };

        Self {
            status: run.status,
            run_id: run.run_id.to_string(),
            work_dir: run.root_work_dir.clone(),
            final_output,
            failed_stage: failed.map(|s| s.stage_name.clone()),
            failure_kind: failed.and_then(|s| s.failure.as_ref()).map(|f| f.code().to_string()),
            failure: failed.and_then(|s| s.failure.as_ref()).map(ToString::to_string),
            log_excerpt: failed
                .map(|s| s.log_excerpt.clone())
                .filter(|e| !e.is_empty()),
            stages,
            message,
        }
    }

    /// Returns true if the run completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// The structure file a stage leaves for its successor.
fn final_structure(stage: &StageDescriptor) -> Option<&str> {
    stage
        .produced_outputs()
        .iter()
        .find(|f| f.ends_with(".gro"))
        .or_else(|| stage.produced_outputs().first())
        .map(String::as_str)
}

fn effective_settings(
    settings: &SimulationSettings,
    request: &SimulationRequest,
) -> SimulationSettings {
    let mut settings = settings.clone();
    for (stage, overrides) in &request.overrides {
        let base = settings.overrides.remove(stage).unwrap_or_default();
        settings.overrides.insert(stage.clone(), base.merged(overrides));
    }
    settings
}

/// Turns a finished run into a report.
///
/// A missing upstream output means a stage recorded as complete lost its
/// files, which is an ordering bug rather than a simulation failure, so it
/// is returned as an error.
fn into_report(pipeline: &Pipeline, run: &PipelineRun) -> Result<SimulationReport> {
    if let Some(err) = run.dependency_error() {
        error!(run_id = %run.run_id, error = %err, "Pipeline invariant violated");
        return Err(err.into());
    }
    let report = SimulationReport::from_run(pipeline, run);
    if report.is_success() {
        info!(run_id = %report.run_id, "{}", report.message);
    } else {
        warn!(run_id = %report.run_id, "{}", report.message);
    }
    Ok(report)
}

/// Runs the standard pipeline with the configured engine binary.
///
/// # Errors
///
/// Returns an error if the run cannot start: missing structure, engine or
/// templates, an invalid stage selection, or a work directory held by
/// another run. A stage that finds an upstream output missing is returned
/// as `MissingDependency`; other stage failures are reported in the
/// returned report.
pub async fn run_simulation(
    request: SimulationRequest,
    settings: &SimulationSettings,
) -> Result<SimulationReport> {
    let engine = Arc::new(ProcessEngine::new(settings.engine.clone()));
    run_simulation_with(engine, request, settings, &CancellationToken::new()).await
}

/// Runs the standard pipeline over the given engine backend.
///
/// # Errors
///
/// Same as [`run_simulation`].
pub async fn run_simulation_with(
    engine: Arc<dyn Engine>,
    request: SimulationRequest,
    settings: &SimulationSettings,
    cancel: &CancellationToken,
) -> Result<SimulationReport> {
    if !request.structure.is_file() {
        return Err(MissingPrerequisiteError::input_structure(&request.structure).into());
    }

    let settings = effective_settings(settings, &request);
    let stages = standard_stages(&settings);
    check_engine(engine.as_ref())?;
    check_templates(&stages)?;

    let mut pipeline = PipelineBuilder::new("md")
        .seed_inputs([SEED_STRUCTURE])
        .stages(stages)?
        .build()?;
    if let Some(ref last) = request.stop_after {
        pipeline = pipeline.truncated(last)?;
    }

    let root = request.root_dir(&settings);
    let seed = SeedFile::new(&request.structure, SEED_STRUCTURE);

    info!(
        structure = %request.structure.display(),
        root = %root.display(),
        force = request.force,
        stages = pipeline.len(),
        "Starting MD simulation"
    );
    let run = Orchestrator::from_settings(engine, &settings)
        .with_event_sink(Arc::new(LoggingEventSink::debug()))
        .run_seeded(&pipeline, &root, &[seed], request.force, cancel)
        .await?;

    into_report(&pipeline, &run)
}

/// Blocking variant of [`run_simulation`] that drives its own runtime.
pub fn run_simulation_blocking(
    request: SimulationRequest,
    settings: &SimulationSettings,
) -> Result<SimulationReport> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_simulation(request, settings))
}

/// Reports whether the engine binary and standard templates are available.
#[must_use]
pub fn check_requirements(settings: &SimulationSettings) -> RequirementsReport {
    let engine = ProcessEngine::new(settings.engine.clone());
    RequirementsReport::collect(&engine, &standard_stages(settings))
}
