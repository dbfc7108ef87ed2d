//! Sequential pipeline execution over stage directories.

use super::builder::stage_dir_name;
use super::lock::RunLock;
use super::prerequisites::preflight;
use super::Pipeline;
use crate::cancellation::CancellationToken;
use crate::config::SimulationSettings;
use crate::core::{FailureReason, PipelineRun, RunStatus, StageResult, StageStatus};
use crate::engine::Engine;
use crate::errors::Result;
use crate::events::{event_types, EventSink, NoOpEventSink};
use crate::observability::{RunSpanAttributes, SpanTimer, StageSpanAttributes};
use crate::stages::{StageDescriptor, StageExecutor};
use crate::utils::missing_or_empty;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};

/// Runs a pipeline stage by stage, stopping at the first failure.
///
/// The orchestrator holds no per-run state and may drive independent runs
/// on distinct root directories concurrently.
#[derive(Clone)]
pub struct Orchestrator {
    executor: StageExecutor,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator over `engine`.
    #[must_use]
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            executor: StageExecutor::new(engine),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Creates an orchestrator using the timeout and excerpt length from
    /// `settings`.
    #[must_use]
    pub fn from_settings(engine: Arc<dyn Engine>, settings: &SimulationSettings) -> Self {
        Self::new(engine)
            .with_default_timeout(settings.stage_timeout())
            .with_excerpt_lines(settings.log_excerpt_lines)
    }

    /// Sets the sink receiving lifecycle events.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.executor = self.executor.with_event_sink(events.clone());
        self.events = events;
        self
    }

    /// Timeout for engine calls that do not declare their own.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.executor = self.executor.with_default_timeout(timeout);
        self
    }

    /// Number of log lines kept on a failed stage.
    #[must_use]
    pub fn with_excerpt_lines(mut self, lines: usize) -> Self {
        self.executor = self.executor.with_excerpt_lines(lines);
        self
    }

    /// Disables per-call log files in stage directories.
    #[must_use]
    pub fn without_log_files(mut self) -> Self {
        self.executor = self.executor.without_log_files();
        self
    }

    /// The engine backend.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn Engine> {
        self.executor.engine()
    }

    /// Runs `pipeline` under `root_work_dir` with seed inputs already in place.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::run_seeded`].
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        root_work_dir: &Path,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<PipelineRun> {
        self.run_seeded(pipeline, root_work_dir, &[], force, cancel)
            .await
    }

    /// Runs `pipeline` under `root_work_dir`, copying `seeds` into the root
    /// once the work directory lock is held.
    ///
    /// Stages whose outputs are already present are skipped unless `force`
    /// is set. Stage failures abort the run and are recorded on the returned
    /// [`PipelineRun`]; `Err` means the run could not start or its report
    /// could not be written.
    ///
    /// # Errors
    ///
    /// - `MissingPrerequisite` if the engine or a template is absent
    /// - `ConcurrentRun` if another run holds the root directory
    /// - `Io` if a seed cannot be copied, or the root directory or run
    ///   report cannot be written
    pub async fn run_seeded(
        &self,
        pipeline: &Pipeline,
        root_work_dir: &Path,
        seeds: &[SeedFile],
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<PipelineRun> {
        let root = absolute(root_work_dir)?;
        preflight(self.engine().as_ref(), pipeline)?;

        let mut run = PipelineRun::new(pipeline.name(), &root);
        let _lock = RunLock::acquire(&root, run.run_id)?;
        for seed in seeds {
            seed.place(&root)?;
        }

        let run_id = run.run_id;
        cancel.on_cancel(move || {
            warn!(run_id = %run_id, "Cancellation requested, stopping run");
        });

        let attrs = RunSpanAttributes::new()
            .with_pipeline_name(pipeline.name())
            .with_run_id(run_id.to_string())
            .with_root_work_dir(root.display().to_string())
            .with_force(force);
        let span = info_span!(
            "mdflow.run",
            run_id = %run_id,
            pipeline = %pipeline.name(),
            root = %root.display(),
        );

        let timer = SpanTimer::start(pipeline.name());
        self.events
            .emit(event_types::PIPELINE_STARTED, Some(attrs.to_event_data()))
            .await;

        let status = self
            .run_stages(pipeline, &root, force, cancel, &mut run)
            .instrument(span)
            .await;
        run.finish(status);
        let duration_ms = timer.finish();

        let mut data = attrs.to_event_data();
        if let Some(map) = data.as_object_mut() {
            map.insert("status".to_string(), serde_json::json!(status.to_string()));
            map.insert("duration_ms".to_string(), serde_json::json!(duration_ms));
            if let Some(failed) = run.failed_stage() {
                map.insert("failed_stage".to_string(), serde_json::json!(failed.stage_name));
            }
        }

        match status {
            RunStatus::Completed => {
                info!(run_id = %run_id, duration_ms, "Pipeline completed");
                self.events.emit(event_types::PIPELINE_COMPLETED, Some(data)).await;
            }
            _ => {
                error!(
                    run_id = %run_id,
                    failed_stage = run.failed_stage().map(|s| s.stage_name.as_str()),
                    "Pipeline aborted"
                );
                self.events.emit(event_types::PIPELINE_ABORTED, Some(data)).await;
            }
        }

        run.write_report()?;
        Ok(run)
    }

    async fn run_stages(
        &self,
        pipeline: &Pipeline,
        root: &Path,
        force: bool,
        cancel: &CancellationToken,
        run: &mut PipelineRun,
    ) -> RunStatus {
        let mut previous: Option<(&StageDescriptor, PathBuf)> = None;

        for (index, descriptor) in pipeline.stages().iter().enumerate() {
            let stage_dir = root.join(stage_dir_name(index, descriptor.name()));
            let previous_dir = previous
                .as_ref()
                .map_or_else(|| root.to_path_buf(), |(_, dir)| dir.clone());
            let span = info_span!("mdflow.stage", stage = %descriptor.name(), index);

            let result = self
                .run_stage(
                    index,
                    descriptor,
                    previous.as_ref().map(|(d, _)| *d),
                    &previous_dir,
                    &stage_dir,
                    force,
                    cancel,
                )
                .instrument(span)
                .await;

            let failed = result.is_failure();
            run.record(result);
            if failed {
                return RunStatus::Aborted;
            }
            previous = Some((descriptor, stage_dir));
        }

        RunStatus::Completed
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stage(
        &self,
        index: usize,
        descriptor: &StageDescriptor,
        previous: Option<&StageDescriptor>,
        previous_dir: &Path,
        stage_dir: &Path,
        force: bool,
        cancel: &CancellationToken,
    ) -> StageResult {
        let timer = SpanTimer::start(descriptor.name());
        let attrs = StageSpanAttributes::new(descriptor.name(), index)
            .with_output_dir(stage_dir.display().to_string());
        self.events
            .emit(event_types::STAGE_STARTED, Some(attrs.to_event_data()))
            .await;

        let refusal =
            self.refuse_to_start(descriptor, previous, previous_dir, stage_dir, force, cancel);
        let result = match refusal {
            Some(reason) => StageResult::failed(descriptor.name(), stage_dir, Utc::now(), reason),
            None => {
                self.executor
                    .run(descriptor, previous_dir, stage_dir, force, cancel)
                    .await
            }
        };

        let duration_ms = timer.finish();
        let mut attrs = attrs
            .with_status(result.status.to_string())
            .with_duration_ms(duration_ms);
        let event_type = match result.status {
            StageStatus::Skipped => event_types::STAGE_SKIPPED,
            StageStatus::Succeeded => {
                info!(stage = %descriptor.name(), duration_ms, "Stage succeeded");
                event_types::STAGE_SUCCEEDED
            }
            StageStatus::Failed => {
                if let Some(ref failure) = result.failure {
                    error!(
                        stage = %descriptor.name(),
                        failure = failure.code(),
                        exit_code = result.exit_code,
                        error = %failure,
                        "Stage failed"
                    );
                    attrs = attrs.with_error(failure.to_string());
                }
                event_types::STAGE_FAILED
            }
        };

        let mut data = attrs.to_event_data();
        if let (Some(map), Some(failure)) = (data.as_object_mut(), result.failure.as_ref()) {
            map.insert("failure".to_string(), serde_json::json!(failure.code()));
        }
        self.events.emit(event_type, Some(data)).await;

        result
    }

    /// Checks run-level conditions that fail a stage without calling the
    /// engine: a pending cancellation, or an upstream output that has gone
    /// missing. Stages about to be skipped are not held to the upstream check.
    fn refuse_to_start(
        &self,
        descriptor: &StageDescriptor,
        previous: Option<&StageDescriptor>,
        previous_dir: &Path,
        stage_dir: &Path,
        force: bool,
        cancel: &CancellationToken,
    ) -> Option<FailureReason> {
        if cancel.is_cancelled() {
            return Some(FailureReason::Cancelled {
                reason: cancel.reason_or_default(),
            });
        }

        let previous = previous?;
        if !force && StageExecutor::outputs_complete(descriptor, stage_dir) {
            return None;
        }

        let missing = missing_or_empty(previous_dir, previous.produced_outputs());
        missing.into_iter().next().map(|file| {
            error!(
                stage = %descriptor.name(),
                upstream = %previous.name(),
                file = %file,
                "Upstream output missing although the stage completed"
            );
            FailureReason::MissingDependency {
                file,
                directory: previous_dir.to_path_buf(),
            }
        })
    }
}

/// A file copied into the root work directory before the first stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedFile {
    /// Where the file comes from.
    pub source: PathBuf,
    /// File name inside the root.
    pub name: String,
}

impl SeedFile {
    /// Creates a seed copied from `source` to `<root>/<name>`.
    #[must_use]
    pub fn new(source: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
        }
    }

    fn place(&self, root: &Path) -> std::io::Result<PathBuf> {
        let target = root.join(&self.name);
        let same_file = match (self.source.canonicalize(), target.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        if !same_file {
            std::fs::copy(&self.source, &target)?;
        }
        Ok(target)
    }
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;
    use crate::errors::MdflowError;
    use crate::pipeline::PipelineBuilder;
    use crate::stages::EngineInvocation;
    use crate::testing::ScriptedEngine;

    fn single_stage_pipeline(dir: &Path) -> Pipeline {
        let template = dir.join("em.mdp");
        std::fs::write(&template, "nsteps = 10\n").unwrap();
        PipelineBuilder::new("single")
            .stage(
                StageDescriptor::new("em", template)
                    .produces(["em.gro"])
                    .call(EngineInvocation::new("mdrun").args(["-deffnm", "em"])),
            )
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_fails_fast_without_engine() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = single_stage_pipeline(dir.path());

        let mut engine = MockEngine::new();
        engine.expect_locate().returning(|| None);
        engine.expect_program().returning(|| "gmx".to_string());
        engine.expect_execute().never();

        let orchestrator = Orchestrator::new(Arc::new(engine));
        let root = dir.path().join("run");
        let err = orchestrator
            .run(&pipeline, &root, false, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, MdflowError::MissingPrerequisite(_)));
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_run_releases_lock_and_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = single_stage_pipeline(dir.path());
        let root = dir.path().join("run");

        let orchestrator = Orchestrator::new(Arc::new(ScriptedEngine::new()));
        let run = orchestrator
            .run(&pipeline, &root, false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert!(root.join(crate::core::RUN_REPORT_FILE).exists());
        assert!(!root.join(crate::pipeline::LOCK_FILE).exists());
        assert!(root.join("00_em/em.gro").exists());
    }

    #[tokio::test]
    async fn test_cancel_before_first_stage() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = single_stage_pipeline(dir.path());
        let root = dir.path().join("run");
        let engine = Arc::new(ScriptedEngine::new());
        let cancel = CancellationToken::new();
        cancel.cancel("shutdown");

        let run = Orchestrator::new(engine.clone())
            .run(&pipeline, &root, false, &cancel)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Aborted);
        assert_eq!(
            run.stages[0].failure,
            Some(FailureReason::Cancelled {
                reason: "shutdown".to_string()
            })
        );
        assert_eq!(engine.call_count(), 0);
        assert!(!root.join("00_em").exists());
    }
}
