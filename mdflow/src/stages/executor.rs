//! Runs one stage inside its own directory.

use super::manifest::{hash_parameters, StageManifest};
use super::{Placeholders, StageDescriptor};
use crate::cancellation::CancellationToken;
use crate::core::{FailureReason, StageResult};
use crate::engine::{Engine, EngineInvoker, InvocationResult};
use crate::events::{event_types, EventSink, NoOpEventSink};
use crate::utils::{copy_into, glob_to_regex, is_non_empty_file, matching_files, missing_or_empty};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default number of log lines kept on a failed stage result.
pub const DEFAULT_EXCERPT_LINES: usize = 40;

/// Prepares a stage directory, runs the stage's engine calls and verifies
/// its outputs.
///
/// The executor only writes inside the stage directory it is given.
#[derive(Clone)]
pub struct StageExecutor {
    engine: Arc<dyn Engine>,
    events: Arc<dyn EventSink>,
    default_timeout: Option<Duration>,
    excerpt_lines: usize,
    write_logs: bool,
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("engine", &self.engine.program())
            .field("default_timeout", &self.default_timeout)
            .field("excerpt_lines", &self.excerpt_lines)
            .finish_non_exhaustive()
    }
}

/// Why preparation stopped.
type Prepared = Result<(), FailureReason>;

impl StageExecutor {
    /// Creates an executor over `engine`.
    #[must_use]
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            events: Arc::new(NoOpEventSink),
            default_timeout: None,
            excerpt_lines: DEFAULT_EXCERPT_LINES,
            write_logs: true,
        }
    }

    /// Sets the event sink receiving `engine.*` events.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Timeout for engine calls that do not declare their own.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Number of log lines kept on failed results.
    #[must_use]
    pub fn with_excerpt_lines(mut self, lines: usize) -> Self {
        self.excerpt_lines = lines;
        self
    }

    /// Disables per-call log files.
    #[must_use]
    pub fn without_log_files(mut self) -> Self {
        self.write_logs = false;
        self
    }

    /// The engine backend.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Returns true if every produced output of the stage is present and
    /// non-empty in `stage_dir`.
    #[must_use]
    pub fn outputs_complete(descriptor: &StageDescriptor, stage_dir: &Path) -> bool {
        !descriptor.produced_outputs().is_empty()
            && missing_or_empty(stage_dir, descriptor.produced_outputs()).is_empty()
    }

    /// Executes (or skips) one stage.
    pub async fn run(
        &self,
        descriptor: &StageDescriptor,
        previous_dir: &Path,
        stage_dir: &Path,
        force: bool,
        cancel: &CancellationToken,
    ) -> StageResult {
        let started_at = Utc::now();
        let name = descriptor.name();

        if !force && Self::outputs_complete(descriptor, stage_dir) {
            warn_on_changed_parameters(descriptor, stage_dir);
            info!(stage = %name, dir = %stage_dir.display(), "Outputs present, skipping stage");
            return StageResult::skipped(name, stage_dir, started_at);
        }

        if cancel.is_cancelled() {
            return StageResult::failed(
                name,
                stage_dir,
                started_at,
                FailureReason::Cancelled {
                    reason: cancel.reason_or_default(),
                },
            );
        }

        let template = match self.prepare(descriptor, previous_dir, stage_dir) {
            Ok(template) => template,
            Err(reason) => return StageResult::failed(name, stage_dir, started_at, reason),
        };

        self.execute_calls(descriptor, stage_dir, &template, started_at, cancel)
            .await
    }

    /// Creates the directory, copies inputs and writes the template copy.
    ///
    /// Returns the template bytes as written.
    fn prepare(
        &self,
        descriptor: &StageDescriptor,
        previous_dir: &Path,
        stage_dir: &Path,
    ) -> Result<Vec<u8>, FailureReason> {
        std::fs::create_dir_all(stage_dir)
            .map_err(|e| FailureReason::io(format!("create {}", stage_dir.display()), &e))?;

        copy_required_inputs(descriptor, previous_dir, stage_dir)?;
        copy_carry_over(descriptor, previous_dir, stage_dir)?;
        materialize_template(descriptor, stage_dir)
    }

    async fn execute_calls(
        &self,
        descriptor: &StageDescriptor,
        stage_dir: &Path,
        template: &[u8],
        started_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> StageResult {
        let name = descriptor.name();
        let placeholders = Placeholders::for_stage(descriptor, stage_dir);
        let mut invoker =
            EngineInvoker::new(self.engine.as_ref()).with_default_timeout(self.default_timeout);
        if !self.write_logs {
            invoker = invoker.without_log_files();
        }

        let mut summaries = Vec::with_capacity(descriptor.engine_calls().len());
        let mut last: Option<InvocationResult> = None;

        for (index, call) in descriptor.engine_calls().iter().enumerate() {
            self.events
                .emit(
                    event_types::ENGINE_INVOKED,
                    Some(serde_json::json!({
                        "stage": name,
                        "index": index,
                        "subcommand": call.subcommand,
                    })),
                )
                .await;

            let result = invoker.invoke(index, call, &placeholders, cancel).await;
            summaries.push(result.summary());

            self.events
                .emit(
                    event_types::ENGINE_COMPLETED,
                    Some(serde_json::json!({
                        "stage": name,
                        "index": index,
                        "subcommand": result.subcommand,
                        "exit_code": result.exit_code,
                        "duration_ms": result.duration.as_secs_f64() * 1000.0,
                        "failure": result.failure.as_ref().map(ToString::to_string),
                    })),
                )
                .await;

            if let Some(reason) = result.failure.clone() {
                return StageResult::failed(name, stage_dir, started_at, reason)
                    .with_exit_code(result.exit_code)
                    .with_log_excerpt(result.log.excerpt(self.excerpt_lines))
                    .with_invocations(summaries);
            }
            last = Some(result);
        }

        let exit_code = last.as_ref().and_then(|r| r.exit_code);
        let missing = missing_or_empty(stage_dir, descriptor.produced_outputs());
        if !missing.is_empty() {
            let excerpt = last
                .as_ref()
                .map(|r| r.log.excerpt(self.excerpt_lines))
                .unwrap_or_default();
            return StageResult::failed(
                name,
                stage_dir,
                started_at,
                FailureReason::SilentFailure {
                    subcommand: None,
                    missing,
                },
            )
            .with_exit_code(exit_code)
            .with_log_excerpt(excerpt)
            .with_invocations(summaries);
        }

        let written = StageManifest::for_stage(descriptor, template)
            .and_then(|manifest| manifest.write(stage_dir));
        if let Err(e) = written {
            warn!(stage = %name, error = %e, "Could not write stage manifest");
        }

        StageResult::succeeded(name, stage_dir, started_at)
            .with_exit_code(exit_code)
            .with_invocations(summaries)
    }
}

fn copy_required_inputs(
    descriptor: &StageDescriptor,
    previous_dir: &Path,
    stage_dir: &Path,
) -> Prepared {
    for input in descriptor.required_inputs() {
        let source = previous_dir.join(input);
        if !is_non_empty_file(&source) {
            return Err(FailureReason::MissingDependency {
                file: input.clone(),
                directory: previous_dir.to_path_buf(),
            });
        }
        copy_into(&source, stage_dir).map_err(|e| FailureReason::io(format!("copy {input}"), &e))?;
        debug!(stage = %descriptor.name(), file = %input, "Copied required input");
    }
    Ok(())
}

fn copy_carry_over(
    descriptor: &StageDescriptor,
    previous_dir: &Path,
    stage_dir: &Path,
) -> Prepared {
    for pattern in descriptor.carry_over_patterns() {
        let Ok(re) = glob_to_regex(pattern) else {
            warn!(
                stage = %descriptor.name(),
                pattern = %pattern,
                "Skipping invalid carry-over pattern"
            );
            continue;
        };
        let matches = matching_files(previous_dir, &re)
            .map_err(|e| FailureReason::io(format!("list {}", previous_dir.display()), &e))?;
        for source in matches {
            let already_copied = source
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| descriptor.required_inputs().iter().any(|r| r == n));
            if already_copied {
                continue;
            }
            copy_into(&source, stage_dir)
                .map_err(|e| FailureReason::io(format!("copy {}", source.display()), &e))?;
        }
    }
    Ok(())
}

/// Writes the stage's template copy, applying overrides. The source
/// template is only read.
fn materialize_template(
    descriptor: &StageDescriptor,
    stage_dir: &Path,
) -> Result<Vec<u8>, FailureReason> {
    let source = descriptor.config_template();
    let file_name = descriptor.template_file_name().ok_or_else(|| FailureReason::Io {
        operation: format!("resolve template {}", source.display()),
        message: "template path has no file name".to_string(),
    })?;
    let bytes = std::fs::read(source)
        .map_err(|e| FailureReason::io(format!("read template {}", source.display()), &e))?;

    let written = if descriptor.overrides().is_empty() {
        bytes
    } else {
        let applied = descriptor.overrides().apply(&String::from_utf8_lossy(&bytes));
        for key in &applied.unmatched {
            warn!(
                stage = %descriptor.name(),
                key = %key,
                "Override key not found in template, ignoring"
            );
        }
        applied.content.into_bytes()
    };

    std::fs::write(stage_dir.join(file_name), &written)
        .map_err(|e| FailureReason::io(format!("write template copy {file_name}"), &e))?;
    Ok(written)
}

fn warn_on_changed_parameters(descriptor: &StageDescriptor, stage_dir: &Path) {
    let Some(manifest) = StageManifest::read(stage_dir) else {
        return;
    };
    let Some(file_name) = descriptor.template_file_name() else {
        return;
    };
    // The copy in the stage directory is what the outputs were produced from;
    // compare against what would be written now.
    let current = match std::fs::read(descriptor.config_template()) {
        Ok(bytes) if descriptor.overrides().is_empty() => bytes,
        Ok(bytes) => descriptor
            .overrides()
            .apply(&String::from_utf8_lossy(&bytes))
            .content
            .into_bytes(),
        Err(e) => {
            debug!(
                stage = %descriptor.name(),
                template = %file_name,
                error = %e,
                "Template unreadable, not comparing parameters"
            );
            return;
        }
    };
    match hash_parameters(&current, descriptor) {
        Ok(hash) if hash != manifest.params_hash => warn!(
            stage = %descriptor.name(),
            completed_at = %manifest.completed_at,
            "Stage parameters changed since its outputs were produced; \
             skipping anyway (use force to re-run)"
        ),
        Ok(_) => {}
        Err(e) => debug!(stage = %descriptor.name(), error = %e, "Could not hash stage parameters"),
    }
}
