//! Preflight checks run before any stage.

use super::Pipeline;
use crate::engine::Engine;
use crate::errors::MissingPrerequisiteError;
use crate::stages::StageDescriptor;
use serde::Serialize;
use std::path::PathBuf;
use tracing::debug;

/// Verifies that the engine binary resolves.
///
/// # Errors
///
/// Returns the unresolved program name with a remediation hint.
pub fn check_engine(engine: &dyn Engine) -> Result<PathBuf, MissingPrerequisiteError> {
    let located = engine
        .locate()
        .ok_or_else(|| MissingPrerequisiteError::engine(engine.program()))?;
    debug!(engine = %located.display(), "Engine binary resolved");
    Ok(located)
}

/// Verifies that every stage template exists.
///
/// # Errors
///
/// Returns the first missing template.
pub fn check_templates<'a, I>(stages: I) -> Result<(), MissingPrerequisiteError>
where
    I: IntoIterator<Item = &'a StageDescriptor>,
{
    for stage in stages {
        if !stage.config_template().is_file() {
            return Err(MissingPrerequisiteError::template(
                stage.name(),
                stage.config_template(),
            ));
        }
    }
    Ok(())
}

/// Runs every preflight check for `pipeline` and returns the resolved
/// engine path.
///
/// # Errors
///
/// Returns `MissingPrerequisiteError` for the engine binary if it cannot be
/// located, otherwise for the first stage whose template is absent.
pub fn preflight(
    engine: &dyn Engine,
    pipeline: &Pipeline,
) -> Result<PathBuf, MissingPrerequisiteError> {
    let located = check_engine(engine)?;
    check_templates(pipeline.stages())?;
    Ok(located)
}

/// Availability report for the engine and templates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequirementsReport {
    /// Resolved engine path, when found.
    pub engine: Option<PathBuf>,
    /// Templates that were found.
    pub templates_found: Vec<PathBuf>,
    /// Templates that are missing.
    pub templates_missing: Vec<PathBuf>,
}

impl RequirementsReport {
    /// Collects the report without failing on the first miss.
    #[must_use]
    pub fn collect<'a, I>(engine: &dyn Engine, stages: I) -> Self
    where
        I: IntoIterator<Item = &'a StageDescriptor>,
    {
        let (found, missing): (Vec<_>, Vec<_>) = stages
            .into_iter()
            .map(|s| s.config_template().to_path_buf())
            .partition(|p| p.is_file());
        Self {
            engine: engine.locate(),
            templates_found: found,
            templates_missing: missing,
        }
    }

    /// Returns true if nothing is missing.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.engine.is_some() && self.templates_missing.is_empty()
    }
}
