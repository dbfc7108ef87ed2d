//! Test assertions for stage results and runs.

use crate::core::{PipelineRun, RunStatus, StageResult, StageStatus};
use crate::utils::is_non_empty_file;

/// Asserts that the stage succeeded.
pub fn assert_stage_succeeded(result: &StageResult) {
    assert_eq!(
        result.status,
        StageStatus::Succeeded,
        "Expected stage '{}' to succeed, got {:?} ({:?})",
        result.stage_name,
        result.status,
        result.failure
    );
}

/// Asserts that the stage was skipped.
pub fn assert_stage_skipped(result: &StageResult) {
    assert_eq!(
        result.status,
        StageStatus::Skipped,
        "Expected stage '{}' to be skipped, got {:?}",
        result.stage_name,
        result.status
    );
}

/// Asserts that the stage failed with the given failure code.
pub fn assert_stage_failed_with(result: &StageResult, code: &str) {
    assert!(
        result.is_failure(),
        "Expected stage '{}' to fail, got {:?}",
        result.stage_name,
        result.status
    );
    let actual = result.failure.as_ref().map(crate::core::FailureReason::code);
    assert_eq!(
        actual,
        Some(code),
        "Unexpected failure for stage '{}': {:?}",
        result.stage_name,
        result.failure
    );
}

/// Asserts the run's terminal status.
pub fn assert_run_status(run: &PipelineRun, expected: RunStatus) {
    assert_eq!(
        run.status, expected,
        "Expected run status {expected:?}, got {:?}; failed stage: {:?}",
        run.status,
        run.failed_stage().map(|s| (&s.stage_name, &s.failure))
    );
}

/// Asserts that every produced output of a stage exists and is non-empty.
pub fn assert_outputs_present(result: &StageResult, outputs: &[&str]) {
    for output in outputs {
        let path = result.output_dir.join(output);
        assert!(
            is_non_empty_file(&path),
            "Expected non-empty output {} for stage '{}'",
            path.display(),
            result.stage_name
        );
    }
}
