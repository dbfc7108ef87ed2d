//! Testing utilities for mdflow pipelines.
//!
//! This module provides:
//! - A scripted engine that imitates GROMACS output files
//! - Assertions over stage results and runs
//! - On-disk fixtures for the standard pipeline

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_outputs_present, assert_run_status, assert_stage_failed_with, assert_stage_skipped,
    assert_stage_succeeded,
};
pub use fixtures::{StandardFixture, SAMPLE_PDB};
pub use mocks::{RecordedCall, ScriptedEngine, StubBehavior};
