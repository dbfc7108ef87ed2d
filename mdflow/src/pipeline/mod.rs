//! Pipeline building and execution.
//!
//! This module provides:
//! - The pipeline builder with hand-off validation
//! - Preflight checks and the work directory lock
//! - The orchestrator that runs stages in order and stops at the first failure

mod builder;
mod lock;
mod orchestrator;
mod prerequisites;

#[cfg(test)]
mod integration_tests;

pub use builder::{stage_dir_name, Pipeline, PipelineBuilder};
pub use lock::{LockHolder, RunLock, LOCK_FILE};
pub use orchestrator::{Orchestrator, SeedFile};
pub use prerequisites::{check_engine, check_templates, preflight, RequirementsReport};
