//! Core domain model types for mdflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage and run status enums
//! - Stage results and failure reasons
//! - The pipeline run record

mod result;
mod run;
mod status;

pub use result::{FailureReason, InvocationSummary, StageResult};
pub use run::{PipelineRun, RUN_REPORT_FILE};
pub use status::{RunStatus, StageStatus};
