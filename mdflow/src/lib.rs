//! # mdflow
//!
//! Staged orchestration of GROMACS molecular-dynamics preparation and
//! equilibration runs.
//!
//! mdflow drives an external MD engine through an ordered list of stages
//! (energy minimization, NVT and NPT equilibration by default). Each stage
//! runs in its own `NN_<stage>` directory under a root work directory:
//!
//! - **Explicit stages**: a [`stages::StageDescriptor`] declares required
//!   inputs, produced outputs, a parameter template and the engine calls
//! - **Idempotent resume**: stages whose outputs already exist are skipped
//! - **Outcome classification**: non-zero exits, fatal log lines and silent
//!   failures (exit 0 without usable output) all fail the stage
//! - **Failure containment**: the first failing stage aborts the run and its
//!   log excerpt is kept for diagnosis
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mdflow::prelude::*;
//!
//! let settings = SimulationSettings::load()?;
//! let request = SimulationRequest::new("1abc.pdb").with_work_dir("runs/1abc");
//! let report = run_simulation(request, &settings).await?;
//! println!("{}", report.message);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod stages;
pub mod testing;
pub mod tool;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{ParameterOverrides, SimulationSettings};
    pub use crate::core::{FailureReason, PipelineRun, RunStatus, StageResult, StageStatus};
    pub use crate::engine::{Engine, EngineCommand, EngineExit, ProcessEngine};
    pub use crate::errors::{
        ConcurrentRunError, ConfigurationError, EngineError, MdflowError,
        MissingDependencyError, MissingPrerequisiteError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{Orchestrator, Pipeline, PipelineBuilder};
    pub use crate::stages::{standard_stages, EngineInvocation, StageDescriptor, StageExecutor};
    pub use crate::tool::{
        check_requirements, run_simulation, run_simulation_blocking, SimulationReport,
        SimulationRequest,
    };
    pub use crate::utils::{iso_timestamp, Timestamp};
}
