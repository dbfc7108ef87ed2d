//! Stage definitions and the stage executor.
//!
//! A [`StageDescriptor`] is pure data: what a stage needs, what it makes and
//! which engine calls produce it. The [`StageExecutor`] turns a descriptor
//! into a [`crate::core::StageResult`] inside one stage directory.

mod descriptor;
mod executor;
pub mod manifest;
pub mod standard;

pub use descriptor::{
    EngineInvocation, Placeholders, StageDescriptor, STAGE_PLACEHOLDER, TEMPLATE_PLACEHOLDER,
    WORKDIR_PLACEHOLDER,
};
pub use executor::{StageExecutor, DEFAULT_EXCERPT_LINES};
pub use manifest::{hash_parameters, StageManifest, MANIFEST_FILE};
pub use standard::{standard_stages, SEED_STRUCTURE, STANDARD_STAGES};
