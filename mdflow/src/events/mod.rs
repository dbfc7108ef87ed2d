//! Lifecycle events emitted by the orchestrator.
//!
//! Events are delivered to an [`EventSink`] in the order they happen. The
//! orchestrator awaits each emission, so a sink observes a stage's terminal
//! event before the next stage begins.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names.
pub mod event_types {
    /// A run passed preflight and acquired the work directory lock.
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    /// Every stage succeeded or was skipped.
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    /// A stage failed and the run stopped.
    pub const PIPELINE_ABORTED: &str = "pipeline.aborted";
    /// A stage is about to be prepared.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage's outputs were already present.
    pub const STAGE_SKIPPED: &str = "stage.skipped";
    /// A stage ran and its outputs were verified.
    pub const STAGE_SUCCEEDED: &str = "stage.succeeded";
    /// A stage failed.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// An engine subprocess is about to be spawned.
    pub const ENGINE_INVOKED: &str = "engine.invoked";
    /// An engine subprocess finished and was classified.
    pub const ENGINE_COMPLETED: &str = "engine.completed";
}
