//! Observability utilities: span attributes, timers and subscriber setup.

mod logging;
mod tracing;

pub use self::logging::{init_tracing, LogFormat, DEFAULT_FILTER};
pub use self::tracing::{RunSpanAttributes, SpanTimer, StageSpanAttributes};
