//! Cooperative cancellation of pipeline runs.
//!
//! A [`CancellationToken`] is shared between the caller and a run. Cancelling
//! it kills the in-flight engine call and keeps later stages from starting.

mod token;

pub use token::{CancelCallback, CancellationToken};
