//! Configuration: layered settings and template parameter overrides.

mod overrides;
mod settings;

pub use overrides::{AppliedOverrides, ParameterOverrides};
pub use settings::{SimulationSettings, CONFIG_ENV};
