//! Layered simulation settings.
//!
//! Resolution order, later layers winning:
//! 1. built-in defaults
//! 2. a TOML file (`MDFLOW_CONFIG`, or an explicit path)
//! 3. `MDFLOW_*` environment variables

use super::ParameterOverrides;
use crate::errors::{ConfigurationError, ErrorInfo, MdflowError, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable naming a TOML settings file.
pub const CONFIG_ENV: &str = "MDFLOW_CONFIG";

fn default_engine() -> PathBuf {
    PathBuf::from("gmx")
}

fn default_cache_dir() -> PathBuf {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".mdflow"))
        .unwrap_or_else(|| PathBuf::from(".mdflow"))
}

fn default_force_field() -> String {
    "15".to_string()
}

fn default_water_model() -> String {
    "spce".to_string()
}

fn default_solvent_group() -> String {
    "13".to_string()
}

fn default_box_distance() -> f64 {
    1.0
}

fn default_box_type() -> String {
    "cubic".to_string()
}

fn default_excerpt_lines() -> usize {
    40
}

fn default_max_warnings() -> u32 {
    1
}

/// Settings for the standard simulation pipeline and its engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSettings {
    /// Engine binary name or path.
    #[serde(default = "default_engine")]
    pub engine: PathBuf,
    /// Root of the local resource cache.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Directory holding the stage templates. Defaults under `cache_dir`.
    #[serde(default)]
    pub template_dir: Option<PathBuf>,
    /// Parent directory of default run directories. Defaults under `cache_dir`.
    #[serde(default)]
    pub simulations_dir: Option<PathBuf>,
    /// Force-field index answered to `pdb2gmx`'s prompt.
    #[serde(default = "default_force_field")]
    pub force_field: String,
    /// Water model passed to `pdb2gmx`.
    #[serde(default = "default_water_model")]
    pub water_model: String,
    /// Group index answered to `genion`'s prompt (the solvent group).
    #[serde(default = "default_solvent_group")]
    pub solvent_group: String,
    /// Minimum distance between the solute and the box edge, in nm.
    #[serde(default = "default_box_distance")]
    pub box_distance_nm: f64,
    /// Box shape passed to `editconf`.
    #[serde(default = "default_box_type")]
    pub box_type: String,
    /// `-maxwarn` passed to `grompp`.
    #[serde(default = "default_max_warnings")]
    pub grompp_max_warnings: u32,
    /// Timeout per engine call, in seconds. Unset means no timeout.
    #[serde(default)]
    pub stage_timeout_secs: Option<u64>,
    /// Lines of engine output kept on a failed stage result.
    #[serde(default = "default_excerpt_lines")]
    pub log_excerpt_lines: usize,
    /// Template overrides keyed by stage name.
    #[serde(default)]
    pub overrides: BTreeMap<String, ParameterOverrides>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            cache_dir: default_cache_dir(),
            template_dir: None,
            simulations_dir: None,
            force_field: default_force_field(),
            water_model: default_water_model(),
            solvent_group: default_solvent_group(),
            box_distance_nm: default_box_distance(),
            box_type: default_box_type(),
            grompp_max_warnings: default_max_warnings(),
            stage_timeout_secs: None,
            log_excerpt_lines: default_excerpt_lines(),
            overrides: BTreeMap::new(),
        }
    }
}

impl SimulationSettings {
    /// Loads settings from defaults, `MDFLOW_CONFIG` and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Reads settings from a TOML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text).map_err(|e| match e {
            MdflowError::Configuration(inner) => MdflowError::Configuration(ConfigurationError {
                message: format!("{}: {}", path.display(), inner.message),
                ..inner
            }),
            other => other,
        })
    }

    /// Parses settings from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| {
            ConfigurationError::new(format!("invalid settings: {e}"))
                .with_error_info(ErrorInfo::new(
                    "MDFLOW-001-SETTINGS",
                    "Settings file could not be parsed",
                ))
                .into()
        })
    }

    /// Applies `MDFLOW_*` overrides from an environment lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(engine) = lookup("MDFLOW_ENGINE") {
            self.engine = PathBuf::from(engine);
        }
        if let Some(dir) = lookup("MDFLOW_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("MDFLOW_TEMPLATE_DIR") {
            self.template_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup("MDFLOW_SIMULATIONS_DIR") {
            self.simulations_dir = Some(PathBuf::from(dir));
        }
        if let Some(ff) = lookup("MDFLOW_FORCE_FIELD") {
            self.force_field = ff;
        }
        if let Some(secs) = lookup("MDFLOW_STAGE_TIMEOUT_SECS") {
            let parsed = secs.trim().parse::<u64>().map_err(|_| {
                MdflowError::configuration(format!(
                    "MDFLOW_STAGE_TIMEOUT_SECS must be a whole number of seconds, got '{secs}'"
                ))
            })?;
            self.stage_timeout_secs = Some(parsed);
        }
        debug!(
            engine = %self.engine.display(),
            cache = %self.cache_dir.display(),
            "Resolved settings"
        );
        Ok(())
    }

    /// Directory holding the stage templates.
    #[must_use]
    pub fn template_dir(&self) -> PathBuf {
        self.template_dir
            .clone()
            .unwrap_or_else(|| self.cache_dir.join("molecular_dynamics").join("mdp_files"))
    }

    /// Parent directory of default run directories.
    #[must_use]
    pub fn simulations_dir(&self) -> PathBuf {
        self.simulations_dir
            .clone()
            .unwrap_or_else(|| self.cache_dir.join("molecular_dynamics").join("simulations"))
    }

    /// Template path for a stage (`<template_dir>/<stage>.mdp`).
    #[must_use]
    pub fn template_for(&self, stage: &str) -> PathBuf {
        self.template_dir().join(format!("{stage}.mdp"))
    }

    /// Per-call timeout.
    #[must_use]
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }

    /// Overrides configured for a stage.
    #[must_use]
    pub fn overrides_for(&self, stage: &str) -> ParameterOverrides {
        self.overrides.get(stage).cloned().unwrap_or_default()
    }
}
