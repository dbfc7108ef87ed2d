//! Static stage definitions.

use crate::config::ParameterOverrides;
use crate::errors::{ConfigurationError, ErrorInfo};
use crate::utils::glob_to_regex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder replaced by the absolute path of the stage's template copy.
pub const TEMPLATE_PLACEHOLDER: &str = "{template}";
/// Placeholder replaced by the stage name.
pub const STAGE_PLACEHOLDER: &str = "{stage}";
/// Placeholder replaced by the absolute stage directory.
pub const WORKDIR_PLACEHOLDER: &str = "{workdir}";

/// One call to the engine within a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInvocation {
    /// Engine subcommand, e.g. `grompp`.
    pub subcommand: String,
    /// Arguments; may contain `{template}`, `{stage}` and `{workdir}`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Text piped to stdin, answering interactive prompts by position.
    #[serde(default, rename = "stdin", skip_serializing_if = "Option::is_none")]
    pub stdin_script: Option<String>,
    /// Files that must exist and be non-empty after a zero exit.
    #[serde(default)]
    pub expected_outputs: Vec<String>,
    /// Per-call timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Regexes that mark the call failed when found in its output.
    #[serde(default)]
    pub failure_patterns: Vec<String>,
}

impl EngineInvocation {
    /// Creates an invocation of `subcommand` with no arguments.
    #[must_use]
    pub fn new(subcommand: impl Into<String>) -> Self {
        Self {
            subcommand: subcommand.into(),
            args: Vec::new(),
            stdin_script: None,
            expected_outputs: Vec::new(),
            timeout_ms: None,
            failure_patterns: Vec::new(),
        }
    }

    /// Appends arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the stdin script.
    #[must_use]
    pub fn stdin(mut self, script: impl Into<String>) -> Self {
        self.stdin_script = Some(script.into());
        self
    }

    /// Declares files the call must produce.
    #[must_use]
    pub fn expects<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_outputs.extend(outputs.into_iter().map(Into::into));
        self
    }

    /// Sets the per-call timeout, rounded up to whole milliseconds.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        let mut millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        if Duration::from_millis(millis) < timeout {
            millis = millis.saturating_add(1);
        }
        self.timeout_ms = Some(millis);
        self
    }

    /// Adds a failure pattern.
    #[must_use]
    pub fn failure_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.failure_patterns.push(pattern.into());
        self
    }

    /// The per-call timeout, if set.
    #[must_use]
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Compiles the failure patterns.
    pub fn compiled_patterns(&self) -> Result<Vec<Regex>, regex::Error> {
        self.failure_patterns.iter().map(|p| Regex::new(p)).collect()
    }
}

/// Static definition of one pipeline stage.
///
/// Built once, then only read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    name: String,
    #[serde(default)]
    required_inputs: Vec<String>,
    #[serde(default)]
    produced_outputs: Vec<String>,
    #[serde(rename = "template")]
    config_template: PathBuf,
    #[serde(default)]
    carry_over: Vec<String>,
    #[serde(rename = "calls")]
    engine_calls: Vec<EngineInvocation>,
    #[serde(default, skip_serializing_if = "ParameterOverrides::is_empty")]
    overrides: ParameterOverrides,
}

impl StageDescriptor {
    /// Creates a stage with a template and nothing else.
    #[must_use]
    pub fn new(name: impl Into<String>, config_template: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            required_inputs: Vec::new(),
            produced_outputs: Vec::new(),
            config_template: config_template.into(),
            carry_over: Vec::new(),
            engine_calls: Vec::new(),
            overrides: ParameterOverrides::default(),
        }
    }

    /// Declares inputs expected in the previous stage's directory.
    #[must_use]
    pub fn requires<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    /// Declares outputs that must exist and be non-empty on success.
    #[must_use]
    pub fn produces<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.produced_outputs.extend(outputs.into_iter().map(Into::into));
        self
    }

    /// Adds glob patterns copied from the previous directory when present.
    #[must_use]
    pub fn carry_over<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.carry_over.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Appends an engine call.
    #[must_use]
    pub fn call(mut self, invocation: EngineInvocation) -> Self {
        self.engine_calls.push(invocation);
        self
    }

    /// Sets template overrides.
    #[must_use]
    pub fn with_overrides(mut self, overrides: ParameterOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub(crate) fn resolve_template(&mut self, base: &Path) {
        if self.config_template.is_relative() {
            self.config_template = base.join(&self.config_template);
        }
    }

    /// Stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inputs expected upstream.
    #[must_use]
    pub fn required_inputs(&self) -> &[String] {
        &self.required_inputs
    }

    /// Outputs verified on success.
    #[must_use]
    pub fn produced_outputs(&self) -> &[String] {
        &self.produced_outputs
    }

    /// Source template path.
    #[must_use]
    pub fn config_template(&self) -> &Path {
        &self.config_template
    }

    /// Carry-over glob patterns.
    #[must_use]
    pub fn carry_over_patterns(&self) -> &[String] {
        &self.carry_over
    }

    /// Engine calls, in order.
    #[must_use]
    pub fn engine_calls(&self) -> &[EngineInvocation] {
        &self.engine_calls
    }

    /// Template overrides.
    #[must_use]
    pub fn overrides(&self) -> &ParameterOverrides {
        &self.overrides
    }

    /// File name of the template copy inside the stage directory.
    #[must_use]
    pub fn template_file_name(&self) -> Option<&str> {
        self.config_template.file_name().and_then(|n| n.to_str())
    }

    /// Checks the stage on its own, without looking at its neighbours or
    /// the filesystem.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let fail = |message: String, code: &str, hint: &str| {
            ConfigurationError::new(message)
                .with_stages(vec![self.name.clone()])
                .with_error_info(
                    ErrorInfo::new(code, "Invalid stage definition").with_fix_hint(hint),
                )
        };

        if self.name.trim().is_empty() {
            return Err(fail(
                "Stage name cannot be empty".to_string(),
                "MDFLOW-001-NAME",
                "Give every stage a unique, non-empty name.",
            ));
        }
        if self.name.contains(['/', '\\', '\0']) || matches!(self.name.as_str(), "." | "..") {
            return Err(fail(
                format!("Stage name '{}' is not a plain directory name", self.name),
                "MDFLOW-001-NAME_PATH",
                "Stage names become directory names; use letters, digits, '-' or '_'.",
            ));
        }
        if self.engine_calls.is_empty() {
            return Err(fail(
                format!("Stage '{}' has no engine calls", self.name),
                "MDFLOW-001-NO_CALLS",
                "Add at least one engine invocation to the stage.",
            ));
        }
        if self.template_file_name().is_none() {
            return Err(fail(
                format!(
                    "Stage '{}' template path {} has no file name",
                    self.name,
                    self.config_template.display()
                ),
                "MDFLOW-001-TEMPLATE",
                "Point the template at a file, not a directory.",
            ));
        }
        for call in &self.engine_calls {
            if call.subcommand.trim().is_empty() {
                return Err(fail(
                    format!("Stage '{}' has an engine call without a subcommand", self.name),
                    "MDFLOW-001-SUBCOMMAND",
                    "Set the engine subcommand, e.g. `grompp` or `mdrun`.",
                ));
            }
            if call.timeout_ms == Some(0) {
                return Err(fail(
                    format!(
                        "Stage '{}' call '{}' has a zero timeout",
                        self.name, call.subcommand
                    ),
                    "MDFLOW-001-TIMEOUT",
                    "Use a positive timeout, or leave it unset for no limit.",
                ));
            }
            if let Err(e) = call.compiled_patterns() {
                return Err(fail(
                    format!(
                        "Stage '{}' call '{}' has an invalid failure pattern: {e}",
                        self.name, call.subcommand
                    ),
                    "MDFLOW-001-PATTERN",
                    "Failure patterns are regular expressions; escape literal metacharacters.",
                ));
            }
        }
        for pattern in &self.carry_over {
            if pattern.contains('/') || glob_to_regex(pattern).is_err() {
                return Err(fail(
                    format!("Stage '{}' has an invalid carry-over pattern '{pattern}'", self.name),
                    "MDFLOW-001-CARRY_OVER",
                    "Carry-over patterns match file names only, e.g. `*.itp`.",
                ));
            }
        }
        Ok(())
    }
}

/// Values substituted into engine arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholders {
    /// Absolute path of the stage's template copy.
    pub template: PathBuf,
    /// Stage name.
    pub stage: String,
    /// Absolute stage directory.
    pub workdir: PathBuf,
}

impl Placeholders {
    /// Placeholders for a stage running in `workdir`.
    #[must_use]
    pub fn for_stage(descriptor: &StageDescriptor, workdir: &Path) -> Self {
        let template = match descriptor.template_file_name() {
            Some(name) => workdir.join(name),
            None => workdir.to_path_buf(),
        };
        Self {
            template,
            stage: descriptor.name().to_string(),
            workdir: workdir.to_path_buf(),
        }
    }

    /// Substitutes every placeholder in `arg`.
    #[must_use]
    pub fn resolve(&self, arg: &str) -> String {
        arg.replace(TEMPLATE_PLACEHOLDER, &self.template.display().to_string())
            .replace(STAGE_PLACEHOLDER, &self.stage)
            .replace(WORKDIR_PLACEHOLDER, &self.workdir.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn nvt() -> StageDescriptor {
        StageDescriptor::new("nvt", "/templates/nvt.mdp")
            .requires(["minimization.gro", "topol.top"])
            .produces(["nvt.gro"])
            .carry_over(["*.itp"])
            .call(EngineInvocation::new("grompp").args(["-f", "{template}", "-o", "{stage}.tpr"]))
            .call(EngineInvocation::new("mdrun").args(["-deffnm", "{stage}"]).expects(["nvt.gro"]))
    }

    #[test]
    fn test_descriptor_accessors() {
        let stage = nvt();
        assert_eq!(stage.name(), "nvt");
        assert_eq!(stage.required_inputs(), ["minimization.gro", "topol.top"]);
        assert_eq!(stage.engine_calls().len(), 2);
        assert_eq!(stage.template_file_name(), Some("nvt.mdp"));
        assert!(stage.validate().is_ok());
    }

    #[test]
    fn test_placeholders_resolve_absolute() {
        let stage = nvt();
        let ph = Placeholders::for_stage(&stage, Path::new("/runs/a/01_nvt"));

        let args: Vec<String> = stage.engine_calls()[0]
            .args
            .iter()
            .map(|a| ph.resolve(a))
            .collect();
        assert_eq!(args, vec!["-f", "/runs/a/01_nvt/nvt.mdp", "-o", "nvt.tpr"]);
        assert_eq!(ph.resolve("{workdir}/x"), "/runs/a/01_nvt/x");
    }

    #[test]
    fn test_validate_rejects_empty_name_and_calls() {
        let err = StageDescriptor::new(" ", "a.mdp")
            .call(EngineInvocation::new("mdrun"))
            .validate()
            .unwrap_err();
        assert!(err.message.contains("empty"));

        let err = StageDescriptor::new("npt", "npt.mdp").validate().unwrap_err();
        assert_eq!(err.error_info.unwrap().code, "MDFLOW-001-NO_CALLS");
    }

    #[test]
    fn test_validate_rejects_bad_patterns() {
        let err = StageDescriptor::new("nvt", "nvt.mdp")
            .call(EngineInvocation::new("mdrun").failure_pattern("(unclosed"))
            .validate()
            .unwrap_err();
        assert!(err.message.contains("failure pattern"));

        let err = StageDescriptor::new("nvt", "nvt.mdp")
            .carry_over(["../*.itp"])
            .call(EngineInvocation::new("mdrun"))
            .validate()
            .unwrap_err();
        assert!(err.message.contains("carry-over"));
    }

    #[test]
    fn test_path_like_names_rejected() {
        for name in ["x/../../escape", "..", ".", "a\\b"] {
            let err = StageDescriptor::new(name, "nvt.mdp")
                .call(EngineInvocation::new("mdrun"))
                .validate()
                .unwrap_err();
            assert_eq!(err.error_info.unwrap().code, "MDFLOW-001-NAME_PATH", "{name}");
        }
    }

    #[test]
    fn test_sub_second_timeout_is_kept() {
        let call = EngineInvocation::new("mdrun").timeout(Duration::from_millis(500));
        assert_eq!(call.timeout_duration(), Some(Duration::from_millis(500)));

        let tiny = EngineInvocation::new("mdrun").timeout(Duration::from_micros(10));
        assert_eq!(tiny.timeout_duration(), Some(Duration::from_millis(1)));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = StageDescriptor::new("nvt", "nvt.mdp")
            .call(EngineInvocation::new("mdrun").timeout(Duration::ZERO))
            .validate()
            .unwrap_err();
        assert_eq!(err.error_info.unwrap().code, "MDFLOW-001-TIMEOUT");
    }

    #[test]
    fn test_deserialize_from_toml() {
        let stage: StageDescriptor = toml::from_str(
            r#"
            name = "npt"
            template = "npt.mdp"
            required_inputs = ["nvt.gro", "nvt.cpt"]
            produced_outputs = ["npt.gro"]

            [[calls]]
            subcommand = "grompp"
            args = ["-f", "{template}", "-t", "nvt.cpt"]
            timeout_ms = 60000

            [[calls]]
            subcommand = "mdrun"
            args = ["-deffnm", "npt"]
            failure_patterns = ["Fatal error"]
            "#,
        )
        .unwrap();

        assert_eq!(stage.engine_calls()[0].timeout_duration(), Some(Duration::from_secs(60)));
        assert_eq!(stage.engine_calls()[1].failure_patterns, vec!["Fatal error"]);
        assert!(stage.carry_over_patterns().is_empty());
    }
}
