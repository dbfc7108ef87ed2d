//! Pipeline builder with validation.

use crate::errors::{ConfigurationError, ErrorInfo, MdflowError, Result};
use crate::stages::StageDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Directory name of a stage: `NN_<name>`.
#[must_use]
pub fn stage_dir_name(index: usize, name: &str) -> String {
    format!("{index:02}_{name}")
}

/// A validated, ordered list of stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    name: String,
    seed_inputs: Vec<String>,
    stages: Vec<StageDescriptor>,
}

impl Pipeline {
    /// The pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Files the first stage reads from the root work directory.
    #[must_use]
    pub fn seed_inputs(&self) -> &[String] {
        &self.seed_inputs
    }

    /// Stages in execution order.
    #[must_use]
    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false for a built pipeline.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Position of a stage by name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name() == name)
    }

    /// Directory name of the stage at `index`: `NN_<name>`.
    #[must_use]
    pub fn stage_dir_name(&self, index: usize) -> Option<String> {
        self.stages
            .get(index)
            .map(|s| stage_dir_name(index, s.name()))
    }

    /// The prefix of the pipeline ending with `last_stage`.
    pub fn truncated(&self, last_stage: &str) -> std::result::Result<Self, ConfigurationError> {
        let index = self.index_of(last_stage).ok_or_else(|| {
            ConfigurationError::new(format!(
                "Unknown stage '{last_stage}'; pipeline '{}' has: {}",
                self.name,
                self.stages.iter().map(StageDescriptor::name).collect::<Vec<_>>().join(", ")
            ))
            .with_stages(vec![last_stage.to_string()])
            .with_error_info(
                ErrorInfo::new("MDFLOW-001-UNKNOWN_STAGE", "Stage selection names no stage")
                    .with_fix_hint("Pick one of the pipeline's stage names."),
            )
        })?;
        Ok(Self {
            name: self.name.clone(),
            seed_inputs: self.seed_inputs.clone(),
            stages: self.stages[..=index].to_vec(),
        })
    }
}

/// On-disk form of a pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PipelineDefinition {
    name: String,
    #[serde(default)]
    seed_inputs: Vec<String>,
    stages: Vec<StageDescriptor>,
}

/// Builder for creating validated pipelines.
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    name: String,
    seed_inputs: Vec<String>,
    stages: Vec<StageDescriptor>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seed_inputs: Vec::new(),
            stages: Vec::new(),
        }
    }

    /// Declares files the caller places in the root work directory.
    #[must_use]
    pub fn seed_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seed_inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    /// Appends a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage is invalid on its own or its name is
    /// already taken.
    pub fn stage(
        mut self,
        descriptor: StageDescriptor,
    ) -> std::result::Result<Self, ConfigurationError> {
        descriptor.validate()?;
        if self.stages.iter().any(|s| s.name() == descriptor.name()) {
            return Err(ConfigurationError::new(format!(
                "Duplicate stage name '{}'",
                descriptor.name()
            ))
            .with_stages(vec![descriptor.name().to_string()])
            .with_error_info(
                ErrorInfo::new("MDFLOW-001-DUPLICATE", "Stage names must be unique")
                    .with_fix_hint("Rename one of the stages."),
            ));
        }
        self.stages.push(descriptor);
        Ok(self)
    }

    /// Appends several stages in order.
    pub fn stages<I>(self, descriptors: I) -> std::result::Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = StageDescriptor>,
    {
        descriptors.into_iter().try_fold(self, Self::stage)
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no stages, a required input is not
    /// produced by the immediately preceding stage (or seeded, for the first
    /// stage), or a template file does not exist.
    pub fn build(self) -> std::result::Result<Pipeline, ConfigurationError> {
        if self.stages.is_empty() {
            return Err(ConfigurationError::new("Pipeline has no stages").with_error_info(
                ErrorInfo::new("MDFLOW-001-EMPTY", "Cannot build an empty pipeline")
                    .with_fix_hint("Add at least one stage to the pipeline before building."),
            ));
        }

        self.check_hand_off()?;
        self.check_templates()?;

        Ok(Pipeline {
            name: self.name,
            seed_inputs: self.seed_inputs,
            stages: self.stages,
        })
    }

    fn check_hand_off(&self) -> std::result::Result<(), ConfigurationError> {
        for (index, stage) in self.stages.iter().enumerate() {
            let (available, source): (HashSet<&str>, String) = if index == 0 {
                (
                    self.seed_inputs.iter().map(String::as_str).collect(),
                    "the seed inputs".to_string(),
                )
            } else {
                let previous = &self.stages[index - 1];
                (
                    previous.produced_outputs().iter().map(String::as_str).collect(),
                    format!("stage '{}'", previous.name()),
                )
            };

            for input in stage.required_inputs() {
                if available.contains(input.as_str()) {
                    continue;
                }
                let later = self.stages[index + 1..]
                    .iter()
                    .find(|s| s.produced_outputs().contains(input));
                let detail = match later {
                    Some(producer) => {
                        format!(", it is produced only by later stage '{}'", producer.name())
                    }
                    None => String::new(),
                };
                return Err(ConfigurationError::new(format!(
                    "Stage '{}' requires '{input}', which is not provided by {source}{detail}",
                    stage.name()
                ))
                .with_stages(vec![stage.name().to_string()])
                .with_error_info(
                    ErrorInfo::new("MDFLOW-001-INPUT_ORDER", "Required input not produced upstream")
                        .with_fix_hint(
                            "Declare the file in the preceding stage's produced outputs, \
                             or reorder the stages.",
                        )
                        .with_context_entry("input", input.clone()),
                ));
            }
        }
        Ok(())
    }

    fn check_templates(&self) -> std::result::Result<(), ConfigurationError> {
        for stage in &self.stages {
            if !stage.config_template().is_file() {
                return Err(ConfigurationError::new(format!(
                    "Template for stage '{}' not found at {}",
                    stage.name(),
                    stage.config_template().display()
                ))
                .with_stages(vec![stage.name().to_string()])
                .with_error_info(
                    ErrorInfo::new("MDFLOW-001-TEMPLATE_MISSING", "Stage template does not exist")
                        .with_fix_hint(
                            "Provision the templates or point MDFLOW_TEMPLATE_DIR at them.",
                        ),
                ));
            }
        }
        Ok(())
    }

    /// Parses a TOML pipeline definition. Relative template paths are
    /// resolved against `base_dir`.
    pub fn from_toml_str(text: &str, base_dir: &Path) -> Result<Pipeline> {
        let definition: PipelineDefinition = toml::from_str(text).map_err(|e| {
            MdflowError::from(
                ConfigurationError::new(format!("invalid pipeline definition: {e}"))
                    .with_error_info(ErrorInfo::new(
                        "MDFLOW-001-DEFINITION",
                        "Pipeline definition could not be parsed",
                    )),
            )
        })?;

        let stages = definition.stages.into_iter().map(|mut stage| {
            stage.resolve_template(base_dir);
            stage
        });
        Ok(Self::new(definition.name)
            .seed_inputs(definition.seed_inputs)
            .stages(stages)?
            .build()?)
    }

    /// Loads a TOML pipeline definition from a file.
    pub fn from_file(path: &Path) -> Result<Pipeline> {
        let text = std::fs::read_to_string(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&text, base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::EngineInvocation;
    use std::fs;
    use std::path::PathBuf;

    fn templates() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c"] {
            fs::write(dir.path().join(format!("{name}.mdp")), "nsteps = 1\n").unwrap();
        }
        dir
    }

    fn stage(dir: &Path, name: &str, requires: &[&str], produces: &[&str]) -> StageDescriptor {
        StageDescriptor::new(name, dir.join(format!("{name}.mdp")))
            .requires(requires.iter().copied())
            .produces(produces.iter().copied())
            .call(EngineInvocation::new("mdrun").args(["-deffnm", name]))
    }

    #[test]
    fn test_builder_build_success() {
        let dir = templates();
        let pipeline = PipelineBuilder::new("md")
            .seed_inputs(["protein.pdb"])
            .stage(stage(dir.path(), "a", &["protein.pdb"], &["a.gro"]))
            .unwrap()
            .stage(stage(dir.path(), "b", &["a.gro"], &["b.gro"]))
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(pipeline.name(), "md");
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline.stage_dir_name(1), Some("01_b".to_string()));
        assert_eq!(pipeline.stage_dir_name(2), None);
    }

    #[test]
    fn test_builder_empty_build() {
        let err = PipelineBuilder::new("md").build().unwrap_err();
        assert!(err.message.contains("no stages"));
    }

    #[test]
    fn test_builder_duplicate_stage() {
        let dir = templates();
        let err = PipelineBuilder::new("md")
            .stage(stage(dir.path(), "a", &[], &["a.gro"]))
            .unwrap()
            .stage(stage(dir.path(), "a", &[], &["a.gro"]))
            .unwrap_err();
        assert_eq!(err.error_info.unwrap().code, "MDFLOW-001-DUPLICATE");
    }

    #[test]
    fn test_builder_rejects_input_from_later_stage() {
        let dir = templates();
        let err = PipelineBuilder::new("md")
            .stages([
                stage(dir.path(), "a", &[], &["a.gro"]),
                stage(dir.path(), "b", &["c.gro"], &["b.gro"]),
                stage(dir.path(), "c", &["b.gro"], &["c.gro"]),
            ])
            .unwrap()
            .build()
            .unwrap_err();

        assert!(err.message.contains("later stage 'c'"), "{}", err.message);
        assert_eq!(err.stages, vec!["b".to_string()]);
    }

    #[test]
    fn test_builder_rejects_non_adjacent_input() {
        let dir = templates();
        let err = PipelineBuilder::new("md")
            .stages([
                stage(dir.path(), "a", &[], &["a.gro"]),
                stage(dir.path(), "b", &["a.gro"], &["b.gro"]),
                stage(dir.path(), "c", &["a.gro"], &["c.gro"]),
            ])
            .unwrap()
            .build()
            .unwrap_err();
        assert!(err.message.contains("stage 'b'"));
    }

    #[test]
    fn test_builder_rejects_unseeded_first_input() {
        let dir = templates();
        let err = PipelineBuilder::new("md")
            .stage(stage(dir.path(), "a", &["protein.pdb"], &["a.gro"]))
            .unwrap()
            .build()
            .unwrap_err();
        assert!(err.message.contains("seed inputs"));
    }

    #[test]
    fn test_builder_rejects_missing_template() {
        let err = PipelineBuilder::new("md")
            .stage(stage(Path::new("/nonexistent"), "a", &[], &["a.gro"]))
            .unwrap()
            .build()
            .unwrap_err();
        assert_eq!(err.error_info.unwrap().code, "MDFLOW-001-TEMPLATE_MISSING");
    }

    #[test]
    fn test_truncated() {
        let dir = templates();
        let pipeline = PipelineBuilder::new("md")
            .stages([
                stage(dir.path(), "a", &[], &["a.gro"]),
                stage(dir.path(), "b", &["a.gro"], &["b.gro"]),
            ])
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(pipeline.truncated("a").unwrap().len(), 1);
        assert!(pipeline.truncated("z").unwrap_err().message.contains("Unknown stage"));
    }

    #[test]
    fn test_from_file_resolves_relative_templates() {
        let dir = templates();
        let path = dir.path().join("pipeline.toml");
        fs::write(
            &path,
            r#"
            name = "custom"
            seed_inputs = ["protein.pdb"]

            [[stages]]
            name = "a"
            template = "a.mdp"
            required_inputs = ["protein.pdb"]
            produced_outputs = ["a.gro"]

            [[stages.calls]]
            subcommand = "mdrun"
            args = ["-deffnm", "a"]
            "#,
        )
        .unwrap();

        let pipeline = PipelineBuilder::from_file(&path).unwrap();
        assert_eq!(pipeline.name(), "custom");
        assert_eq!(pipeline.stages()[0].config_template(), dir.path().join("a.mdp"));
        assert_eq!(pipeline.seed_inputs(), ["protein.pdb".to_string()]);
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        let err = PipelineBuilder::from_toml_str("stages = 3", &PathBuf::from("/")).unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }

    #[test]
    fn test_from_toml_rejects_stage_name_outside_root() {
        let text = r#"
            name = "md"
            seed_inputs = ["protein.pdb"]

            [[stages]]
            name = "x/../../escape"
            template = "min.mdp"
            required_inputs = ["protein.pdb"]

            [[stages.calls]]
            subcommand = "mdrun"
        "#;
        let err = PipelineBuilder::from_toml_str(text, &PathBuf::from("/")).unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
        assert!(err.to_string().contains("x/../../escape"));
    }
}
