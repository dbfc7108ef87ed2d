//! On-disk fixtures for the standard pipeline.

use std::io;
use std::path::{Path, PathBuf};

use crate::config::SimulationSettings;
use crate::errors::Result;
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::stages::{standard_stages, SEED_STRUCTURE, STANDARD_STAGES};

/// Minimal PDB used as the seed structure.
pub const SAMPLE_PDB: &str = "\
ATOM      1  N   ALA A   1      11.104   6.134  -6.504  1.00  0.00           N
ATOM      2  CA  ALA A   1      11.639   6.071  -5.147  1.00  0.00           C
ATOM      3  C   ALA A   1      13.159   5.972  -5.148  1.00  0.00           C
ATOM      4  O   ALA A   1      13.740   5.668  -6.186  1.00  0.00           O
END
";

/// Template contents per standard stage.
fn template_text(stage: &str) -> String {
    let (integrator, nsteps) = match stage {
        "minimization" => ("steep", 50_000),
        _ => ("md", 50_000),
    };
    format!(
        "; {stage} parameters\n\
         integrator  = {integrator}\n\
         nsteps      = {nsteps}\n\
         dt          = 0.002\n\
         ref_t       = 300 300\n\
         cutoff-scheme = Verlet\n"
    )
}

/// A template directory and a seeded root work directory under `base`.
#[derive(Debug, Clone)]
pub struct StandardFixture {
    base: PathBuf,
    settings: SimulationSettings,
}

impl StandardFixture {
    /// Writes the standard templates and seed structure under `base`.
    pub fn create(base: &Path) -> io::Result<Self> {
        let template_dir = base.join("mdp_files");
        std::fs::create_dir_all(&template_dir)?;
        for stage in STANDARD_STAGES {
            std::fs::write(template_dir.join(format!("{stage}.mdp")), template_text(stage))?;
        }

        let fixture = Self {
            base: base.to_path_buf(),
            settings: SimulationSettings {
                engine: PathBuf::from("gmx"),
                cache_dir: base.join("cache"),
                template_dir: Some(template_dir),
                simulations_dir: Some(base.join("simulations")),
                ..SimulationSettings::default()
            },
        };
        fixture.seed()?;
        Ok(fixture)
    }

    /// Rewrites the seed structure into the root work directory.
    pub fn seed(&self) -> io::Result<PathBuf> {
        let root = self.root();
        std::fs::create_dir_all(&root)?;
        let path = root.join(SEED_STRUCTURE);
        std::fs::write(&path, SAMPLE_PDB)?;
        Ok(path)
    }

    /// Settings pointing at the fixture's templates.
    #[must_use]
    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    /// Mutable settings, for tests that tweak overrides or timeouts.
    pub fn settings_mut(&mut self) -> &mut SimulationSettings {
        &mut self.settings
    }

    /// The root work directory.
    #[must_use]
    pub fn root(&self) -> PathBuf {
        self.base.join("run")
    }

    /// Directory of the standard stage at `index`.
    #[must_use]
    pub fn stage_dir(&self, index: usize) -> PathBuf {
        let name = STANDARD_STAGES.get(index).copied().unwrap_or("unknown");
        self.root().join(crate::pipeline::stage_dir_name(index, name))
    }

    /// Builds the standard pipeline over the fixture's templates.
    pub fn pipeline(&self) -> Result<Pipeline> {
        Ok(PipelineBuilder::new("md")
            .seed_inputs([SEED_STRUCTURE])
            .stages(standard_stages(&self.settings))?
            .build()?)
    }
}
