//! The standard GROMACS preparation and equilibration pipeline.
//!
//! `minimization` builds the solvated, neutralised system from the seed
//! structure and minimises it; `nvt` and `npt` equilibrate it with position
//! restraints. Each stage reads one template, `<stage>.mdp`, from the
//! template directory.

use super::{EngineInvocation, StageDescriptor};
use crate::config::SimulationSettings;

/// File name of the seed structure in the root work directory.
pub const SEED_STRUCTURE: &str = "protein.pdb";

/// Stage names in pipeline order.
pub const STANDARD_STAGES: [&str; 3] = ["minimization", "nvt", "npt"];

/// Pattern reclassifying an engine call that printed a fatal error.
const FATAL_ERROR_PATTERN: &str = r"^Fatal error:";

fn grompp(settings: &SimulationSettings) -> EngineInvocation {
    let call = EngineInvocation::new("grompp")
        .args(["-f", "{template}"])
        .failure_pattern(FATAL_ERROR_PATTERN);
    match settings.grompp_max_warnings {
        0 => call,
        max => call.args(["-maxwarn".to_string(), max.to_string()]),
    }
}

fn mdrun(name: &str, settings: &SimulationSettings) -> EngineInvocation {
    let call = EngineInvocation::new("mdrun")
        .args(["-v", "-deffnm", name])
        .expects([format!("{name}.gro")])
        .failure_pattern(FATAL_ERROR_PATTERN);
    match settings.stage_timeout() {
        Some(timeout) => call.timeout(timeout),
        None => call,
    }
}

/// Builds the system and minimises its energy.
#[must_use]
pub fn minimization_stage(settings: &SimulationSettings) -> StageDescriptor {
    StageDescriptor::new("minimization", settings.template_for("minimization"))
        .requires([SEED_STRUCTURE])
        .produces(["minimization.gro", "topol.top", "posre.itp"])
        .call(
            EngineInvocation::new("pdb2gmx")
                .args([
                    "-f",
                    SEED_STRUCTURE,
                    "-o",
                    "processed.gro",
                    "-p",
                    "topol.top",
                    "-i",
                    "posre.itp",
                ])
                .args(["-water", settings.water_model.as_str(), "-ignh"])
                .stdin(format!("{}\n", settings.force_field))
                .expects(["processed.gro", "topol.top", "posre.itp"]),
        )
        .call(
            EngineInvocation::new("editconf")
                .args(["-f", "processed.gro", "-o", "newbox.gro", "-c"])
                .args(["-d".to_string(), settings.box_distance_nm.to_string()])
                .args(["-bt", settings.box_type.as_str()])
                .expects(["newbox.gro"]),
        )
        .call(
            EngineInvocation::new("solvate")
                .args([
                    "-cp",
                    "newbox.gro",
                    "-cs",
                    "spc216.gro",
                    "-o",
                    "solv.gro",
                    "-p",
                    "topol.top",
                ])
                .expects(["solv.gro"]),
        )
        .call(
            grompp(settings)
                .args(["-c", "solv.gro", "-p", "topol.top", "-o", "ions.tpr"])
                .expects(["ions.tpr"]),
        )
        .call(
            EngineInvocation::new("genion")
                .args(["-s", "ions.tpr", "-o", "solv_ions.gro", "-p", "topol.top"])
                .args(["-pname", "NA", "-nname", "CL", "-neutral"])
                .stdin(format!("{}\n", settings.solvent_group))
                .expects(["solv_ions.gro"]),
        )
        .call(
            grompp(settings)
                .args(["-c", "solv_ions.gro", "-p", "topol.top", "-o", "minimization.tpr"])
                .expects(["minimization.tpr"]),
        )
        .call(mdrun("minimization", settings))
        .with_overrides(settings.overrides_for("minimization"))
}

/// Equilibrates at constant volume and temperature.
#[must_use]
pub fn nvt_stage(settings: &SimulationSettings) -> StageDescriptor {
    StageDescriptor::new("nvt", settings.template_for("nvt"))
        .requires(["minimization.gro", "topol.top", "posre.itp"])
        .produces(["nvt.gro", "nvt.cpt", "topol.top", "posre.itp"])
        .carry_over(["*.itp"])
        .call(
            grompp(settings)
                .args([
                    "-c",
                    "minimization.gro",
                    "-r",
                    "minimization.gro",
                    "-p",
                    "topol.top",
                    "-o",
                    "nvt.tpr",
                ])
                .expects(["nvt.tpr"]),
        )
        .call(mdrun("nvt", settings).expects(["nvt.cpt"]))
        .with_overrides(settings.overrides_for("nvt"))
}

/// Equilibrates at constant pressure, continuing from the NVT checkpoint.
#[must_use]
pub fn npt_stage(settings: &SimulationSettings) -> StageDescriptor {
    StageDescriptor::new("npt", settings.template_for("npt"))
        .requires(["nvt.gro", "nvt.cpt", "topol.top", "posre.itp"])
        .produces(["npt.gro", "npt.cpt"])
        .carry_over(["*.itp"])
        .call(
            grompp(settings)
                .args([
                    "-c", "nvt.gro", "-r", "nvt.gro", "-t", "nvt.cpt", "-p", "topol.top", "-o",
                    "npt.tpr",
                ])
                .expects(["npt.tpr"]),
        )
        .call(mdrun("npt", settings).expects(["npt.cpt"]))
        .with_overrides(settings.overrides_for("npt"))
}

/// All standard stages, in order.
#[must_use]
pub fn standard_stages(settings: &SimulationSettings) -> Vec<StageDescriptor> {
    vec![
        minimization_stage(settings),
        nvt_stage(settings),
        npt_stage(settings),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::time::Duration;

    fn settings() -> SimulationSettings {
        SimulationSettings {
            template_dir: Some(PathBuf::from("/templates")),
            ..SimulationSettings::default()
        }
    }

    #[test]
    fn test_stage_chain_hands_off_files() {
        let stages = standard_stages(&settings());
        let names: Vec<_> = stages.iter().map(StageDescriptor::name).collect();
        assert_eq!(names, STANDARD_STAGES);

        for pair in stages.windows(2) {
            for input in pair[1].required_inputs() {
                assert!(
                    pair[0].produced_outputs().contains(input),
                    "{} requires {input} which {} does not produce",
                    pair[1].name(),
                    pair[0].name()
                );
            }
        }
    }

    #[test]
    fn test_minimization_answers_prompts() {
        let stage = minimization_stage(&settings());
        let calls = stage.engine_calls();
        let subcommands: Vec<_> = calls.iter().map(|c| c.subcommand.as_str()).collect();
        assert_eq!(
            subcommands,
            vec!["pdb2gmx", "editconf", "solvate", "grompp", "genion", "grompp", "mdrun"]
        );
        assert_eq!(calls[0].stdin_script.as_deref(), Some("15\n"));
        assert_eq!(calls[4].stdin_script.as_deref(), Some("13\n"));
        assert!(calls[3].args.ends_with(&["-o".to_string(), "ions.tpr".to_string()]));
        assert!(calls[3].args.contains(&"-maxwarn".to_string()));
        assert_eq!(stage.config_template(), PathBuf::from("/templates/minimization.mdp"));
    }

    #[test]
    fn test_settings_flow_into_stages() {
        let mut settings = settings();
        settings.force_field = "6".to_string();
        settings.grompp_max_warnings = 0;
        settings.stage_timeout_secs = Some(600);

        let stage = minimization_stage(&settings);
        assert_eq!(stage.engine_calls()[0].stdin_script.as_deref(), Some("6\n"));
        assert!(!stage.engine_calls()[3].args.contains(&"-maxwarn".to_string()));
        assert_eq!(
            stage.engine_calls()[6].timeout_duration(),
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn test_standard_stages_validate() {
        for stage in standard_stages(&settings()) {
            stage.validate().unwrap();
        }
    }
}
