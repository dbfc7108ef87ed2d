//! End-to-end tests of the standard pipeline over a scripted engine.

use crate::cancellation::CancellationToken;
use crate::config::ParameterOverrides;
use crate::core::{FailureReason, PipelineRun, RunStatus, StageStatus, RUN_REPORT_FILE};
use crate::engine::MockEngine;
use crate::errors::{MdflowError, Prerequisite};
use crate::events::{event_types, CollectingEventSink, EventSink};
use crate::pipeline::{Orchestrator, RunLock, SeedFile};
use crate::stages::{SEED_STRUCTURE, STANDARD_STAGES};
use crate::testing::{
    assert_outputs_present, assert_run_status, assert_stage_failed_with, assert_stage_skipped,
    assert_stage_succeeded, ScriptedEngine, StandardFixture, StubBehavior, SAMPLE_PDB,
};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn fixture() -> (tempfile::TempDir, StandardFixture) {
    let dir = tempfile::tempdir().unwrap();
    let fixture = StandardFixture::create(dir.path()).unwrap();
    (dir, fixture)
}

async fn run_with(
    fixture: &StandardFixture,
    engine: Arc<ScriptedEngine>,
    force: bool,
) -> PipelineRun {
    let pipeline = fixture.pipeline().unwrap();
    Orchestrator::new(engine)
        .run(&pipeline, &fixture.root(), force, &CancellationToken::new())
        .await
        .unwrap()
}

fn stage_dirs(fixture: &StandardFixture) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(fixture.root())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(ToString::to_string))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_end_to_end_leaves_three_stage_directories() {
    let (_dir, fx) = fixture();
    let engine = Arc::new(ScriptedEngine::new());

    let run = run_with(&fx, engine.clone(), false).await;

    assert_run_status(&run, RunStatus::Completed);
    assert_eq!(stage_dirs(&fx), vec!["00_minimization", "01_nvt", "02_npt"]);
    assert_outputs_present(&run.stages[0], &["minimization.gro", "topol.top", "posre.itp"]);
    assert_outputs_present(&run.stages[1], &["nvt.gro", "nvt.cpt", "topol.top", "posre.itp"]);
    assert_outputs_present(&run.stages[2], &["npt.gro", "npt.cpt"]);
    for result in &run.stages {
        assert_stage_succeeded(result);
    }
    assert_eq!(engine.call_count(), 11);
    assert_eq!(run.last_output_dir(), Some(fx.stage_dir(2).as_path()));
}

#[tokio::test]
async fn test_stages_never_interleave() {
    let (_dir, fx) = fixture();
    let engine = Arc::new(ScriptedEngine::new());
    run_with(&fx, engine.clone(), false).await;

    let order: Vec<usize> = engine
        .recorded()
        .iter()
        .map(|c| STANDARD_STAGES.iter().position(|s| *s == c.stage).unwrap())
        .collect();
    assert!(order.windows(2).all(|w| w[0] <= w[1]), "calls interleaved: {order:?}");
    assert_eq!(order.first(), Some(&0));
    assert_eq!(order.last(), Some(&2));
}

#[tokio::test]
async fn test_calls_run_in_their_stage_directory() {
    let (_dir, fx) = fixture();
    let engine = Arc::new(ScriptedEngine::new());
    run_with(&fx, engine.clone(), false).await;

    for call in engine.recorded() {
        let index = STANDARD_STAGES.iter().position(|s| *s == call.stage).unwrap();
        assert_eq!(call.work_dir, fx.stage_dir(index));
        if call.subcommand == "grompp" {
            let template = fx.stage_dir(index).join(format!("{}.mdp", call.stage));
            assert!(call.args.contains(&template.display().to_string()));
        }
    }
    let pdb2gmx = &engine.recorded()[0];
    assert_eq!(pdb2gmx.stdin.as_deref(), Some("15\n"));
}

#[tokio::test]
async fn test_second_run_skips_everything() {
    let (_dir, fx) = fixture();
    run_with(&fx, Arc::new(ScriptedEngine::new()), false).await;

    let mut engine = MockEngine::new();
    engine.expect_locate().returning(|| Some(PathBuf::from("/usr/bin/gmx")));
    engine.expect_execute().never();

    let pipeline = fx.pipeline().unwrap();
    let run = Orchestrator::new(Arc::new(engine))
        .run(&pipeline, &fx.root(), false, &CancellationToken::new())
        .await
        .unwrap();

    assert_run_status(&run, RunStatus::Completed);
    assert_eq!(run.stages_skipped(), STANDARD_STAGES.to_vec());
}

#[tokio::test]
async fn test_resume_from_first_incomplete_stage() {
    let (_dir, fx) = fixture();
    run_with(&fx, Arc::new(ScriptedEngine::new()), false).await;
    std::fs::remove_dir_all(fx.stage_dir(2)).unwrap();

    let engine = Arc::new(ScriptedEngine::new());
    let run = run_with(&fx, engine.clone(), false).await;

    assert_run_status(&run, RunStatus::Completed);
    assert_stage_skipped(&run.stages[0]);
    assert_stage_skipped(&run.stages[1]);
    assert_stage_succeeded(&run.stages[2]);
    assert_eq!(engine.stage_calls(), vec!["npt:grompp", "npt:mdrun"]);
}

#[tokio::test]
async fn test_resume_after_emptied_output() {
    let (_dir, fx) = fixture();
    run_with(&fx, Arc::new(ScriptedEngine::new()), false).await;
    std::fs::write(fx.stage_dir(1).join("nvt.gro"), "").unwrap();

    let engine = Arc::new(ScriptedEngine::new());
    let run = run_with(&fx, engine.clone(), false).await;

    assert_stage_skipped(&run.stages[0]);
    assert_stage_succeeded(&run.stages[1]);
    assert_stage_skipped(&run.stages[2]);
}

#[tokio::test]
async fn test_force_reruns_every_stage() {
    let (_dir, fx) = fixture();
    run_with(&fx, Arc::new(ScriptedEngine::new()), false).await;

    let engine = Arc::new(ScriptedEngine::new());
    let run = run_with(&fx, engine.clone(), true).await;

    assert_eq!(run.stages_succeeded(), STANDARD_STAGES.to_vec());
    assert_eq!(engine.call_count(), 11);
}

#[tokio::test]
async fn test_empty_output_is_silent_failure() {
    let (_dir, fx) = fixture();
    let engine = Arc::new(ScriptedEngine::new().on("nvt:mdrun", StubBehavior::empty_outputs()));

    let run = run_with(&fx, engine.clone(), false).await;

    assert_run_status(&run, RunStatus::Aborted);
    let nvt = run.stage("nvt").unwrap();
    assert_stage_failed_with(nvt, "SilentFailure");
    assert_eq!(nvt.exit_code, Some(0));
    assert!(run.stage("npt").is_none());
    assert!(!fx.stage_dir(2).exists());
}

#[tokio::test]
async fn test_missing_stage_output_is_silent_failure() {
    let (_dir, fx) = fixture();
    let engine = Arc::new(ScriptedEngine::new().on("minimization:mdrun", StubBehavior::NoOutputs));

    let run = run_with(&fx, engine, false).await;

    let failed = run.failed_stage().unwrap();
    assert_eq!(failed.stage_name, "minimization");
    match failed.failure.as_ref().unwrap() {
        FailureReason::SilentFailure { subcommand, missing } => {
            assert_eq!(subcommand.as_deref(), Some("mdrun"));
            assert_eq!(missing, &vec!["minimization.gro".to_string()]);
        }
        other => panic!("unexpected failure: {other:?}"),
    }
}

#[tokio::test]
async fn test_nvt_failure_aborts_before_npt() {
    let (_dir, fx) = fixture();
    let engine = Arc::new(
        ScriptedEngine::new().on(
            "nvt:mdrun",
            StubBehavior::exit(1, "step 0\nFatal error:\nThere is no domain decomposition"),
        ),
    );

    let run = run_with(&fx, engine.clone(), false).await;

    assert_run_status(&run, RunStatus::Aborted);
    let nvt = run.failed_stage().unwrap();
    assert_eq!(nvt.stage_name, "nvt");
    assert_stage_failed_with(nvt, "NonZeroExit");
    assert_eq!(nvt.exit_code, Some(1));
    assert!(nvt.log_excerpt.contains("domain decomposition"));
    assert!(!fx.stage_dir(2).exists());
    assert!(!engine.stage_calls().iter().any(|c| c.starts_with("npt:")));
    assert_eq!(run.stages.len(), 2);
}

#[tokio::test]
async fn test_fatal_error_in_log_fails_zero_exit() {
    let (_dir, fx) = fixture();
    let engine = Arc::new(ScriptedEngine::new().on(
        "nvt:grompp",
        StubBehavior::SucceedWithLog("Fatal error:\nNo such moleculetype SOL".to_string()),
    ));

    let run = run_with(&fx, engine.clone(), false).await;

    let nvt = run.failed_stage().unwrap();
    assert_stage_failed_with(nvt, "LogPattern");
    assert_eq!(engine.stage_calls().last().map(String::as_str), Some("nvt:grompp"));
}

#[tokio::test]
async fn test_launch_failure_is_reported() {
    let (_dir, fx) = fixture();
    let engine = Arc::new(ScriptedEngine::new().on(
        "pdb2gmx",
        StubBehavior::LaunchFailure("permission denied".to_string()),
    ));

    let run = run_with(&fx, engine, false).await;

    let failed = run.failed_stage().unwrap();
    assert_stage_failed_with(failed, "LaunchError");
    assert_eq!(failed.exit_code, None);
}

struct DeleteOnSuccess {
    stage: &'static str,
    file: PathBuf,
}

#[async_trait]
impl EventSink for DeleteOnSuccess {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.try_emit(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        let is_target = data
            .as_ref()
            .and_then(|d| d.get("stage.name"))
            .and_then(|v| v.as_str())
            == Some(self.stage);
        if event_type == event_types::STAGE_SUCCEEDED && is_target {
            let _ = std::fs::remove_file(&self.file);
        }
    }
}

#[tokio::test]
async fn test_upstream_output_removed_between_stages() {
    let (_dir, fx) = fixture();
    let engine = Arc::new(ScriptedEngine::new());
    let sink = Arc::new(DeleteOnSuccess {
        stage: "minimization",
        file: fx.stage_dir(0).join("posre.itp"),
    });

    let pipeline = fx.pipeline().unwrap();
    let run = Orchestrator::new(engine.clone())
        .with_event_sink(sink)
        .run(&pipeline, &fx.root(), false, &CancellationToken::new())
        .await
        .unwrap();

    assert_run_status(&run, RunStatus::Aborted);
    let nvt = run.stage("nvt").unwrap();
    assert_eq!(
        nvt.failure,
        Some(FailureReason::MissingDependency {
            file: "posre.itp".to_string(),
            directory: fx.stage_dir(0),
        })
    );
    assert!(nvt.failure.as_ref().unwrap().is_invariant_violation());
    assert!(!engine.stage_calls().iter().any(|c| c.starts_with("nvt:")));

    let err = run.dependency_error().unwrap();
    assert_eq!(err.stage, "nvt");
    assert_eq!(err.file, "posre.itp");
}

#[tokio::test]
async fn test_timeout_and_cancel_are_distinct() {
    let (_dir, fx) = fixture();
    let pipeline = fx.pipeline().unwrap();

    let engine = Arc::new(ScriptedEngine::new().on("nvt:mdrun", StubBehavior::Hang));
    let timed_out = Orchestrator::new(engine)
        .with_default_timeout(Some(Duration::from_millis(50)))
        .run(&pipeline, &fx.root(), false, &CancellationToken::new())
        .await
        .unwrap();
    assert_stage_failed_with(timed_out.failed_stage().unwrap(), "TimeoutError");

    let engine = Arc::new(ScriptedEngine::new().on("nvt:mdrun", StubBehavior::Hang));
    let cancel = Arc::new(CancellationToken::new());
    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel("operator abort");
        })
    };
    let cancelled = Orchestrator::new(engine)
        .run(&pipeline, &fx.root(), false, &cancel)
        .await
        .unwrap();
    trigger.await.unwrap();

    let failed = cancelled.failed_stage().unwrap();
    assert_eq!(failed.stage_name, "nvt");
    assert_eq!(
        failed.failure,
        Some(FailureReason::Cancelled {
            reason: "operator abort".to_string()
        })
    );
    assert_run_status(&cancelled, RunStatus::Aborted);
    assert!(fx.stage_dir(1).exists());
}

#[tokio::test]
async fn test_concurrent_run_rejected() {
    let (_dir, fx) = fixture();
    let _held = RunLock::acquire(&fx.root(), uuid::Uuid::new_v4()).unwrap();
    let engine = Arc::new(ScriptedEngine::new());

    let pipeline = fx.pipeline().unwrap();
    let err = Orchestrator::new(engine.clone())
        .run(&pipeline, &fx.root(), false, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, MdflowError::ConcurrentRun(_)));
    assert_eq!(engine.call_count(), 0);
    assert!(!fx.stage_dir(0).exists());
}

#[tokio::test]
async fn test_seed_written_only_under_lock() {
    let (dir, fx) = fixture();
    let source = dir.path().join("2xyz.pdb");
    std::fs::write(&source, "ATOM replacement\n").unwrap();
    let seeds = [SeedFile::new(&source, SEED_STRUCTURE)];
    let pipeline = fx.pipeline().unwrap();
    let orchestrator = Orchestrator::new(Arc::new(ScriptedEngine::new()));

    let held = RunLock::acquire(&fx.root(), uuid::Uuid::new_v4()).unwrap();
    let err = orchestrator
        .run_seeded(&pipeline, &fx.root(), &seeds, false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MdflowError::ConcurrentRun(_)));
    let seed = fx.root().join(SEED_STRUCTURE);
    assert_eq!(std::fs::read_to_string(&seed).unwrap(), SAMPLE_PDB);

    drop(held);
    let run = orchestrator
        .run_seeded(&pipeline, &fx.root(), &seeds, false, &CancellationToken::new())
        .await
        .unwrap();
    assert_run_status(&run, RunStatus::Completed);
    assert_eq!(std::fs::read_to_string(&seed).unwrap(), "ATOM replacement\n");
}

#[tokio::test]
async fn test_missing_prerequisites_fail_fast() {
    let (_dir, fx) = fixture();
    let pipeline = fx.pipeline().unwrap();

    let engine = Arc::new(ScriptedEngine::new().unlocatable());
    let err = Orchestrator::new(engine.clone())
        .run(&pipeline, &fx.root(), false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MdflowError::MissingPrerequisite(ref e) if e.kind == Prerequisite::Engine
    ));
    assert_eq!(engine.call_count(), 0);

    std::fs::remove_file(fx.settings().template_for("npt")).unwrap();
    let engine = Arc::new(ScriptedEngine::new());
    let err = Orchestrator::new(engine.clone())
        .run(&pipeline, &fx.root(), false, &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        MdflowError::MissingPrerequisite(e) => {
            assert_eq!(e.kind, Prerequisite::Template);
            assert!(e.error_info.fix_hint.is_some());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.call_count(), 0);
    assert!(!fx.stage_dir(0).exists());
}

#[tokio::test]
async fn test_lifecycle_events() {
    let (_dir, fx) = fixture();
    let sink = Arc::new(CollectingEventSink::new());

    let pipeline = fx.pipeline().unwrap();
    Orchestrator::new(Arc::new(ScriptedEngine::new()))
        .with_event_sink(sink.clone())
        .run(&pipeline, &fx.root(), false, &CancellationToken::new())
        .await
        .unwrap();

    let types = sink.event_types();
    assert_eq!(types.first().map(String::as_str), Some(event_types::PIPELINE_STARTED));
    assert_eq!(types.last().map(String::as_str), Some(event_types::PIPELINE_COMPLETED));
    assert_eq!(sink.count(event_types::STAGE_STARTED), 3);
    assert_eq!(sink.count(event_types::STAGE_SUCCEEDED), 3);
    assert_eq!(sink.count(event_types::ENGINE_INVOKED), 11);
    assert_eq!(sink.count(event_types::ENGINE_COMPLETED), 11);
}

#[tokio::test]
async fn test_aborted_run_report_on_disk() {
    let (_dir, fx) = fixture();
    let engine = Arc::new(
        ScriptedEngine::new().on("npt:grompp", StubBehavior::exit(1, "Fatal error:\nmissing cpt")),
    );
    let run = run_with(&fx, engine, false).await;

    let text = std::fs::read_to_string(fx.root().join(RUN_REPORT_FILE)).unwrap();
    let stored: PipelineRun = serde_json::from_str(&text).unwrap();
    assert_eq!(stored.run_id, run.run_id);
    assert_eq!(stored.status, RunStatus::Aborted);
    assert_eq!(stored.stages.last().map(|s| s.status), Some(StageStatus::Failed));
    assert!(stored.stages[2].log_excerpt.contains("missing cpt"));
}

#[tokio::test]
async fn test_stop_after_runs_prefix() {
    let (_dir, fx) = fixture();
    let engine = Arc::new(ScriptedEngine::new());
    let pipeline = fx.pipeline().unwrap().truncated("nvt").unwrap();

    let run = Orchestrator::new(engine)
        .run(&pipeline, &fx.root(), false, &CancellationToken::new())
        .await
        .unwrap();

    assert_run_status(&run, RunStatus::Completed);
    assert_eq!(stage_dirs(&fx), vec!["00_minimization", "01_nvt"]);
}

#[tokio::test]
async fn test_overrides_reach_stage_template_copy() {
    let (_dir, mut fx) = fixture();
    fx.settings_mut()
        .overrides
        .insert("nvt".to_string(), ParameterOverrides::new().with("nsteps", 500));

    let run = run_with(&fx, Arc::new(ScriptedEngine::new()), false).await;
    assert_run_status(&run, RunStatus::Completed);

    let copy = std::fs::read_to_string(fx.stage_dir(1).join("nvt.mdp")).unwrap();
    assert!(copy.contains("nsteps = 500"));
    let original = std::fs::read_to_string(fx.settings().template_for("nvt")).unwrap();
    assert!(original.contains("50000"));
    let npt = std::fs::read_to_string(fx.stage_dir(2).join("npt.mdp")).unwrap();
    assert!(npt.contains("50000"));
}
