//! A scripted engine backend for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::engine::{CapturedLog, Engine, EngineCommand, EngineExit};
use crate::errors::EngineError;

/// Extensions written for `mdrun -deffnm <name>`.
const DEFFNM_OUTPUTS: [&str; 4] = ["gro", "cpt", "edr", "log"];

/// What a scripted call does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubBehavior {
    /// Writes the outputs named by the arguments and exits 0.
    Succeed,
    /// Writes outputs, prints `log` and exits 0.
    SucceedWithLog(String),
    /// Exits with `code` after printing `log`; writes nothing.
    Exit {
        /// Exit code.
        code: i32,
        /// Printed output.
        log: String,
    },
    /// Exits 0 but leaves every output empty.
    EmptyOutputs,
    /// Exits 0 without writing anything.
    NoOutputs,
    /// Fails to start.
    LaunchFailure(String),
    /// Runs until the timeout elapses or the run is cancelled.
    Hang,
}

impl StubBehavior {
    /// Non-zero exit with output.
    #[must_use]
    pub fn exit(code: i32, log: impl Into<String>) -> Self {
        Self::Exit {
            code,
            log: log.into(),
        }
    }

    /// Zero exit with empty outputs.
    #[must_use]
    pub fn empty_outputs() -> Self {
        Self::EmptyOutputs
    }
}

/// One call seen by a [`ScriptedEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Stage name, from the `NN_<stage>` work directory.
    pub stage: String,
    /// Engine subcommand.
    pub subcommand: String,
    /// Resolved arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub work_dir: PathBuf,
    /// Stdin script.
    pub stdin: Option<String>,
}

/// Engine stub that imitates GROMACS file behaviour without running it.
///
/// Outputs are inferred from the arguments: `-o <file>` is written,
/// `-deffnm <name>` writes `<name>.gro/.cpt/.edr/.log`, and `-p`/`-i` files
/// are created when absent. Behaviour is chosen per `"<stage>:<subcommand>"`
/// first, then per `"<subcommand>"`, defaulting to [`StubBehavior::Succeed`].
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    behaviors: HashMap<String, StubBehavior>,
    calls: Mutex<Vec<RecordedCall>>,
    unlocatable: bool,
}

impl ScriptedEngine {
    /// Creates an engine where every call succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the behaviour for a `subcommand` or `stage:subcommand` key.
    #[must_use]
    pub fn on(mut self, key: impl Into<String>, behavior: StubBehavior) -> Self {
        self.behaviors.insert(key.into(), behavior);
        self
    }

    /// Makes [`Engine::locate`] fail, as if the binary were not installed.
    #[must_use]
    pub fn unlocatable(mut self) -> Self {
        self.unlocatable = true;
        self
    }

    /// Subcommands called so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.subcommand.clone()).collect()
    }

    /// `stage:subcommand` keys called so far, in order.
    #[must_use]
    pub fn stage_calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|c| format!("{}:{}", c.stage, c.subcommand))
            .collect()
    }

    /// Full records of the calls so far.
    #[must_use]
    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of calls so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn behavior_for(&self, stage: &str, subcommand: &str) -> StubBehavior {
        self.behaviors
            .get(&format!("{stage}:{subcommand}"))
            .or_else(|| self.behaviors.get(subcommand))
            .cloned()
            .unwrap_or(StubBehavior::Succeed)
    }
}

fn stage_of(work_dir: &Path) -> String {
    let name = work_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    match name.split_once('_') {
        Some((prefix, rest)) if prefix.chars().all(|c| c.is_ascii_digit()) => rest.to_string(),
        _ => name.to_string(),
    }
}

fn outputs_of(command: &EngineCommand) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut written = Vec::new();
    let mut created_if_absent = Vec::new();
    let mut args = command.args.iter();
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "-o" => written.extend(args.next().map(|f| command.work_dir.join(f))),
            "-deffnm" => {
                if let Some(name) = args.next() {
                    written.extend(
                        DEFFNM_OUTPUTS
                            .iter()
                            .map(|ext| command.work_dir.join(format!("{name}.{ext}"))),
                    );
                }
            }
            "-p" | "-i" => created_if_absent.extend(args.next().map(|f| command.work_dir.join(f))),
            _ => {}
        }
    }
    (written, created_if_absent)
}

fn write_outputs(command: &EngineCommand, content: &str) -> Result<(), EngineError> {
    let (written, created_if_absent) = outputs_of(command);
    let io_err = |e: std::io::Error| EngineError::launch("scripted", e.to_string());
    for path in written {
        std::fs::write(&path, content).map_err(io_err)?;
    }
    for path in created_if_absent {
        if !path.exists() {
            std::fs::write(&path, content).map_err(io_err)?;
        }
    }
    Ok(())
}

fn exit(code: i32, log: &str) -> EngineExit {
    EngineExit {
        code: Some(code),
        success: code == 0,
        log: CapturedLog::from_text(log),
        duration: Duration::from_millis(1),
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn program(&self) -> String {
        "scripted-gmx".to_string()
    }

    fn locate(&self) -> Option<PathBuf> {
        (!self.unlocatable).then(|| PathBuf::from("/scripted/gmx"))
    }

    async fn execute(
        &self,
        command: &EngineCommand,
        cancel: &CancellationToken,
    ) -> Result<EngineExit, EngineError> {
        let stage = stage_of(&command.work_dir);
        let behavior = self.behavior_for(&stage, &command.subcommand);
        self.calls.lock().push(RecordedCall {
            stage,
            subcommand: command.subcommand.clone(),
            args: command.args.clone(),
            work_dir: command.work_dir.clone(),
            stdin: command.stdin.clone(),
        });

        match behavior {
            StubBehavior::Succeed => {
                write_outputs(command, &format!("scripted {}\n", command.subcommand))?;
                Ok(exit(0, &format!("{} finished", command.subcommand)))
            }
            StubBehavior::SucceedWithLog(log) => {
                write_outputs(command, &format!("scripted {}\n", command.subcommand))?;
                Ok(exit(0, &log))
            }
            StubBehavior::Exit { code, log } => Ok(exit(code, &log)),
            StubBehavior::EmptyOutputs => {
                write_outputs(command, "")?;
                Ok(exit(0, ""))
            }
            StubBehavior::NoOutputs => Ok(exit(0, "")),
            StubBehavior::LaunchFailure(message) => {
                Err(EngineError::launch(self.program(), message))
            }
            StubBehavior::Hang => {
                let timeout = command.timeout;
                let sleep = async {
                    match timeout {
                        Some(t) => tokio::time::sleep(t).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    () = sleep => Err(EngineError::Timeout {
                        subcommand: command.subcommand.clone(),
                        timeout: timeout.unwrap_or_default(),
                        captured: "step 0".to_string(),
                    }),
                    () = cancel.cancelled() => Err(EngineError::Cancelled {
                        subcommand: command.subcommand.clone(),
                        reason: cancel.reason_or_default(),
                        captured: "step 0".to_string(),
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_of_strips_index() {
        assert_eq!(stage_of(Path::new("/w/01_nvt")), "nvt");
        assert_eq!(stage_of(Path::new("/w/02_npt_long")), "npt_long");
        assert_eq!(stage_of(Path::new("/w/scratch")), "scratch");
    }

    #[tokio::test]
    async fn test_scripted_writes_declared_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("00_minimization");
        std::fs::create_dir(&work).unwrap();
        std::fs::write(work.join("topol.top"), "real topology").unwrap();

        let engine = ScriptedEngine::new();
        let mut cmd = EngineCommand::new("grompp", &work);
        cmd.args = ["-o", "ions.tpr", "-p", "topol.top", "-i", "posre.itp"]
            .map(String::from)
            .to_vec();
        let exit = engine.execute(&cmd, &CancellationToken::new()).await.unwrap();

        assert!(exit.success);
        assert!(work.join("ions.tpr").is_file());
        assert!(work.join("posre.itp").is_file());
        assert_eq!(std::fs::read_to_string(work.join("topol.top")).unwrap(), "real topology");
        assert_eq!(engine.stage_calls(), vec!["minimization:grompp"]);
    }

    #[tokio::test]
    async fn test_scripted_stage_specific_behavior() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new().on("nvt:mdrun", StubBehavior::exit(1, "boom"));

        let nvt = EngineCommand::new("mdrun", dir.path().join("01_nvt"));
        let npt = EngineCommand::new("mdrun", dir.path().join("02_npt"));
        let cancel = CancellationToken::new();

        assert_eq!(engine.execute(&nvt, &cancel).await.unwrap().code, Some(1));
        assert_eq!(engine.execute(&npt, &cancel).await.unwrap().code, Some(0));
    }

    #[tokio::test]
    async fn test_scripted_hang_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new().on("mdrun", StubBehavior::Hang);
        let mut cmd = EngineCommand::new("mdrun", dir.path());
        cmd.timeout = Some(Duration::from_millis(20));

        let err = engine.execute(&cmd, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
    }
}
