//! Engine backend that spawns real processes with `tokio::process`.

use super::{CaptureLimits, Engine, EngineCommand, EngineExit, LineSplitter, LogCapture};
use crate::cancellation::CancellationToken;
use crate::errors::EngineError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long to wait for output pipes to drain after the process is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

enum Interrupt {
    Timeout,
    Cancelled,
}

/// Runs `<program> <subcommand> <args...>` as a child process.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    program: PathBuf,
    limits: CaptureLimits,
}

impl ProcessEngine {
    /// Creates an engine for the given program name or path.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            limits: CaptureLimits::default(),
        }
    }

    /// Sets the capture limits.
    #[must_use]
    pub fn with_capture_limits(mut self, limits: CaptureLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Resolves a program the way a shell would.
///
/// A value containing a path separator must name an existing file; a bare
/// name is searched for on `PATH`.
#[must_use]
pub fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return is_executable(program).then(|| program.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending().await,
    }
}

fn drain<R>(reader: R, capture: Arc<Mutex<LogCapture>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut splitter = LineSplitter::default();
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => splitter.feed(&chunk[..n], &mut capture.lock()),
                Err(e) => {
                    debug!(error = %e, "Engine output pipe closed with error");
                    break;
                }
            }
        }
        splitter.finish(&mut capture.lock());
    })
}

async fn join_drain(handle: Option<JoinHandle<()>>) {
    if let Some(mut handle) = handle {
        // A grandchild can keep the pipe open after the engine is killed.
        if tokio::time::timeout(DRAIN_GRACE, &mut handle).await.is_err() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Engine for ProcessEngine {
    fn program(&self) -> String {
        self.program.display().to_string()
    }

    fn locate(&self) -> Option<PathBuf> {
        resolve_program(&self.program)
    }

    async fn execute(
        &self,
        command: &EngineCommand,
        cancel: &CancellationToken,
    ) -> Result<EngineExit, EngineError> {
        let started = Instant::now();
        let mut child = Command::new(&self.program)
            .arg(&command.subcommand)
            .args(&command.args)
            .current_dir(&command.work_dir)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::launch(self.program(), e.to_string()))?;

        let capture = Arc::new(Mutex::new(LogCapture::new(self.limits)));
        let stdout = child.stdout.take().map(|out| drain(out, capture.clone()));
        let stderr = child.stderr.take().map(|err| drain(err, capture.clone()));

        let stdin_task = match (child.stdin.take(), command.stdin.clone()) {
            (Some(mut pipe), Some(script)) => Some(tokio::spawn(async move {
                if let Err(e) = pipe.write_all(script.as_bytes()).await {
                    debug!(error = %e, "Engine closed stdin before reading the script");
                }
                // Dropping the pipe closes stdin.
            })),
            _ => None,
        };

        let waited = tokio::select! {
            status = child.wait() => Ok(status),
            () = deadline(command.timeout) => Err(Interrupt::Timeout),
            () = cancel.cancelled() => Err(Interrupt::Cancelled),
        };

        if waited.is_err() {
            if let Err(e) = child.kill().await {
                warn!(
                    subcommand = %command.subcommand,
                    error = %e,
                    "Failed to kill engine process"
                );
            }
        }
        if let Some(task) = stdin_task {
            task.abort();
        }
        join_drain(stdout).await;
        join_drain(stderr).await;

        let log = match Arc::try_unwrap(capture) {
            Ok(mutex) => mutex.into_inner().finish(),
            Err(shared) => std::mem::take(&mut *shared.lock()).finish(),
        };
        let duration = started.elapsed();

        match waited {
            Ok(Ok(status)) => Ok(EngineExit {
                code: status.code(),
                success: status.success(),
                log,
                duration,
            }),
            Ok(Err(e)) => Err(EngineError::launch(
                self.program(),
                format!("failed to wait for '{}': {e}", command.subcommand),
            )),
            Err(Interrupt::Timeout) => Err(EngineError::Timeout {
                subcommand: command.subcommand.clone(),
                timeout: command.timeout.unwrap_or_default(),
                captured: log.text(),
            }),
            Err(Interrupt::Cancelled) => Err(EngineError::Cancelled {
                subcommand: command.subcommand.clone(),
                reason: cancel.reason_or_default(),
                captured: log.text(),
            }),
        }
    }
}
