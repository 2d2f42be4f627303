//! Platform process control behind one seam.
//!
//! The supervisor only needs four capabilities: spawn an argv with output
//! redirected to a file, ask whether the child is still alive, ask it to exit,
//! and kill it. [`ProcessLauncher`] and [`ProcessHandle`] expose exactly that so
//! tests can swap in an in-memory child.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};

use crate::config::ShutdownPolicy;

/// What to run and where its output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Appended to; created if missing.
    pub log_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Io(#[from] io::Error),
    #[error("spawned process has no pid (exited immediately?)")]
    NoPid,
}

/// A live (or recently live) child process.
pub trait ProcessHandle: Send {
    fn pid(&self) -> u32;

    /// Cheap local check. Reaps the child if it has exited.
    fn is_alive(&mut self) -> bool;

    /// Ask the process to exit on its own terms.
    fn terminate(&mut self) -> io::Result<()>;

    /// Forcefully end the process.
    fn kill(&mut self) -> io::Result<()>;
}

/// Extension point for different spawn strategies.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, SpawnError>;
}

/// Spawns real OS processes via tokio.
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, SpawnError> {
        let (stdout, stderr) = match open_log(spec) {
            Ok(streams) => streams,
            Err(e) => {
                tracing::warn!(
                    path = %spec.log_path.display(),
                    error = %e,
                    "Cannot open pool log file, discarding child output"
                );
                (Stdio::null(), Stdio::null())
            }
        };

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(false)
            .spawn()?;

        let pid = child.id().ok_or(SpawnError::NoPid)?;
        Ok(Box::new(SystemProcess { child, pid }))
    }
}

fn open_log(spec: &LaunchSpec) -> io::Result<(Stdio, Stdio)> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log_path)?;
    let stderr = file.try_clone()?;
    Ok((Stdio::from(file), Stdio::from(stderr)))
}

struct SystemProcess {
    child: Child,
    pid: u32,
}

impl ProcessHandle for SystemProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let pid = i32::try_from(self.pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
    }

    // No console or window to signal; the grace window in `shutdown` still lets
    // the process exit on its own before it is killed.
    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

/// Graceful-then-forceful termination.
///
/// Requests termination, polls liveness every `poll_interval` for up to `grace`,
/// then kills and waits up to `reap_wait` for the process to be reaped.
/// Returns true if the process exited within the grace window.
pub async fn shutdown(child: &mut dyn ProcessHandle, policy: &ShutdownPolicy) -> bool {
    let pid = child.pid();

    if !child.is_alive() {
        return true;
    }

    tracing::info!(pid, "Sending termination request to pool process");
    if let Err(e) = child.terminate() {
        tracing::warn!(pid, error = %e, "Termination request failed");
    }

    let step = policy.poll_interval.max(Duration::from_millis(1));
    let deadline = Instant::now() + policy.grace;
    while Instant::now() < deadline {
        if !child.is_alive() {
            tracing::info!(pid, "Pool process exited gracefully");
            return true;
        }
        tokio::time::sleep(step).await;
    }

    tracing::warn!(pid, "Pool process did not exit, killing");
    force_kill(child, policy.reap_wait).await;
    false
}

/// Kill without a grace window, then wait up to `reap_wait` for exit.
pub async fn force_kill(child: &mut dyn ProcessHandle, reap_wait: Duration) {
    let pid = child.pid();
    if let Err(e) = child.kill() {
        tracing::warn!(pid, error = %e, "Kill failed");
    }

    let step = Duration::from_millis(50).min(reap_wait.max(Duration::from_millis(1)));
    let mut waited = Duration::ZERO;
    while child.is_alive() && waited < reap_wait {
        tokio::time::sleep(step).await;
        waited += step;
    }
}
