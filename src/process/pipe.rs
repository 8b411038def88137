//! Pipe-mode spawning: three anonymous pipes, process-group kill on drop.
//!
//! Grounded directly in the `ChildGuard` / `spawn_and_stream` scaffolding
//! used for subprocess agent adapters elsewhere in this codebase's lineage:
//! a process group is created so the whole tree dies together, and the
//! guard escalates SIGTERM→SIGKILL rather than relying on a single signal.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::process::{Child, ChildStdin, Command};

use crate::error::{Error, Result};
use crate::output::{self};

use super::AcquireConfig;

/// Kills a child's process group on drop or on explicit `kill`.
///
/// Safe to call `kill` more than once; only the first call sends signals.
pub(crate) struct ChildGuard {
    pid: u32,
    killed: AtomicBool,
}

impl ChildGuard {
    pub(crate) fn new(pid: u32) -> Self {
        Self {
            pid,
            killed: AtomicBool::new(false),
        }
    }

    #[cfg(unix)]
    pub(crate) fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pgid = Pid::from_raw(self.pid as i32);
        if let Err(e) = killpg(pgid, Signal::SIGTERM) {
            tracing::debug!(pid = self.pid, error = %e, "SIGTERM to process group failed");
            return;
        }
        let pid = self.pid;
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_secs(2));
            let pgid = Pid::from_raw(pid as i32);
            if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                tracing::debug!(pid, error = %e, "SIGKILL to process group failed");
            }
        });
    }

    #[cfg(windows)]
    pub(crate) fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = std::process::Command::new("taskkill")
            .args(["/PID", &self.pid.to_string(), "/T", "/F"])
            .output()
        {
            tracing::debug!(pid = self.pid, error = %e, "taskkill failed");
        }
    }

    #[cfg(not(any(unix, windows)))]
    pub(crate) fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(pid = self.pid, "process cleanup unsupported on this platform");
    }

    #[cfg(unix)]
    pub(crate) fn signal(&self, sig: &str) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        let signal = match sig {
            "SIGKILL" => Signal::SIGKILL,
            "SIGINT" => Signal::SIGINT,
            _ => Signal::SIGTERM,
        };
        if signal == Signal::SIGKILL {
            self.killed.store(true, Ordering::SeqCst);
        }
        let _ = killpg(Pid::from_raw(self.pid as i32), signal);
    }

    #[cfg(not(unix))]
    pub(crate) fn signal(&self, _sig: &str) {
        self.kill();
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

pub(crate) struct SpawnedPipe {
    pub(crate) child: Child,
    pub(crate) pid: u32,
    pub(crate) guard: std::sync::Arc<ChildGuard>,
    pub(crate) stdin: Option<ChildStdin>,
    pub(crate) chunks: tokio_stream::wrappers::ReceiverStream<output::OutputChunk>,
}

pub(crate) fn validate_cwd(cwd: &Path) -> Result<()> {
    if !cwd.exists() {
        return Err(Error::InvalidTask(format!(
            "working directory does not exist: {}",
            cwd.display()
        )));
    }
    if !cwd.is_dir() {
        return Err(Error::InvalidTask(format!(
            "working directory is not a directory: {}",
            cwd.display()
        )));
    }
    Ok(())
}

pub(crate) async fn spawn(config: &AcquireConfig, env: &HashMap<String, String>) -> Result<SpawnedPipe> {
    validate_cwd(&config.cwd)?;

    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args)
        .current_dir(&config.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    #[cfg(unix)]
    cmd.process_group(0);

    for (k, v) in env {
        cmd.env(k, v);
    }
    for (k, v) in &config.env {
        cmd.env(k, v);
    }

    let mut child = cmd.spawn().map_err(|e| Error::SpawnFailed(e.to_string()))?;
    let pid = child
        .id()
        .ok_or_else(|| Error::SpawnFailed("failed to obtain child process id".into()))?;
    let guard = std::sync::Arc::new(ChildGuard::new(pid));

    let stdin = child.stdin.take();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::SpawnFailed("failed to capture stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::SpawnFailed("failed to capture stderr".into()))?;

    let chunks = output::merge(stdout, stderr);

    Ok(SpawnedPipe {
        child,
        pid,
        guard,
        stdin,
        chunks,
    })
}
