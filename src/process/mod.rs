//! Component A: Process Manager.
//!
//! Owns every live child end-to-end: spawning (pipe or PTY mode), tracking
//! status and metrics, accepting input, and terminating. Executors (§4.F)
//! and the engine (§4.G) hold only the returned id; the manager is the sole
//! owner of the OS handle.

mod pipe;
mod pty;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Error, Result};
use crate::output::OutputChunk;

/// How long a terminal record is kept around after exit so late readers can
/// still observe the final status (§3 ownership).
const GRACE_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum ProcessMode {
    Pipe,
    Pty { cols: u16, rows: u16, term: String },
}

impl Default for ProcessMode {
    fn default() -> Self {
        ProcessMode::Pipe
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcquireConfig {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub mode: ProcessMode,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Spawning,
    Idle,
    Busy,
    Terminating,
    Crashed,
    Completed,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub total_runtime_ms: u64,
    pub tasks_completed: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedProcess {
    pub id: String,
    pub pid: u32,
    pub status: ProcessStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
    pub metrics: ProcessMetrics,
}

/// Returned from `acquire`: the caller owns the merged output stream and can
/// push input through the manager via `send_input`.
pub struct Spawned {
    pub id: String,
    pub pid: u32,
    pub output: ReceiverStream<OutputChunk>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ManagerMetrics {
    pub total_spawned: u64,
    pub currently_active: u64,
}

enum StdinHandle {
    Pipe(Option<tokio::process::ChildStdin>),
    Pty(Arc<std::sync::Mutex<Box<dyn std::io::Write + Send>>>),
}

enum Killer {
    Pipe(Arc<pipe::ChildGuard>),
    Pty(Arc<std::sync::Mutex<Box<dyn portable_pty::Child + Send + Sync>>>),
}

struct Entry {
    record: ManagedProcess,
    stdin: StdinHandle,
    killer: Killer,
    terminate_requested: bool,
    pty_master: Option<Arc<std::sync::Mutex<Box<dyn portable_pty::MasterPty + Send>>>>,
}

struct Inner {
    processes: HashMap<String, Entry>,
    metrics: ManagerMetrics,
}

/// Spawns, tracks, and terminates agent subprocesses.
#[derive(Clone)]
pub struct ProcessManager {
    base_env: HashMap<String, String>,
    inner: Arc<Mutex<Inner>>,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            base_env: std::env::vars().collect(),
            inner: Arc::new(Mutex::new(Inner {
                processes: HashMap::new(),
                metrics: ManagerMetrics::default(),
            })),
        }
    }

    pub async fn acquire(&self, config: AcquireConfig) -> Result<Spawned> {
        let retry = config.retry.unwrap_or_default();
        let mut last_err = None;
        for attempt in 0..retry.max_attempts.max(1) {
            match self.try_acquire(&config).await {
                Ok(spawned) => return Ok(spawned),
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < retry.max_attempts {
                        tokio::time::sleep(retry.backoff).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::SpawnFailed("unknown spawn failure".into())))
    }

    async fn try_acquire(&self, config: &AcquireConfig) -> Result<Spawned> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let (record, stdin, killer, output, pty_master) = match &config.mode {
            ProcessMode::Pipe => {
                let spawned = pipe::spawn(config, &self.base_env).await?;
                let pid = spawned.pid;
                let record = ManagedProcess {
                    id: id.clone(),
                    pid,
                    status: ProcessStatus::Busy,
                    created_at: now,
                    last_activity: now,
                    exit_code: None,
                    exit_signal: None,
                    metrics: ProcessMetrics::default(),
                };
                let guard = spawned.guard;
                let stdin = StdinHandle::Pipe(spawned.stdin);
                let killer = Killer::Pipe(guard.clone());

                let inner = self.inner.clone();
                let id_for_wait = id.clone();
                let mut child = spawned.child;
                tokio::spawn(async move {
                    let status = child.wait().await;
                    reap(&inner, &id_for_wait, status).await;
                });

                (record, stdin, killer, spawned.chunks, None)
            }
            ProcessMode::Pty { cols, rows, term } => {
                let spawned = pty::spawn(config, &self.base_env, *cols, *rows, term)?;
                // portable-pty does not expose a pid uniformly across
                // platforms; process_id() returns None on some backends.
                let pid = spawned.child.process_id().unwrap_or(0);
                let record = ManagedProcess {
                    id: id.clone(),
                    pid,
                    status: ProcessStatus::Busy,
                    created_at: now,
                    last_activity: now,
                    exit_code: None,
                    exit_signal: None,
                    metrics: ProcessMetrics::default(),
                };
                let child_arc = Arc::new(std::sync::Mutex::new(spawned.child));
                let stdin = StdinHandle::Pty(Arc::new(std::sync::Mutex::new(spawned.writer)));
                let killer = Killer::Pty(child_arc.clone());
                let master = Arc::new(std::sync::Mutex::new(spawned.master));

                let inner = self.inner.clone();
                let id_for_wait = id.clone();
                tokio::spawn(async move {
                    let wait_result = tokio::task::spawn_blocking(move || {
                        child_arc.lock().unwrap().wait().map(ExitLike::Pty).map_err(|e| e.to_string())
                    })
                    .await;
                    let status = wait_result.unwrap_or_else(|e| Err(e.to_string()));
                    reap_pty(&inner, &id_for_wait, status).await;
                });

                (record, stdin, killer, spawned.chunks, Some(master))
            }
        };

        {
            let mut guard = self.inner.lock().await;
            guard.metrics.total_spawned += 1;
            guard.metrics.currently_active += 1;
            guard.processes.insert(
                id.clone(),
                Entry {
                    record: record.clone(),
                    stdin,
                    killer,
                    terminate_requested: false,
                    pty_master,
                },
            );
        }

        if let Some(timeout) = config.timeout {
            let manager = self.clone();
            let id_for_timeout = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = manager.terminate(&id_for_timeout, None).await;
            });
        }

        Ok(Spawned {
            id,
            pid: record.pid,
            output,
        })
    }

    pub async fn send_input(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let entry = guard
            .processes
            .get_mut(id)
            .ok_or_else(|| Error::ProcessNotFound(id.to_string()))?;
        entry.record.last_activity = Utc::now();
        match &mut entry.stdin {
            StdinHandle::Pipe(stdin) => {
                use tokio::io::AsyncWriteExt;
                let Some(stdin) = stdin.as_mut() else {
                    return Err(Error::Unsupported("stdin already closed".into()));
                };
                stdin
                    .write_all(bytes)
                    .await
                    .map_err(|e| Error::Protocol(e.to_string()))?;
            }
            StdinHandle::Pty(writer) => {
                use std::io::Write;
                let writer = writer.clone();
                let bytes = bytes.to_vec();
                tokio::task::spawn_blocking(move || writer.lock().unwrap().write_all(&bytes))
                    .await
                    .map_err(|e| Error::Protocol(e.to_string()))?
                    .map_err(|e| Error::Protocol(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Close stdin for pipe-mode agents with a unidirectional protocol.
    pub async fn close_input(&self, id: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let entry = guard
            .processes
            .get_mut(id)
            .ok_or_else(|| Error::ProcessNotFound(id.to_string()))?;
        if let StdinHandle::Pipe(stdin) = &mut entry.stdin {
            *stdin = None;
        }
        Ok(())
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        let master = {
            let guard = self.inner.lock().await;
            let entry = guard
                .processes
                .get(id)
                .ok_or_else(|| Error::ProcessNotFound(id.to_string()))?;
            match &entry.pty_master {
                Some(master) => master.clone(),
                None => return Err(Error::Unsupported("resize is PTY-only".into())),
            }
        };
        tokio::task::spawn_blocking(move || {
            master.lock().unwrap().resize(portable_pty::PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
        })
        .await
        .map_err(|e| Error::Protocol(e.to_string()))?
        .map_err(|e| Error::Protocol(e.to_string()))?;
        Ok(())
    }

    /// Idempotent: no-op once the process has already left `busy`.
    pub async fn terminate(&self, id: &str, signal: Option<&str>) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let Some(entry) = guard.processes.get_mut(id) else {
            return Ok(());
        };
        if entry.record.status != ProcessStatus::Busy && entry.record.status != ProcessStatus::Spawning
        {
            return Ok(());
        }
        entry.record.status = ProcessStatus::Terminating;
        entry.terminate_requested = true;
        let sig = signal.unwrap_or("SIGTERM");
        match &entry.killer {
            Killer::Pipe(guard) => {
                if sig == "SIGKILL" {
                    guard.kill();
                } else {
                    guard.signal(sig);
                }
            }
            Killer::Pty(child) => {
                let child = child.clone();
                tokio::task::spawn_blocking(move || {
                    let _ = child.lock().unwrap().kill();
                });
            }
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<ManagedProcess> {
        self.inner.lock().await.processes.get(id).map(|e| e.record.clone())
    }

    pub async fn list_active(&self) -> Vec<ManagedProcess> {
        self.inner
            .lock()
            .await
            .processes
            .values()
            .map(|e| e.record.clone())
            .collect()
    }

    pub async fn metrics(&self) -> ManagerMetrics {
        self.inner.lock().await.metrics
    }

    /// Terminate every tracked process. Used by the Shutdown Manager (§4.H)
    /// after its own escalation has run.
    pub async fn shutdown(&self) -> Result<()> {
        let ids: Vec<String> = {
            let guard = self.inner.lock().await;
            guard.processes.keys().cloned().collect()
        };
        for id in ids {
            self.terminate(&id, Some("SIGKILL")).await?;
        }
        Ok(())
    }
}

enum ExitLike {
    Pty(portable_pty::ExitStatus),
}

async fn reap(inner: &Arc<Mutex<Inner>>, id: &str, status: std::io::Result<std::process::ExitStatus>) {
    let (exit_code, signal_name, requested) = {
        let guard = inner.lock().await;
        let requested = guard
            .processes
            .get(id)
            .map(|e| e.terminate_requested)
            .unwrap_or(false);
        let (code, sig) = match &status {
            Ok(s) => (s.code(), unix_signal_name(s)),
            Err(_) => (None, None),
        };
        (code, sig, requested)
    };

    let mut guard = inner.lock().await;
    if let Some(entry) = guard.processes.get_mut(id) {
        entry.record.exit_code = exit_code;
        entry.record.exit_signal = signal_name;
        entry.record.status = if exit_code == Some(0) || requested {
            ProcessStatus::Completed
        } else {
            ProcessStatus::Crashed
        };
        entry.record.last_activity = Utc::now();
    }
    guard.metrics.currently_active = guard.metrics.currently_active.saturating_sub(1);
    drop(guard);
    schedule_eviction(inner.clone(), id.to_string());
}

async fn reap_pty(inner: &Arc<Mutex<Inner>>, id: &str, status: Result<ExitLike, String>) {
    let (exit_code, requested) = {
        let guard = inner.lock().await;
        let requested = guard
            .processes
            .get(id)
            .map(|e| e.terminate_requested)
            .unwrap_or(false);
        let code = match &status {
            Ok(ExitLike::Pty(s)) => Some(s.exit_code() as i32),
            Err(_) => None,
        };
        (code, requested)
    };

    let mut guard = inner.lock().await;
    if let Some(entry) = guard.processes.get_mut(id) {
        entry.record.exit_code = exit_code;
        entry.record.status = if exit_code == Some(0) || requested {
            ProcessStatus::Completed
        } else {
            ProcessStatus::Crashed
        };
        entry.record.last_activity = Utc::now();
    }
    guard.metrics.currently_active = guard.metrics.currently_active.saturating_sub(1);
    drop(guard);
    schedule_eviction(inner.clone(), id.to_string());
}

fn schedule_eviction(inner: Arc<Mutex<Inner>>, id: String) {
    tokio::spawn(async move {
        tokio::time::sleep(GRACE_WINDOW).await;
        inner.lock().await.processes.remove(&id);
    });
}

#[cfg(unix)]
fn unix_signal_name(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|s| format!("SIG{}", s))
}

#[cfg(not(unix))]
fn unix_signal_name(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_runs_a_trivial_command_and_reaps_it() {
        let manager = ProcessManager::new();
        let config = AcquireConfig {
            program: "true".to_string(),
            args: vec![],
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
            mode: ProcessMode::Pipe,
            timeout: None,
            retry: None,
        };
        let spawned = manager.acquire(config).await.expect("spawn should succeed");
        assert!(manager.get(&spawned.id).await.is_some());

        // Give the reaper a moment to observe exit.
        for _ in 0..50 {
            if let Some(record) = manager.get(&spawned.id).await {
                if record.status == ProcessStatus::Completed {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("process did not reach completed status in time");
    }

    #[tokio::test]
    async fn terminate_on_unknown_id_is_a_no_op() {
        let manager = ProcessManager::new();
        manager.terminate("does-not-exist", None).await.unwrap();
    }

    #[tokio::test]
    async fn resize_on_pipe_mode_is_rejected() {
        let manager = ProcessManager::new();
        let config = AcquireConfig {
            program: "sleep".to_string(),
            args: vec!["1".to_string()],
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
            mode: ProcessMode::Pipe,
            timeout: None,
            retry: None,
        };
        let spawned = manager.acquire(config).await.expect("spawn should succeed");
        let err = manager.resize(&spawned.id, 100, 30).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        manager.terminate(&spawned.id, Some("SIGKILL")).await.unwrap();
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn resize_on_pty_mode_updates_geometry() {
        let manager = ProcessManager::new();
        let config = AcquireConfig {
            program: "sleep".to_string(),
            args: vec!["1".to_string()],
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
            mode: ProcessMode::Pty {
                cols: 80,
                rows: 24,
                term: "xterm-256color".to_string(),
            },
            timeout: None,
            retry: None,
        };
        let spawned = manager.acquire(config).await.expect("pty spawn should succeed");
        manager.resize(&spawned.id, 120, 40).await.unwrap();
        manager.terminate(&spawned.id, Some("SIGKILL")).await.unwrap();
    }
}
