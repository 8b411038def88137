//! Component H: Shutdown Manager.
//!
//! Registers for SIGINT/SIGTERM, tracks every live managed process across
//! one or more process managers, and drives the SIGTERM→poll→SIGKILL
//! escalation on shutdown. Idempotent: a shutdown already in progress makes
//! concurrent callers return immediately.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;
use crate::process::{ProcessManager, ProcessStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_millis(5000);
const KILL_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Sigint,
    Sigterm,
}

impl ShutdownSignal {
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownSignal::Sigint => 130,
            ShutdownSignal::Sigterm => 143,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownResult {
    pub terminated: Vec<String>,
    pub force_killed: Vec<String>,
    pub already_in_progress: bool,
}

struct Registration {
    manager: ProcessManager,
    process_id: String,
}

struct Inner {
    registrations: Vec<Registration>,
    in_progress: bool,
}

/// Tracks every live process across however many managers a caller wires up
/// (§4.H). One instance per engine process.
#[derive(Clone)]
pub struct ShutdownManager {
    graceful_timeout: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new(DEFAULT_GRACEFUL_TIMEOUT)
    }
}

impl ShutdownManager {
    pub fn new(graceful_timeout: Duration) -> Self {
        Self {
            graceful_timeout,
            inner: Arc::new(Mutex::new(Inner {
                registrations: Vec::new(),
                in_progress: false,
            })),
        }
    }

    pub async fn register(&self, process_id: String, manager: ProcessManager) {
        self.inner
            .lock()
            .await
            .registrations
            .push(Registration { manager, process_id });
    }

    /// Spawns the SIGINT/SIGTERM listener. Call once at startup; the
    /// returned handle resolves with the signal that triggered shutdown,
    /// after `shutdown()` has already run to completion.
    pub fn install_signal_handlers(self: Arc<Self>) -> tokio::task::JoinHandle<ShutdownSignal> {
        tokio::spawn(async move {
            let signal = wait_for_termination_signal().await;
            let _ = self.shutdown(signal).await;
            signal
        })
    }

    /// Idempotent: a concurrent call while a shutdown is running returns
    /// `already_in_progress: true` immediately rather than racing it.
    pub async fn shutdown(&self, signal: ShutdownSignal) -> Result<ShutdownResult> {
        {
            let mut inner = self.inner.lock().await;
            if inner.in_progress {
                return Ok(ShutdownResult {
                    terminated: Vec::new(),
                    force_killed: Vec::new(),
                    already_in_progress: true,
                });
            }
            inner.in_progress = true;
        }

        let registrations: Vec<(ProcessManager, String)> = {
            let inner = self.inner.lock().await;
            inner
                .registrations
                .iter()
                .map(|r| (r.manager.clone(), r.process_id.clone()))
                .collect()
        };

        let os_signal = match signal {
            ShutdownSignal::Sigint => "SIGINT",
            ShutdownSignal::Sigterm => "SIGTERM",
        };

        let mut terminated = Vec::new();
        let mut force_killed = Vec::new();

        for (manager, id) in &registrations {
            manager.terminate(id, Some(os_signal)).await?;
            if self.poll_until_terminal(manager, id, self.graceful_timeout).await {
                terminated.push(id.clone());
                continue;
            }
            manager.terminate(id, Some("SIGKILL")).await?;
            if self.poll_until_terminal(manager, id, KILL_DEADLINE).await {
                force_killed.push(id.clone());
            } else {
                // The process manager's own grace-window eviction will
                // still reap it; we've done everything we can from here.
                force_killed.push(id.clone());
            }
        }

        for (manager, _) in &registrations {
            manager.shutdown().await?;
        }

        Ok(ShutdownResult {
            terminated,
            force_killed,
            already_in_progress: false,
        })
    }

    async fn poll_until_terminal(&self, manager: &ProcessManager, id: &str, deadline: Duration) -> bool {
        let start = Instant::now();
        loop {
            match manager.get(id).await {
                None => return true,
                Some(record)
                    if record.status == ProcessStatus::Completed
                        || record.status == ProcessStatus::Crashed =>
                {
                    return true
                }
                _ => {}
            }
            if start.elapsed() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(unix)]
async fn wait_for_termination_signal() -> ShutdownSignal {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => ShutdownSignal::Sigint,
        _ = sigterm.recv() => ShutdownSignal::Sigterm,
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() -> ShutdownSignal {
    let _ = tokio::signal::ctrl_c().await;
    ShutdownSignal::Sigint
}

/// Exit code for an uncaught panic / unhandled task error (§6 signal table).
pub const FATAL_EXIT_CODE: i32 = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn shutdown_with_no_registrations_succeeds_immediately() {
        let manager = ShutdownManager::new(Duration::from_millis(200));
        let result = manager.shutdown(ShutdownSignal::Sigterm).await.unwrap();
        assert!(!result.already_in_progress);
        assert!(result.terminated.is_empty());
    }

    #[tokio::test]
    async fn concurrent_shutdown_reports_already_in_progress() {
        let manager = Arc::new(ShutdownManager::new(Duration::from_millis(500)));
        let pm = ProcessManager::new();
        let config = crate::process::AcquireConfig {
            program: "sleep".to_string(),
            args: vec!["1".to_string()],
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
            mode: crate::process::ProcessMode::Pipe,
            timeout: None,
            retry: None,
        };
        if let Ok(spawned) = pm.acquire(config).await {
            manager.register(spawned.id, pm).await;
        }

        let m1 = manager.clone();
        let m2 = manager.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { m1.shutdown(ShutdownSignal::Sigterm).await.unwrap() }),
            tokio::spawn(async move { m2.shutdown(ShutdownSignal::Sigterm).await.unwrap() }),
        );
        let (r1, r2) = (r1.unwrap(), r2.unwrap());
        assert!(r1.already_in_progress || r2.already_in_progress);
    }

    #[test]
    fn exit_codes_match_signal_convention() {
        assert_eq!(ShutdownSignal::Sigint.exit_code(), 130);
        assert_eq!(ShutdownSignal::Sigterm.exit_code(), 143);
    }

    /// S5: a child that ignores SIGTERM must be escalated to SIGKILL and
    /// reported as force-killed rather than gracefully terminated.
    #[tokio::test]
    #[cfg(unix)]
    async fn s5_graceful_then_forceful_shutdown() {
        let manager = ShutdownManager::new(Duration::from_millis(200));
        let pm = ProcessManager::new();
        let config = crate::process::AcquireConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "trap '' TERM; sleep 10".to_string()],
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
            mode: crate::process::ProcessMode::Pipe,
            timeout: None,
            retry: None,
        };
        let spawned = pm.acquire(config).await.expect("spawn should succeed");
        manager.register(spawned.id.clone(), pm.clone()).await;

        let result = manager.shutdown(ShutdownSignal::Sigterm).await.unwrap();
        assert!(!result.already_in_progress);
        assert_eq!(result.force_killed, vec![spawned.id.clone()]);
        assert!(result.terminated.is_empty());
    }
}
